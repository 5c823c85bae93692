pub mod scripting;
pub mod util;
