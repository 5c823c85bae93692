/// `scripting/` - sandboxed Lua scripting core
///
/// Untrusted scripts (unit configs, mods, UI snippets) run inside a
/// `Sandbox` built on top of a shared `LuaHost`. Three independent safety
/// envelopes apply: a capability policy over the standard libraries, a
/// filesystem policy over script loading, and resource guards (memory cap,
/// instruction-hook deadline). Script errors come back as protected-call
/// results - never as a crash of the engine.
pub mod engine;
pub mod libs;
pub mod memory;
pub mod paths;
pub mod report;
pub mod sandbox;
pub mod watchdog;

pub use engine::LuaHost;
pub use libs::LuaLib;
pub use memory::{AllocError, LimitedAllocator, DEFAULT_MEMORY_LIMIT, MEM_1MB};
pub use paths::{ScriptPaths, LUA_SIGNATURE};
pub use report::{OutputCapture, RunReport};
pub use sandbox::{Preset, PrintSink, Sandbox, SandboxConfig, PRINT_PREFIX};
pub use watchdog::{GuardedScope, Watchdog, DEFAULT_CHECK_PERIOD, DEFAULT_TIME_BUDGET};
