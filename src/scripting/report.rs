/// `scripting/report.rs` - run outcomes for UIs and tooling
///
/// A `RunReport` condenses one sandbox execution into a serializable record:
/// success flag, captured print output, error text and the script line the
/// error points at. `OutputCapture` is the matching print sink that buffers
/// sandbox output instead of writing it to stdout.

use std::sync::{Arc, Mutex};

use mlua::MultiValue;
use serde::{Deserialize, Serialize};

use super::sandbox::PrintSink;

// ── OutputCapture ─────────────────────────────────────────────────────────────

/// Print sink that keeps sandbox output in memory, one framed line per
/// `print` call.
#[derive(Clone, Default)]
pub struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sink to hand to `Sandbox::with_sink`.
    pub fn sink(&self) -> PrintSink {
        let sink: PrintSink = self.buffer.clone();
        sink
    }

    /// Captured output split into lines, frames included.
    pub fn lines(&self) -> Vec<String> {
        let buffer = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buffer)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    pub fn clear(&self) {
        self.buffer.lock().unwrap().clear();
    }
}

// ── RunReport ─────────────────────────────────────────────────────────────────

/// Outcome of one script run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub success: bool,
    /// Print output captured during the run.
    pub output: Vec<String>,
    pub error: Option<String>,
    pub error_line: Option<u32>,
}

impl RunReport {
    /// Build a report from a protected-call result and the output captured
    /// alongside it.
    pub fn new(result: &mlua::Result<MultiValue>, output: Vec<String>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                output,
                error: None,
                error_line: None,
            },
            Err(err) => {
                let error = err.to_string();
                let error_line = parse_error_line(&error);
                Self {
                    success: false,
                    output,
                    error: Some(error),
                    error_line,
                }
            }
        }
    }
}

/// Parse a line number from an engine error message
/// (e.g. `[string "..."]:5: attempt to call a nil value`).
fn parse_error_line(err: &str) -> Option<u32> {
    let colon_parts: Vec<&str> = err.splitn(3, ':').collect();
    if colon_parts.len() >= 2 {
        colon_parts[1].trim().parse::<u32>().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::engine::LuaHost;
    use crate::scripting::sandbox::{Preset, Sandbox, PRINT_PREFIX};
    use std::path::Path;

    #[test]
    fn successful_run_reports_captured_output() {
        let host = LuaHost::new().unwrap();
        let capture = OutputCapture::new();
        let sandbox =
            Sandbox::with_sink(&host, Preset::Minimal, Path::new(""), &[], capture.sink())
                .unwrap();

        let result = sandbox.run("print('ready')\nreturn 1");
        let report = RunReport::new(&result, capture.lines());

        assert!(report.success);
        assert_eq!(report.output, vec![format!("{PRINT_PREFIX}ready")]);
        assert!(report.error.is_none());
        assert!(report.error_line.is_none());
    }

    #[test]
    fn failed_run_reports_the_error_line() {
        let host = LuaHost::new().unwrap();
        let capture = OutputCapture::new();
        let sandbox =
            Sandbox::with_sink(&host, Preset::Minimal, Path::new(""), &[], capture.sink())
                .unwrap();

        // Line 2 calls a nil value.
        let result = sandbox.run("local x = 1\nnot_a_function()");
        let report = RunReport::new(&result, capture.lines());

        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[test]
    fn capture_clear_discards_previous_output() {
        let host = LuaHost::new().unwrap();
        let capture = OutputCapture::new();
        let sandbox =
            Sandbox::with_sink(&host, Preset::Minimal, Path::new(""), &[], capture.sink())
                .unwrap();

        sandbox.run("print('one')").unwrap();
        assert_eq!(capture.lines().len(), 1);

        capture.clear();
        sandbox.run("print('two')").unwrap();
        assert_eq!(capture.lines(), vec![format!("{PRINT_PREFIX}two")]);
    }

    #[test]
    fn parse_error_line_reads_the_chunk_position() {
        assert_eq!(parse_error_line("script.lua:5: attempt to index a nil value"), Some(5));
        assert_eq!(parse_error_line("no position here"), None);
    }
}
