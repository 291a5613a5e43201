//! Unified subprocess helper for the external tools the engine drives
//! (`codesign`, `killall`, `open`, the icon renderer).
//!
//! Wraps `Command::new(resolve_cli(name))`, captures output, and returns
//! typed results with consistent error handling.

use std::fmt;
use std::path::Path;
use std::process::Command;

use crate::cli::resolve_cli;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Error from an external tool invocation.
#[derive(Debug)]
pub enum ToolError {
    /// The process could not be spawned (missing binary, permission error).
    SpawnFailed { program: String, source: std::io::Error },
    /// The tool exited with a non-zero status code.
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed { program, source } => write!(f, "Failed to spawn {program}: {source}"),
            Self::NonZeroExit {
                program,
                code,
                stderr,
            } => {
                let code_str = code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                if stderr.is_empty() {
                    write!(f, "{program} exited with code {code_str}")
                } else {
                    write!(f, "{program} exited with code {code_str}: {stderr}")
                }
            }
        }
    }
}

impl std::error::Error for ToolError {}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and running an external tool.
///
/// # Examples
/// ```ignore
/// tool_cmd("codesign")
///     .args(&["--force", "--deep", "--sign", "-"])
///     .arg_path(bundle)
///     .run()?;
/// ```
pub struct ToolCmd {
    program: String,
    cmd: Command,
}

impl ToolCmd {
    pub fn arg(mut self, arg: &str) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.cmd.args(args);
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.cmd.arg(path);
        self
    }

    /// Run the tool, requiring success (non-zero exit -> `Err`).
    /// Returns trimmed stdout.
    pub fn run(mut self) -> Result<String, ToolError> {
        let output = self.cmd.output().map_err(|source| ToolError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ToolError::NonZeroExit {
                program: self.program,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Create a command builder for `program`, resolved against well-known
/// binary directories when it is a bare name.
pub fn tool_cmd(program: &str) -> ToolCmd {
    let resolved = if program.contains('/') {
        program.to_string()
    } else {
        resolve_cli(program)
    };
    ToolCmd {
        program: program.to_string(),
        cmd: Command::new(resolved),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn run_returns_trimmed_stdout() {
        let out = tool_cmd("sh").args(&["-c", "echo '  hello  '"]).run().unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn non_zero_exit_carries_code_and_stderr() {
        let err = tool_cmd("sh")
            .args(&["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        match &err {
            ToolError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.to_string(), "sh exited with code 3: boom");
    }

    #[test]
    fn missing_binary_is_spawn_failure() {
        let err = tool_cmd("/nonexistent/docktile-tool-xyz").run().unwrap_err();
        assert!(matches!(err, ToolError::SpawnFailed { .. }));
    }
}
