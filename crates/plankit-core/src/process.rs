//! Opaque external command invocation: run to completion, report pass/fail
//! plus captured output.

use crate::error::Result;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Cap on the captured output kept for error messages.
const MAX_OUTPUT: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Combined stdout/stderr, trimmed and capped to the last few KB.
    pub fn tail(&self) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.trim().is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        };
        let trimmed = combined.trim();
        if trimmed.len() > MAX_OUTPUT {
            let mut start = trimmed.len() - MAX_OUTPUT;
            while !trimmed.is_char_boundary(start) {
                start += 1;
            }
            trimmed[start..].to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Run `program` with `args` in `cwd`, blocking until it exits.
///
/// Spawn failures surface as I/O errors; a non-zero exit is reported through
/// [`CommandOutput::success`].
pub fn run_command(program: &Path, args: &[&str], cwd: &Path) -> Result<CommandOutput> {
    debug!(program = %program.display(), ?args, cwd = %cwd.display(), "running command");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_prefers_non_empty_stream() {
        let out = CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(out.tail(), "boom");
    }

    #[test]
    fn tail_keeps_the_end_of_long_output() {
        let out = CommandOutput {
            success: true,
            code: Some(0),
            stdout: format!("{}END", "x".repeat(MAX_OUTPUT * 2)),
            stderr: String::new(),
        };
        let tail = out.tail();
        assert_eq!(tail.len(), MAX_OUTPUT);
        assert!(tail.ends_with("END"));
    }

    #[cfg(unix)]
    #[test]
    fn run_command_reports_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let ok = run_command(Path::new("sh"), &["-c", "echo hi"], dir.path()).unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = run_command(Path::new("sh"), &["-c", "exit 3"], dir.path()).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.code, Some(3));
    }
}
