// src/native/command.rs

//! Run a native tool with a timeout and captured output

use crate::{NativeOperation, NativeToolError, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// Captured output of a successful tool invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...`, failing on non-zero exit or timeout
///
/// Output is drained on reader threads so a chatty tool cannot block on a
/// full pipe while we wait for it.
pub fn run_tool(
    program: &str,
    args: &[String],
    timeout: Duration,
    operation: NativeOperation,
) -> Result<ToolOutput> {
    debug!("Executing: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            NativeToolError::new(program, operation, None, format!("failed to spawn: {}", e))
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(NativeToolError::new(
                program,
                operation,
                None,
                format!("timed out after {} seconds", timeout.as_secs()),
            )
            .into());
        }
    };

    let output = ToolOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        trace!("[{}] {}", program, line);
    }

    if status.success() {
        Ok(output)
    } else {
        Err(NativeToolError::new(
            program,
            operation,
            Some(status.code().unwrap_or(-1)),
            failure_message(&output),
        )
        .into())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Most useful line of a failed tool's output
///
/// DISM prints `Error: 0x...` followed by a description on stdout; reg.exe
/// writes `ERROR: ...` to stderr.
fn failure_message(output: &ToolOutput) -> String {
    let lines = output
        .stderr
        .lines()
        .chain(output.stdout.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty());

    let mut last = None;
    for line in lines {
        if line.to_ascii_lowercase().starts_with("error") {
            return line.to_string();
        }
        last = Some(line);
    }
    last.unwrap_or("no output").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_failure_message_prefers_error_line() {
        let output = ToolOutput {
            stdout: "Deployment Image Servicing\n\nError: 0xc1420116\n\nThe log file is here\n"
                .to_string(),
            stderr: String::new(),
        };
        assert_eq!(failure_message(&output), "Error: 0xc1420116");

        let output = ToolOutput {
            stdout: "first\nlast\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(failure_message(&output), "last");
        assert_eq!(failure_message(&ToolOutput::default()), "no output");
    }

    #[test]
    fn test_spawn_failure_has_no_exit_code() {
        let result = run_tool(
            "wimsmith-definitely-not-a-tool",
            &[],
            Duration::from_secs(5),
            NativeOperation::Mount,
        );
        match result {
            Err(Error::NativeTool(e)) => {
                assert!(e.exit_code.is_none());
                assert!(!e.is_transient());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_and_output() {
        let ok = run_tool(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            Duration::from_secs(5),
            NativeOperation::ListMounts,
        )
        .unwrap();
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = run_tool(
            "sh",
            &["-c".to_string(), "echo 'ERROR: in use' >&2; exit 32".to_string()],
            Duration::from_secs(5),
            NativeOperation::HiveUnload,
        );
        match failed {
            Err(Error::NativeTool(e)) => {
                assert_eq!(e.exit_code, Some(32));
                assert_eq!(e.message, "ERROR: in use");
                assert!(e.is_transient());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_process() {
        let result = run_tool(
            "sh",
            &["-c".to_string(), "sleep 10".to_string()],
            Duration::from_millis(100),
            NativeOperation::Mount,
        );
        match result {
            Err(Error::NativeTool(e)) => assert!(e.message.contains("timed out")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
