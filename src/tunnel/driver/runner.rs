//! OS command execution
//!
//! Network drivers never spawn processes directly; they go through a
//! [`CommandRunner`] so the exact command sequence can be recorded in tests.

use crate::error::TunnelError;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, trace};

/// Result of running a command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with `stderr`
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs OS commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is not an error here
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, TunnelError>;
}

/// Render a command line for logs and errors
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn a non-zero exit into an error
pub fn check(program: &str, args: &[String], output: CommandOutput) -> Result<CommandOutput, TunnelError> {
    if output.success() {
        return Ok(output);
    }
    let stderr = output.stderr.trim().to_string();
    let lowered = stderr.to_lowercase();
    if lowered.contains("operation not permitted")
        || lowered.contains("permission denied")
        || lowered.contains("must be root")
        || lowered.contains("access is denied")
    {
        return Err(TunnelError::PrivilegeDenied(format!(
            "{}: {}",
            command_line(program, args),
            stderr
        )));
    }
    Err(TunnelError::Command {
        program: command_line(program, args),
        code: output.code,
        stderr,
    })
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, TunnelError> {
        debug!("Running: {}", command_line(program, args));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TunnelError::Command {
                program: command_line(program, args),
                code: -1,
                stderr: e.to_string(),
            })?;
        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!("{} exited with {}", program, result.code);
        Ok(result)
    }
}

struct Script {
    prefix: String,
    output: CommandOutput,
    once: bool,
}

/// Records every command and answers from a script
///
/// Commands are matched by prefix of their rendered command line; the first
/// matching entry wins and one-shot entries are consumed. Unmatched commands
/// succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    scripts: Mutex<Vec<Script>>,
}

impl RecordingRunner {
    /// Create a runner where every command succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix` with `output`
    pub fn script(&self, prefix: &str, output: CommandOutput) {
        self.push(prefix, output, false);
    }

    /// Answer the next command starting with `prefix` with `output`
    pub fn script_once(&self, prefix: &str, output: CommandOutput) {
        self.push(prefix, output, true);
    }

    fn push(&self, prefix: &str, output: CommandOutput, once: bool) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        // One-shot entries take precedence over persistent ones
        let script = Script {
            prefix: prefix.to_string(),
            output,
            once,
        };
        if once {
            scripts.insert(0, script);
        } else {
            scripts.push(script);
        }
    }

    /// Every command run so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, TunnelError> {
        let line = command_line(program, args);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.clone());

        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let found = scripts.iter().position(|s| line.starts_with(&s.prefix));
        let output = match found {
            Some(i) if scripts[i].once => scripts.remove(i).output,
            Some(i) => scripts[i].output.clone(),
            None => CommandOutput::ok(""),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_recording_runner_scripts() {
        let runner = RecordingRunner::new();
        runner.script("id -u", CommandOutput::ok("0\n"));
        runner.script_once("ip link show", CommandOutput::failed(1, "does not exist"));

        assert_eq!(runner.run("id", &args(&["-u"])).await.unwrap().stdout, "0\n");
        assert!(!runner.run("ip", &args(&["link", "show"])).await.unwrap().success());
        assert!(runner.run("ip", &args(&["link", "show"])).await.unwrap().success());
        assert_eq!(
            runner.calls(),
            vec!["id -u", "ip link show", "ip link show"]
        );
    }

    #[test]
    fn test_check_maps_errors() {
        let err = check("ip", &args(&["link"]), CommandOutput::failed(2, "RTNETLINK answers: Operation not permitted"))
            .unwrap_err();
        assert!(matches!(err, TunnelError::PrivilegeDenied(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_PRIVILEGE_REQUIRED);

        let err = check("ip", &args(&["route", "add"]), CommandOutput::failed(2, "File exists")).unwrap_err();
        match err {
            TunnelError::Command { program, code, stderr } => {
                assert_eq!(program, "ip route add");
                assert_eq!(code, 2);
                assert_eq!(stderr, "File exists");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(check("ip", &[], CommandOutput::ok("")).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner() {
        let output = SystemRunner.run("sh", &args(&["-c", "echo out; echo err >&2; exit 4"])).await.unwrap();
        assert_eq!(output.code, 4);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        assert!(SystemRunner.run("devtunnel-no-such-program", &[]).await.is_err());
    }
}
