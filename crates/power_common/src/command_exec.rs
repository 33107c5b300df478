//! Command execution layer
//!
//! Every system command is a program plus an argument vector. Nothing is
//! ever assembled into a shell string, so request fields cannot smuggle
//! shell syntax into a privileged command.
//!
//! Privileged commands are prefixed with the configured privilege wrapper
//! (`sudo -n` by default, nothing when the daemon already runs as root).

use crate::error::{PowerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Maximum output length to keep per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// A command to run: program, arguments, extra environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, then closed
    pub stdin: Option<String>,
    pub privileged: bool,
}

impl SystemCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            privileged: false,
        }
    }

    /// A command that needs root
    pub fn privileged(program: impl Into<String>) -> Self {
        Self {
            privileged: true,
            ..Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Final argv once the privilege wrapper is applied.
    ///
    /// The wrapper resets the environment, so extra variables travel
    /// through `env K=V` after it.
    pub fn argv(&self, wrapper: &[String]) -> Vec<String> {
        let mut argv = Vec::new();
        if self.privileged && !wrapper.is_empty() {
            argv.extend(wrapper.iter().cloned());
            if !self.env.is_empty() {
                argv.push("env".to_string());
                argv.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Human-readable form for logs
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

/// What a finished command produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The opaque `run(cmd) -> (exit_code, stdout, stderr)` primitive
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion under the runner's deadline.
    async fn run(&self, cmd: &SystemCommand) -> Result<CommandOutput>;

    /// Start and return immediately; the child outlives the caller.
    fn spawn_detached(&self, cmd: &SystemCommand) -> Result<()>;
}

/// Runs commands on the host through tokio::process
#[derive(Debug, Clone)]
pub struct HostCommandRunner {
    privilege_wrapper: Vec<String>,
    timeout: Duration,
}

impl HostCommandRunner {
    pub fn new(privilege_wrapper: Vec<String>, timeout: Duration) -> Self {
        Self {
            privilege_wrapper,
            timeout,
        }
    }

    fn build(&self, cmd: &SystemCommand) -> Result<tokio::process::Command> {
        let argv = cmd.argv(&self.privilege_wrapper);
        let (program, args) = argv.split_first().ok_or_else(|| PowerError::Command {
            program: cmd.program.clone(),
            message: "empty command".to_string(),
        })?;

        let mut command = tokio::process::Command::new(program);
        command.args(args);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        Ok(command)
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, cmd: &SystemCommand) -> Result<CommandOutput> {
        debug!("run: {}", cmd.display());
        let mut command = self.build(cmd)?;
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let running = collect(command, cmd.stdin.as_deref());
        let output = match tokio::time::timeout(self.timeout, running).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PowerError::Command {
                    program: cmd.program.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                warn!("command timed out after {:?}: {}", self.timeout, cmd.display());
                return Err(PowerError::Command {
                    program: cmd.program.clone(),
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&output.stdout),
            stderr: truncate_output(&output.stderr),
        };
        if !result.success() {
            debug!(
                "command exited {}: {} ({})",
                result.exit_code,
                cmd.display(),
                result.stderr.trim()
            );
        }
        Ok(result)
    }

    fn spawn_detached(&self, cmd: &SystemCommand) -> Result<()> {
        let mut command = self.build(cmd)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|e| PowerError::Command {
            program: cmd.program.clone(),
            message: e.to_string(),
        })?;
        info!("started detached: {}", cmd.display());

        // Reap the child so it never lingers as a zombie
        let shown = cmd.display();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("detached command finished ({}): {}", status, shown),
                Err(e) => warn!("detached command lost ({}): {}", e, shown),
            }
        });
        Ok(())
    }
}

async fn collect(
    mut command: tokio::process::Command,
    input: Option<&str>,
) -> std::io::Result<std::process::Output> {
    let mut child = command.spawn()?;
    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await?;
        // dropping stdin closes it so the child sees EOF
    }
    child.wait_with_output().await
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Scripted runner for tests
///
/// Responses are matched by program name; anything unscripted succeeds with
/// empty output. Every call is recorded, detached or not.
#[derive(Debug, Default, Clone)]
pub struct FakeCommandRunner {
    responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    calls: Arc<Mutex<Vec<SystemCommand>>>,
    detached: Arc<Mutex<Vec<SystemCommand>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every run of `program` with `output`.
    pub fn respond(&self, program: &str, output: CommandOutput) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((program.to_string(), output));
        self
    }

    pub fn calls(&self) -> Vec<SystemCommand> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn detached(&self) -> Vec<SystemCommand> {
        self.detached.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether any run or spawn used `program` with `args` in order.
    pub fn ran(&self, program: &str, args: &[&str]) -> bool {
        self.calls()
            .iter()
            .chain(self.detached().iter())
            .any(|c| c.program == program && c.args.iter().map(String::as_str).eq(args.iter().copied()))
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, cmd: &SystemCommand) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd.clone());
        let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(responses
            .iter()
            .rev()
            .find(|(program, _)| *program == cmd.program)
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn spawn_detached(&self, cmd: &SystemCommand) -> Result<()> {
        self.detached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sudo() -> Vec<String> {
        vec!["sudo".to_string(), "-n".to_string()]
    }

    #[test]
    fn test_unprivileged_argv_ignores_wrapper() {
        let cmd = SystemCommand::new("timedatectl").arg("show");
        assert_eq!(cmd.argv(&sudo()), vec!["timedatectl", "show"]);
    }

    #[test]
    fn test_privileged_argv_uses_wrapper() {
        let cmd = SystemCommand::privileged("hwclock").arg("-w");
        assert_eq!(cmd.argv(&sudo()), vec!["sudo", "-n", "hwclock", "-w"]);
        assert_eq!(cmd.argv(&[]), vec!["hwclock", "-w"]);
    }

    #[test]
    fn test_privileged_env_passes_through_env() {
        let cmd = SystemCommand::privileged("bash")
            .arg("/data/live_system_update.sh")
            .env("REBOOT_WHEN_DONE", "yes");
        assert_eq!(
            cmd.argv(&sudo()),
            vec![
                "sudo",
                "-n",
                "env",
                "REBOOT_WHEN_DONE=yes",
                "bash",
                "/data/live_system_update.sh"
            ]
        );
    }

    #[test]
    fn test_argument_is_never_split() {
        let cmd = SystemCommand::privileged("date").args(["--set", "2024-01-01 12:30:00; rm -rf /"]);
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.args[1], "2024-01-01 12:30:00; rm -rf /");
    }

    #[test]
    fn test_truncate_output_keeps_char_boundary() {
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let out = truncate_output(long.as_bytes());
        assert!(out.len() <= MAX_OUTPUT_BYTES);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_fake_runner_scripted_response() {
        let fake = FakeCommandRunner::new();
        fake.respond("timedatectl", CommandOutput::ok("NTP=no\n"));

        let out = fake
            .run(&SystemCommand::new("timedatectl").arg("show"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "NTP=no\n");
        assert!(fake.ran("timedatectl", &["show"]));

        let other = fake.run(&SystemCommand::new("dmesg")).await.unwrap();
        assert!(other.success());
        assert!(other.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_host_runner_captures_exit_code() {
        let runner = HostCommandRunner::new(Vec::new(), Duration::from_secs(5));
        let out = runner
            .run(&SystemCommand::new("sh").args(["-c", "echo hi; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_host_runner_feeds_stdin() {
        let runner = HostCommandRunner::new(Vec::new(), Duration::from_secs(5));
        let out = runner
            .run(&SystemCommand::new("cat").stdin("ds1307 0x68\n"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "ds1307 0x68\n");
    }

    #[tokio::test]
    async fn test_host_runner_times_out() {
        let runner = HostCommandRunner::new(Vec::new(), Duration::from_millis(100));
        let err = runner
            .run(&SystemCommand::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, PowerError::Command { .. }));
    }

    #[tokio::test]
    async fn test_host_runner_missing_program() {
        let runner = HostCommandRunner::new(Vec::new(), Duration::from_secs(1));
        let err = runner
            .run(&SystemCommand::new("definitely-not-a-real-program-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, PowerError::Command { .. }));
    }
}
