use std::process::Stdio;
use std::time::Duration;

use crate::error::FleetError;

/// Captured result of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Both streams, for marker matching on tools that report errors on either.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    fn failure_message(&self) -> String {
        let msg = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if msg.is_empty() {
            "exited with a non-zero status".into()
        } else {
            msg.to_string()
        }
    }
}

/// Runs external programs. Backends go through this so tests can script replies.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run to completion. A non-zero exit is not an error here.
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, FleetError>;

    /// Run and require success, returning stdout.
    async fn checked(&self, program: &str, args: &[&str]) -> Result<String, FleetError> {
        let out = self.output(program, args).await?;
        if !out.success {
            return Err(FleetError::ExternalCommand {
                command: command_line(program, args),
                message: out.failure_message(),
            });
        }
        Ok(out.stdout)
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for a in args {
        line.push(' ');
        line.push_str(a);
    }
    line
}

/// Spawns real processes via tokio, killed if they outlive `timeout`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for ProcessRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, FleetError> {
        let line = command_line(program, args);
        tracing::debug!(command = %line, "exec");

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(res) => res.map_err(|e| FleetError::Io {
                context: format!("running {program}"),
                source: e,
            })?,
            Err(_) => {
                return Err(FleetError::Timeout {
                    command: line,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Replies to commands by prefix match and records every command line.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<(String, CommandOutput)>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        /// Later rules win over earlier ones with the same prefix.
        pub fn on(&self, prefix: &str, success: bool, stdout: &str, stderr: &str) {
            self.rules.lock().unwrap().insert(
                0,
                (
                    prefix.to_string(),
                    CommandOutput {
                        success,
                        stdout: stdout.to_string(),
                        stderr: stderr.to_string(),
                    },
                ),
            );
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, FleetError> {
            let line = command_line(program, args);
            self.calls.lock().unwrap().push(line.clone());
            let rules = self.rules.lock().unwrap();
            Ok(rules
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or(CommandOutput {
                    success: true,
                    ..CommandOutput::default()
                }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let r = ProcessRunner::new(Duration::from_secs(5));
        let out = r.output("sh", &["-c", "echo hi; echo oops >&2; exit 3"]).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.combined(), "hi\noops\n");
    }

    #[tokio::test]
    async fn checked_reports_stderr() {
        let r = ProcessRunner::new(Duration::from_secs(5));
        let err = r.checked("sh", &["-c", "echo broken >&2; exit 1"]).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh -c"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
        assert_eq!(r.checked("sh", &["-c", "echo ok"]).await.unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn times_out() {
        let r = ProcessRunner::new(Duration::from_millis(50));
        let err = r.output("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, FleetError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let r = ProcessRunner::new(Duration::from_secs(5));
        let err = r.output("definitely-not-a-real-binary-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, FleetError::Io { .. }));
    }
}
