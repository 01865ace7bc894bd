use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("Failed to execute command: {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}\n{stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

impl CmdError {
    pub fn stderr(&self) -> &str {
        match self {
            CmdError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// A builder for executing external commands with unified error handling
pub struct Cmd {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
    secrets: Vec<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            timeout: None,
            secrets: Vec::new(),
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

    pub fn workdir(mut self, path: &Path) -> Self {
        self.workdir = Some(path.to_path_buf());
        self
    }

    /// Kill the child and fail if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Values masked wherever the command or its stderr is logged or reported.
    pub fn redact<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets.extend(
            secrets
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty()),
        );
        self
    }

    fn scrub(&self, text: String) -> String {
        self.secrets
            .iter()
            .fold(text, |text, secret| text.replace(secret.as_str(), "***"))
    }

    pub fn display(&self) -> String {
        let shown = if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        };
        self.scrub(shown)
    }

    /// Execute the command and return the output.
    /// Returns an error if the command fails (non-zero exit code) or times out.
    pub fn run(self) -> Result<Output, CmdError> {
        let shown = self.display();
        let workdir_display = self.workdir.as_ref().map(|p| p.display().to_string());
        trace!(command = %shown, workdir = ?workdir_display, "cmd:run start");

        let output = self.output(&shown)?;

        if !output.status.success() {
            let stderr = self.scrub(String::from_utf8_lossy(&output.stderr).trim().to_string());
            debug!(
                command = %shown,
                status = ?output.status.code(),
                stderr = %stderr,
                "cmd:run failure"
            );
            return Err(CmdError::Failed {
                command: shown,
                status: output.status.code(),
                stderr,
            });
        }
        trace!(command = %shown, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String, CmdError> {
        let output = self.run()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn output(&self, shown: &str) -> Result<Output, CmdError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: a terminal Ctrl-C must not kill a half-done replace.
            .process_group(0);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let Some(timeout) = self.timeout else {
            return cmd.output().map_err(|source| CmdError::Spawn {
                command: shown.to_string(),
                source,
            });
        };

        let mut child = cmd.spawn().map_err(|source| CmdError::Spawn {
            command: shown.to_string(),
            source,
        })?;

        // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(command = %shown, secs = timeout.as_secs(), "cmd:timeout, killing child");
                let _ = child.kill();
                let _ = child.wait();
                return Err(CmdError::Timeout {
                    command: shown.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            Err(source) => {
                return Err(CmdError::Spawn {
                    command: shown.to_string(),
                    source,
                });
            }
        };

        Ok(Output {
            status,
            stdout: stdout.map(join_drain).unwrap_or_default(),
            stderr: stderr.map(join_drain).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
