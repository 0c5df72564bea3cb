//! Child-process execution with captured output and a hard deadline.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A program run without a shell. Secrets travel through the environment only.
#[derive(Debug, Clone, Builder)]
pub struct ToolInvocation {
    #[builder(into)]
    program: PathBuf,
    #[builder(default)]
    args: Vec<OsString>,
    #[builder(default)]
    secret_envs: Vec<(String, RedactedString)>,
    timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolInvocation {
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .to_string()
    }

    /// Runs to completion. A non-zero exit becomes [`Error::ToolExecution`]; running past the
    /// timeout kills the child and becomes [`Error::ToolTimeout`].
    pub fn run(&self) -> Result<ToolOutput> {
        let tool = self.tool_name();
        tracing::debug!("Running {} with {} args", tool, self.args.len());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.secret_envs {
            command.env(key, value.secret());
        }

        let mut child = command
            .spawn()
            .map_err(Error::from)
            .add_msg(format!("Failed to start {}", tool))?;
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status: Option<ExitStatus> = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    tracing::warn!("{} exceeded {:?}, killing it", tool, self.timeout);
                    if let Err(e) = child.kill() {
                        tracing::warn!("Failed to kill {}: {}", tool, e);
                    }
                    child.wait()?;
                    break None;
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let output = ToolOutput {
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
        };

        match status {
            None => Err(Error::ToolTimeout {
                tool,
                timeout: self.timeout,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Some(status) if !status.success() => Err(Error::ToolExecution {
                tool,
                exit_code: status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Some(_) => Ok(output),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                tracing::debug!("Stopped reading child output: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}
