use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::ExitError;

/// Result of running a subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, the usual shape for one-line answers like `git rev-parse`.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for running external tools (git, launchctl, the coding agent).
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Build from an argv list (`["launchctl", "stop", "svc"]`).
    pub fn from_argv(argv: &[String]) -> anyhow::Result<Self> {
        let (program, rest) = argv.split_first().context("empty command line")?;
        let mut tool = Self::new(program);
        tool.args.extend(rest.iter().cloned());
        Ok(tool)
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Set a timeout for the subprocess.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run in the given directory instead of the current one.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Set an extra environment variable for the child.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the tool, capturing stdout and stderr.
    ///
    /// Both pipes are drained on background threads so a chatty child never
    /// blocks on a full pipe while we wait on it.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| self.not_found_or_other(e))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout, &self.program)?,
            None => child
                .wait()
                .with_context(|| format!("waiting for {}", self.program))?,
        };

        Ok(RunOutput {
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.program.clone(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("spawning {}", self.program))
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    tool_name: &str,
) -> anyhow::Result<ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExitError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}")));
            }
        }
    }
}

/// Truncate a string to at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_echo() {
        let output = Tool::new("echo").arg("hello").run().unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_trimmed(), "hello");
    }

    #[test]
    fn run_false_fails() {
        let output = Tool::new("false").run().unwrap();
        assert!(!output.success());
    }

    #[test]
    fn run_ok_returns_error_on_failure() {
        let err = Tool::new("false").run_ok().unwrap_err();
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn run_not_found() {
        let err = Tool::new("nonexistent-tool-xyz").run().unwrap_err();
        let exit_err = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit_err, ExitError::ToolNotFound { .. }));
    }

    #[test]
    fn run_with_timeout_kills_slow_child() {
        let err = Tool::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(err.downcast_ref::<ExitError>().unwrap().is_timeout());
    }

    #[test]
    fn run_in_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let output = Tool::new("sh")
            .args(&["-c", "pwd; echo \"$EVOLVER_TEST_VAR\""])
            .current_dir(dir.path())
            .env("EVOLVER_TEST_VAR", "set")
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines[1], "set");
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(lines[0]).canonicalize().unwrap(), canonical);
    }

    #[test]
    fn large_output_does_not_block() {
        let output = Tool::new("sh")
            .args(&["-c", "head -c 300000 /dev/zero | tr '\\0' 'a'"])
            .timeout(Duration::from_secs(10))
            .run()
            .unwrap();
        assert_eq!(output.stdout.len(), 300_000);
    }

    #[test]
    fn from_argv_splits_program() {
        let tool = Tool::from_argv(&["launchctl".into(), "stop".into(), "svc".into()]).unwrap();
        assert_eq!(tool.program(), "launchctl");
        assert!(Tool::from_argv(&[]).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
