//! Process-backed suites.
//!
//! A [`ProcessSuite`] runs one shell command per suite as a child process of
//! the scheduler. The command learns which environment it was assigned
//! through environment variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `SUITE_NAME` | The suite's name |
//! | `HANDLER_CONFIGURATION` | Name of the assigned environment config |
//! | `ENVIRONMENT_ID` | The config's `env` resource identifier |
//! | `ENVIRONMENT_TAGS` | The config's tags, comma separated |
//! | `SUITE_VARIABLES` | The `[variables]` table as JSON |
//! | `SUITE_REPORTS_DIR` | Per-suite directory for reports, if configured |
//!
//! stdout and stderr are streamed line by line into `tracing` at debug level
//! and, when a log directory is set, into `<log_dir>/<suite>.log`.
//!
//! # Example Configuration
//!
//! ```toml
//! [process]
//! shell = "/bin/bash"
//! working_dir = "~/system-tests"
//!
//! [[suites]]
//! name = "hello-world"
//! requires = ["aws"]
//! command = "./run-suite.sh hello_world"
//! ```

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, warn};

use super::{Suite, SuiteError, SuiteResult};
use crate::config::{Config, SuiteConfig};
use crate::environment::EnvironmentConfig;

/// A line of suite output, tagged with its stream.
#[derive(Debug, Clone)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Suite that runs a shell command as a local child process.
///
/// `is_running` is answered with a non-blocking `try_wait` on the child;
/// the exit code is remembered and a non-zero code makes
/// [`failed`](Suite::failed) return `true`. On Unix the command runs in its
/// own process group, and `terminate` kills the whole group before reaping
/// the child, so nothing the command started outlives it. Once the child
/// has exited `terminate` is a no-op.
pub struct ProcessSuite {
    name: String,
    command: String,
    shell: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    variables: String,
    log_dir: Option<PathBuf>,
    child: tokio::sync::Mutex<Option<Child>>,
    exit_code: Mutex<Option<i32>>,
}

impl ProcessSuite {
    /// Creates a suite running `command` with `/bin/sh`.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            shell: "/bin/sh".to_string(),
            working_dir: None,
            env: Vec::new(),
            variables: "{}".to_string(),
            log_dir: None,
            child: tokio::sync::Mutex::new(None),
            exit_code: Mutex::new(None),
        }
    }

    /// Builds a suite from its config entry and the shared process settings.
    ///
    /// The suite's own `working_dir` wins over `[process].working_dir`; both
    /// have `~` and environment variables expanded. Per-suite `env` entries
    /// override `[process.env]`.
    pub fn from_config(suite: &SuiteConfig, config: &Config) -> anyhow::Result<Self> {
        let working_dir = suite
            .working_dir
            .as_ref()
            .or(config.process.working_dir.as_ref())
            .map(|dir| expand_path(dir))
            .transpose()?;

        let variables = serde_json::to_string(&config.variables)
            .context("Failed to serialize [variables] as JSON")?;

        let mut env: Vec<(String, String)> = config
            .process
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(suite.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut process = ProcessSuite::new(&suite.name, &suite.command)
            .with_shell(&config.process.shell)
            .with_variables(variables)
            .with_log_dir(&config.report.output_dir);
        process.working_dir = working_dir;
        process.env = env;
        Ok(process)
    }

    /// Sets the shell used to run the command (`<shell> -c <command>`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the working directory of the child process.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for the child process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON exported as `SUITE_VARIABLES`.
    pub fn with_variables(mut self, json: impl Into<String>) -> Self {
        self.variables = json.into();
        self
    }

    /// Directory receiving `<suite>.log` and the per-suite reports directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Exit code of the child, once it has been observed to exit.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|guard| *guard)
    }

    fn record_exit(&self, code: i32) {
        if let Ok(mut guard) = self.exit_code.lock() {
            guard.get_or_insert(code);
        }
    }

    /// Folds one `try_wait` result into the exit code; `true` while running.
    ///
    /// A child that can no longer be polled counts as stopped and failed.
    fn observe(&self, polled: std::io::Result<Option<ExitStatus>>) -> bool {
        match polled {
            Ok(Some(status)) => {
                self.record_exit(status.code().unwrap_or(-1));
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(suite = %self.name, "Failed to poll suite process: {}", e);
                self.record_exit(-1);
                false
            }
        }
    }

    fn reports_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join(&self.name))
    }
}

#[async_trait]
impl Suite for ProcessSuite {
    async fn start(&self, target: &EnvironmentConfig) -> SuiteResult<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(SuiteError::StartFailed(format!(
                "suite '{}' was already started",
                self.name
            )));
        }

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&self.command);

        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }

        for (key, value) in &self.env {
            process.env(key, value);
        }
        process
            .env("SUITE_NAME", &self.name)
            .env("HANDLER_CONFIGURATION", &target.name)
            .env("ENVIRONMENT_ID", &target.env)
            .env("ENVIRONMENT_TAGS", target.tags_csv())
            .env("SUITE_VARIABLES", &self.variables);

        if let Some(reports_dir) = self.reports_dir() {
            tokio::fs::create_dir_all(&reports_dir).await?;
            process.env("SUITE_REPORTS_DIR", &reports_dir);
        }

        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process
            .spawn()
            .map_err(|e| SuiteError::StartFailed(format!("{}: {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SuiteError::StartFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SuiteError::StartFailed("stderr not captured".to_string()))?;

        let log_file = match &self.log_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.log", self.name));
                match open_log(&path).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!(suite = %self.name, "Failed to open {}: {}", path.display(), e);
                        None
                    }
                }
            }
            None => None,
        };
        tokio::spawn(pump_output(self.name.clone(), stdout, stderr, log_file));

        debug!(suite = %self.name, config = %target.name, "spawned suite process");
        *guard = Some(child);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };

        let polled = child.try_wait();
        self.observe(polled)
    }

    async fn terminate(&self) -> SuiteResult<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status.code().unwrap_or(-1));
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            kill_group(pid)?;
        }
        child
            .kill()
            .await
            .map_err(|e| SuiteError::TerminateFailed(e.to_string()))?;
        self.record_exit(-1);
        Ok(())
    }

    fn failed(&self) -> bool {
        self.exit_code().is_some_and(|code| code != 0)
    }
}

/// Sends SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) -> SuiteResult<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| SuiteError::TerminateFailed(format!("pid {} out of range", pid)))?;
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(SuiteError::TerminateFailed(err.to_string()));
        }
    }
    Ok(())
}

/// Forwards child output to tracing and, optionally, a log file.
async fn pump_output(
    suite: String,
    stdout: ChildStdout,
    stderr: ChildStderr,
    mut log_file: Option<tokio::fs::File>,
) {
    let stdout_stream =
        tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines()).map(
            |line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()),
        );
    let stderr_stream =
        tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines()).map(
            |line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()),
        );
    let mut combined = stream::select(stdout_stream, stderr_stream);

    while let Some(line) = combined.next().await {
        let text = match &line {
            OutputLine::Stdout(s) => {
                debug!(suite = %suite, "stdout: {}", s);
                s
            }
            OutputLine::Stderr(s) => {
                debug!(suite = %suite, "stderr: {}", s);
                s
            }
        };

        if let Some(file) = log_file.as_mut() {
            let written = async {
                file.write_all(text.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                warn!(suite = %suite, "Failed to write suite log: {}", e);
                log_file = None;
            }
        }
    }

    if let Some(mut file) = log_file {
        file.flush().await.ok();
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await
}

fn expand_path(path: &Path) -> anyhow::Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
