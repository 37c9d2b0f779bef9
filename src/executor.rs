//! Runs shell commands inside a provisioned root through the sandbox binary.

use crate::cancel::{kill_group, OpContext};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::events::{EventSink, OutputLine, Stream};
use crate::toolkit::Toolkit;
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Host pseudo-filesystems bound into every sandbox
const BIND_MOUNTS: [&str; 3] = ["/dev", "/proc", "/sys"];
const SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// How long output readers may keep draining after the process is gone
const GRACE_PERIOD: Duration = Duration::from_secs(3);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub environment_id: String,
    pub command: String,
    pub working_dir: String,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(environment_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            command: command.into(),
            working_dir: "/".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    /// A result for a command that never ran.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct Executor<'a> {
    toolkit: &'a Toolkit,
}

impl<'a> Executor<'a> {
    pub fn new(toolkit: &'a Toolkit) -> Self {
        Self { toolkit }
    }

    /// Run `request` and always produce a result. A command that overruns its
    /// timeout is killed together with its process group and reported with
    /// exit code -1; failures to start report -1 with the reason in stderr.
    pub fn run(&self, request: &ExecutionRequest, ctx: &OpContext) -> ExecutionResult {
        match self.try_run(request, ctx) {
            Ok(result) => result,
            Err(err) => {
                warn!(env = %request.environment_id, error = %err, "command could not be run");
                ExecutionResult::failure(err.to_string())
            }
        }
    }

    fn try_run(&self, request: &ExecutionRequest, ctx: &OpContext) -> Result<ExecutionResult> {
        let env = Environment::new(&self.toolkit.config, &request.environment_id)?;
        let binary = &self.toolkit.binary;
        if !binary.exists() {
            return Ok(ExecutionResult::failure("proot not found — run setup again"));
        }
        fs::create_dir_all(env.tmp_dir())?;
        fs::create_dir_all(self.toolkit.config.data_dir())?;

        let mut command = Command::new(binary.path());
        command
            .args(arguments(&env, request))
            .current_dir(self.toolkit.config.data_dir())
            .envs(sandbox_environment(&env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", binary.path().display()))?;
        let pgid = child.id();
        ctx.process.set(pgid);
        debug!(env = %env.id(), pgid, command = %request.command, "sandboxed command started");

        let stdout = spawn_reader(child.stdout.take(), Stream::Stdout, self.toolkit.sink.clone());
        let stderr = spawn_reader(child.stderr.take(), Stream::Stderr, self.toolkit.sink.clone());

        let waited = child.wait_timeout(request.timeout);
        // Take down anything the command left behind in its group
        kill_group(pgid);
        let status = match waited {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                None
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                ctx.process.clear();
                return Err(Error::Io(err));
            }
        };
        ctx.process.clear();

        let stdout = stdout.map(Reader::collect).unwrap_or_default();
        let mut stderr = stderr.map(Reader::collect).unwrap_or_default();

        let result = match status {
            Some(status) => ExecutionResult {
                stdout,
                stderr,
                exit_code: exit_code(status),
            },
            None => {
                let millis = request.timeout.as_millis() as u64;
                info!(env = %env.id(), millis, "sandboxed command timed out");
                stderr.push_str(&Error::TimeoutExpired { millis }.to_string());
                ExecutionResult {
                    stdout,
                    stderr,
                    exit_code: -1,
                }
            }
        };
        debug!(env = %env.id(), exit_code = result.exit_code, "sandboxed command finished");
        Ok(result)
    }
}

/// The sandbox invocation: new root, working directory, bind mounts, fake
/// root identity and the shell running `command`.
pub fn arguments(env: &Environment, request: &ExecutionRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--kill-on-exit".into(),
        "-r".into(),
        env.root().into(),
        "-w".into(),
        request.working_dir.clone().into(),
    ];
    for mount in BIND_MOUNTS {
        args.push("-b".into());
        args.push(mount.into());
    }
    args.push("-0".into());
    args.push(env.shell().into());
    args.push("-c".into());
    args.push(request.command.clone().into());
    args
}

/// Environment for the sandbox process. Passed through the process launch
/// rather than a sandbox flag, which older proot builds lack.
pub fn sandbox_environment(env: &Environment) -> Vec<(&'static str, OsString)> {
    vec![
        ("HOME", "/root".into()),
        ("PATH", SEARCH_PATH.into()),
        ("LANG", "C.UTF-8".into()),
        ("TERM", "xterm-256color".into()),
        ("PROOT_TMP_DIR", env.tmp_dir().into()),
        ("PYTHONDONTWRITEBYTECODE", "1".into()),
        ("PIP_NO_CACHE_DIR", "off".into()),
        ("PROOT_NO_SECCOMP", "1".into()),
    ]
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// A thread draining one output pipe line by line into a buffer while
/// forwarding each line to the sink.
struct Reader {
    handle: JoinHandle<()>,
    buffer: Arc<Mutex<String>>,
}

impl Reader {
    /// Wait up to the grace period for the pipe to close, then take whatever
    /// has been buffered.
    fn collect(self) -> String {
        let deadline = Instant::now() + GRACE_PERIOD;
        while !self.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        } else {
            warn!("output reader still busy after grace period, returning partial output");
        }
        let mut buffer = self.buffer.lock();
        std::mem::take(&mut *buffer)
    }
}

fn spawn_reader<R>(pipe: Option<R>, stream: Stream, sink: Arc<dyn EventSink>) -> Option<Reader>
where
    R: Read + Send + 'static,
{
    let pipe = pipe?;
    let buffer = Arc::new(Mutex::new(String::new()));
    let shared = buffer.clone();

    let handle = std::thread::Builder::new()
        .name(format!("{stream:?}-reader").to_lowercase())
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&raw);
                        let line = text.strip_suffix('\n').unwrap_or(&text);
                        {
                            let mut buffer = shared.lock();
                            buffer.push_str(line);
                            buffer.push('\n');
                        }
                        // The captured output keeps carriage returns, live lines do not
                        sink.output(OutputLine {
                            stream,
                            line: line.strip_suffix('\r').unwrap_or(line).to_string(),
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(error = %err, "output pipe read failed");
                        break;
                    }
                }
            }
        })
        .ok()?;

    Some(Reader { handle, buffer })
}
