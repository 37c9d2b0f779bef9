//! Async façade over the blocking pipeline.
//!
//! Every operation runs on tokio's blocking pool so callers on the async side
//! never wait on network reads, archive entries or child processes. Progress,
//! command output and update notices are published on a broadcast channel;
//! subscribe before starting an operation to see all of its events.

use crate::cancel::OpContext;
use crate::config::Config;
use crate::env::{device_abi, Environment};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::executor::{ExecutionRequest, ExecutionResult, Executor};
use crate::provision::{Distro, Provisioner};
use crate::sandbox::{check_for_update, SandboxBinary, UpdateReport};
use crate::toolkit::Toolkit;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 1024;
const MB: u64 = 1_048_576;

/// Terminal outcome of a setup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SetupOutcome {
    Ready { path: PathBuf },
    Cancelled,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub data_dir: PathBuf,
    pub env_root: PathBuf,
    pub free_space_mb: u64,
    pub total_space_mb: u64,
    pub sandbox_version: Option<String>,
    pub sandbox_sha256: Option<String>,
}

type Registry = Arc<Mutex<HashMap<u64, OpContext>>>;

/// Keeps an operation's context reachable by [`Service::cancel_setup`] while
/// the operation runs.
struct Registration {
    id: u64,
    ctx: OpContext,
    registry: Registry,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

pub struct Service {
    config: Arc<Config>,
    binary: Arc<SandboxBinary>,
    events: broadcast::Sender<Event>,
    operations: Registry,
    next_id: AtomicU64,
}

impl Service {
    pub fn new(config: Config) -> Self {
        let binary = Arc::new(SandboxBinary::from_config(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: Arc::new(config),
            binary,
            events,
            operations: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Provision `env_id` with `distro`. Never fails: errors come back as
    /// [`SetupOutcome::Failed`] carrying the underlying message.
    pub async fn setup_environment(&self, distro: Distro, env_id: &str) -> SetupOutcome {
        let env = match Environment::new(&self.config, env_id) {
            Ok(env) => env,
            Err(err) => {
                return SetupOutcome::Failed {
                    message: err.to_string(),
                }
            }
        };

        let registration = self.register();
        let ctx = registration.ctx.clone();
        let result = self
            .blocking(move |toolkit| {
                let _registration = registration;
                Provisioner::new(&toolkit).provision(&env, distro, &ctx)
            })
            .await;

        match result {
            Ok(path) => SetupOutcome::Ready { path },
            Err(err) if err.is_cancelled() => {
                info!(env = env_id, "setup cancelled");
                SetupOutcome::Cancelled
            }
            Err(err) => {
                warn!(env = env_id, error = %err, "setup failed");
                SetupOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Cancel every in-flight operation and kill any sandboxed process they
    /// are running. Returns how many operations were signalled.
    pub fn cancel_setup(&self) -> usize {
        let operations = self.operations.lock();
        for ctx in operations.values() {
            ctx.abort();
        }
        info!(operations = operations.len(), "cancellation requested");
        operations.len()
    }

    pub async fn execute_command(&self, request: ExecutionRequest) -> ExecutionResult {
        let registration = self.register();
        let ctx = registration.ctx.clone();
        self.blocking(move |toolkit| {
            let _registration = registration;
            Ok(Executor::new(&toolkit).run(&request, &ctx))
        })
        .await
        .unwrap_or_else(|err| ExecutionResult::failure(err.to_string()))
    }

    pub fn is_environment_installed(&self, env_id: &str) -> bool {
        Environment::new(&self.config, env_id)
            .map(|env| env.is_installed())
            .unwrap_or(false)
    }

    pub async fn check_sandbox_update(&self) -> UpdateReport {
        self.blocking(|toolkit| check_for_update(&toolkit))
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "update check failed");
                UpdateReport::failed(err)
            })
    }

    pub fn get_environment_path(&self) -> PathBuf {
        self.config.env_root()
    }

    pub async fn get_storage_info(&self) -> Result<StorageInfo> {
        self.blocking(|toolkit| {
            let config = &toolkit.config;
            let (free, total) = filesystem_space(config.data_dir())?;
            let binary = &toolkit.binary;
            let sandbox_sha256 = if binary.exists() {
                Some(binary.sha256()?)
            } else {
                None
            };
            Ok(StorageInfo {
                data_dir: config.data_dir().to_path_buf(),
                env_root: config.env_root(),
                free_space_mb: free / MB,
                total_space_mb: total / MB,
                sandbox_version: binary.version(),
                sandbox_sha256,
            })
        })
        .await
    }

    pub fn get_device_arch(&self) -> String {
        device_abi(self.config.device_abi.as_deref())
    }

    fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = OpContext::new();
        self.operations.lock().insert(id, ctx.clone());
        Registration {
            id,
            ctx,
            registry: self.operations.clone(),
        }
    }

    /// Run `f` on the blocking pool with a toolkit wired to this service's
    /// event channel. The HTTP client is built on the worker thread.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Toolkit) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let config = self.config.clone();
        let binary = self.binary.clone();
        let sink: Arc<dyn EventSink> = Arc::new(self.events.clone());
        tokio::task::spawn_blocking(move || f(Toolkit::new(config, binary, sink)?))
            .await
            .map_err(|err| Error::Other(anyhow::anyhow!("worker task failed: {err}")))?
    }
}

/// Free and total bytes of the filesystem holding `path`, or its nearest
/// existing ancestor.
fn filesystem_space(path: &Path) -> Result<(u64, u64)> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|err| Error::Other(anyhow::anyhow!("invalid path {}: {err}", existing.display())))?;

    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: `c_path` is NUL-terminated and `stat` points to writable memory
    // of the right size.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: statvfs returned success and filled the struct.
    let stat = unsafe { stat.assume_init() };
    let block = stat.f_frsize as u64;
    Ok((stat.f_bavail as u64 * block, stat.f_blocks as u64 * block))
}
