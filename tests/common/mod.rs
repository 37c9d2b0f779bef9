#![allow(dead_code)]

use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use userland::cancel::CancelToken;
use userland::config::Config;
use userland::error::RetryConfig;
use userland::events::{EventSink, OutputLine, Progress};

/// An axum server on a loopback port, running on its own runtime thread so
/// blocking clients can talk to it from the test thread.
pub struct TestServer {
    pub base: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn serve(router: Router) -> TestServer {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
    });

    TestServer {
        base: format!("http://{addr}"),
        shutdown: Some(tx),
    }
}

/// Configuration for tests: tiny size threshold, no background updates, a
/// single transfer attempt and an unreachable release listing.
pub fn test_config(data_dir: &Path) -> Config {
    Config {
        min_binary_size: 64,
        auto_update: false,
        release_api_url: "http://127.0.0.1:9/releases".to_string(),
        retry: RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
        device_abi: Some("x86_64".to_string()),
        ..Config::with_data_dir(data_dir)
    }
}

/// Records every event; optionally fires `cancel` once `cancel_after`
/// progress events have been seen.
#[derive(Default)]
pub struct RecordingSink {
    pub progress: Mutex<Vec<Progress>>,
    pub output: Mutex<Vec<OutputLine>>,
    pub updates: Mutex<Vec<String>>,
    cancel: Option<(CancelToken, usize)>,
}

impl RecordingSink {
    pub fn cancelling(token: CancelToken, after: usize) -> Self {
        Self {
            cancel: Some((token, after)),
            ..Self::default()
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.progress.lock().iter().map(|p| p.progress).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.progress.lock().iter().map(|p| p.message.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn progress(&self, progress: Progress) {
        let mut events = self.progress.lock();
        events.push(progress);
        if let Some((token, after)) = &self.cancel {
            if events.len() >= *after {
                token.cancel();
            }
        }
    }

    fn output(&self, line: OutputLine) {
        self.output.lock().push(line);
    }

    fn sandbox_updated(&self, version: &str) {
        self.updates.lock().push(version.to_string());
    }
}

/// A small gzip'd root: a directory, an executable, a regular file and a
/// symlink to the executable, in that order.
pub fn rootfs_archive() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o755);
    dir.set_size(0);
    builder.append_data(&mut dir, "bin/", std::io::empty()).unwrap();

    append_file(&mut builder, "bin/hello", 0o755, b"#!/bin/sh\necho hello\n");
    append_file(&mut builder, "etc/os-release", 0o644, b"ID=test\n");

    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_mode(0o777);
    link.set_size(0);
    builder.append_link(&mut link, "bin/sh", "hello").unwrap();

    builder.into_inner().unwrap().finish().unwrap()
}

fn append_file<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &str, mode: u32, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeProot {
    /// Run the command with the host shell
    Run,
    /// Only log the command and succeed
    LogOnly,
    /// Log the command, print an error and exit 1
    Fail,
}

/// Stand-in for proot: skips every option up to `-c`, appends the command to
/// `commands.log` next to the script, then acts according to `mode`. Large
/// enough to pass the size check of [`test_config`].
pub fn install_fake_proot(config: &Config, mode: FakeProot) -> PathBuf {
    let bin_dir = config.bin_dir();
    fs::create_dir_all(&bin_dir).unwrap();
    let path = bin_dir.join("proot");
    let log = bin_dir.join("commands.log");
    let action = match mode {
        FakeProot::Run => "exec /bin/sh -c \"$1\"",
        FakeProot::LogOnly => "exit 0",
        FakeProot::Fail => "echo 'E: repository unreachable'; exit 1",
    };
    let script = format!(
        "#!/bin/sh\n\
         # fake proot used by the integration tests, accepts the real option grammar\n\
         while [ $# -gt 0 ]; do\n\
         \x20 if [ \"$1\" = \"-c\" ]; then\n\
         \x20   shift\n\
         \x20   printf '%s\\n' \"$1\" >> '{}'\n\
         \x20   {action}\n\
         \x20 fi\n\
         \x20 shift\n\
         done\n\
         exit 127\n",
        log.display(),
        action = action
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(bin_dir.join("proot.version"), "5.3.0").unwrap();
    path
}

pub fn logged_commands(config: &Config) -> Vec<String> {
    fs::read_to_string(config.bin_dir().join("commands.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
