use crate::config::Config;
use crate::env::{device_abi, Arch};
use crate::error::Result;
use crate::events::{EventSink, NullSink, Progress};
use crate::sandbox::SandboxBinary;
use crate::transfer::TransferClient;
use std::sync::Arc;

/// Shared collaborators handed to every pipeline stage: configuration, the
/// HTTP client, the sandbox binary and the event sink. Cheap to clone.
#[derive(Clone)]
pub struct Toolkit {
    pub config: Arc<Config>,
    pub client: TransferClient,
    pub binary: Arc<SandboxBinary>,
    pub sink: Arc<dyn EventSink>,
}

impl Toolkit {
    /// Builds a blocking HTTP client; call from a worker thread, not from async code.
    pub fn new(
        config: Arc<Config>,
        binary: Arc<SandboxBinary>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let client = TransferClient::new(&config)?;
        Ok(Self {
            config,
            client,
            binary,
            sink,
        })
    }

    /// A toolkit with its own binary handle and no event delivery.
    pub fn from_config(config: Config) -> Result<Self> {
        let binary = Arc::new(SandboxBinary::from_config(&config));
        Self::new(Arc::new(config), binary, Arc::new(NullSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn arch(&self) -> Arch {
        Arch::from_abi(&device_abi(self.config.device_abi.as_deref()))
    }

    pub fn progress(&self, message: impl Into<String>, progress: f64) {
        self.sink.progress(Progress::new(message, progress));
    }
}
