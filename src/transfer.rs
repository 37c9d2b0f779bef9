use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{calculate_backoff, Error, Result, RetryConfig};
use crate::events::{EventSink, Progress, ProgressRange, TransferProgress};
use reqwest::blocking::{Client, Response};
use reqwest::header::ACCEPT;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Read buffer for streamed downloads (64 KB); one progress event per read.
const BUFFER_SIZE: usize = 64 * 1024;
const MAX_REDIRECTS: usize = 10;

/// Blocking HTTP(S) client shared by sandbox acquisition and rootfs download.
///
/// Every request follows redirects, carries the configured user agent and a
/// per-request timeout: short for metadata, long for binaries and base images.
/// Transient network faults (connect errors, timeouts, 5xx) are retried with
/// exponential backoff; any other non-2xx status fails immediately.
#[derive(Clone)]
pub struct TransferClient {
    client: Client,
    retry: RetryConfig,
    metadata_timeout: Duration,
    binary_timeout: Duration,
    image_timeout: Duration,
}

impl TransferClient {
    /// Must not be called from within an async context: the blocking client
    /// owns its own runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(None::<Duration>)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Self {
            client,
            retry: config.retry.clone(),
            metadata_timeout: config.metadata_timeout(),
            binary_timeout: config.binary_timeout(),
            image_timeout: config.image_timeout(),
        })
    }

    /// GET a small text/JSON payload.
    pub fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.send(url, self.metadata_timeout, Some("application/json"))?;
        response.text().map_err(|err| network_error(url, err))
    }

    /// GET a binary payload into `dest`, returning the number of bytes written.
    pub fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.send(url, self.binary_timeout, None)?;
        let mut file = BufWriter::new(File::create(dest)?);
        let written = io::copy(&mut response, &mut file).map_err(|err| read_error(url, err))?;
        file.flush()?;
        debug!(url, bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }

    /// GET a large payload into `dest`, emitting one progress event per buffer
    /// mapped into `range`. On cancellation the partial file is left in place
    /// and `Error::Cancelled` is returned.
    pub fn fetch_to_file_with_progress(
        &self,
        url: &str,
        dest: &Path,
        range: ProgressRange,
        cancel: &CancelToken,
        sink: &dyn EventSink,
    ) -> Result<TransferProgress> {
        let mut response = self.send(url, self.image_timeout, None)?;
        let mut progress = TransferProgress {
            bytes_done: 0,
            bytes_total: response.content_length().filter(|len| *len > 0),
        };

        let mut file = BufWriter::new(File::create(dest)?);
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                file.flush()?;
                debug!(url, bytes = progress.bytes_done, "download cancelled");
                return Err(Error::Cancelled);
            }

            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(read_error(url, err)),
            };

            file.write_all(&buf[..n])?;
            progress.bytes_done += n as u64;
            sink.progress(Progress::new(
                progress.describe("Downloading"),
                range.at(progress.fraction()),
            ));
        }

        file.flush()?;
        debug!(url, bytes = progress.bytes_done, dest = %dest.display(), "download complete");
        Ok(progress)
    }

    fn send(&self, url: &str, timeout: Duration, accept: Option<&str>) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url).timeout(timeout);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let result = request
                .send()
                .map_err(|err| network_error(url, err))
                .and_then(|response| check_status(url, response));

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = calculate_backoff(attempt, &self.retry);
                    warn!(url, attempt, backoff_ms = backoff, error = %err, "transient transfer failure, retrying");
                    std::thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::http_status(url, status.as_u16()))
    }
}

fn network_error(url: &str, err: reqwest::Error) -> Error {
    Error::Transfer {
        url: url.to_string(),
        status: err.status().map(|s| s.as_u16()),
        retryable: err.is_connect() || err.is_timeout(),
        message: err.to_string(),
    }
}

fn read_error(url: &str, err: io::Error) -> Error {
    Error::Transfer {
        url: url.to_string(),
        status: None,
        retryable: false,
        message: format!("connection dropped mid-transfer: {err}"),
    }
}
