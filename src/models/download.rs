use crate::config::schema::DownloadConfig;
use crate::error::DownloadError;
use crate::integrity::{
    ArtifactFormat, Expectations, IntegrityVerifier, SizeCheck, VerificationReport,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

/// Response of a GET request
pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, std::result::Result<Bytes, String>>,
}

/// Byte source for downloads
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET request for `url`
    async fn get(&self, url: &str) -> Result<TransportResponse, DownloadError>;
}

/// `reqwest` backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(TransportResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| e.to_string()))
                .boxed(),
        })
    }
}

/// Attempt count, fixed backoff and deadlines for one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempt_timeout: Option<Duration>,
    pub overall_timeout: Option<Duration>,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempt_timeout: None,
            overall_timeout: None,
        }
    }

    #[must_use]
    pub const fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            delay: config.retry_delay(),
            attempt_timeout: Some(config.attempt_timeout()),
            overall_timeout: Some(config.overall_timeout()),
        }
    }

    #[must_use]
    pub const fn with_timeouts(mut self, attempt: Duration, overall: Duration) -> Self {
        self.attempt_timeout = Some(attempt);
        self.overall_timeout = Some(overall);
        self
    }

    /// Delay before the attempt following `attempt` (1-based), or `None` when
    /// the failed attempt was the last one or the error is terminal
    #[must_use]
    pub fn next_delay(&self, attempt: u32, err: &DownloadError) -> Option<Duration> {
        if attempt >= self.max_attempts || !err.is_retryable() {
            None
        } else {
            Some(self.delay)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

/// Observer for download progress; must not influence the download
pub trait ProgressReporter: Send + Sync {
    fn on_attempt(&self, _url: &str, _attempt: u32, _max_attempts: u32) {}
    fn on_progress(&self, _downloaded: u64, _total: Option<u64>) {}
    fn on_retry(&self, _attempt: u32, _error: &DownloadError, _delay: Duration) {}
    fn on_finish(&self, _bytes: u64) {}
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}

/// Logs attempts and retries through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn on_attempt(&self, url: &str, attempt: u32, max_attempts: u32) {
        tracing::info!("Downloading {url} (attempt {attempt}/{max_attempts})");
    }

    fn on_retry(&self, attempt: u32, error: &DownloadError, delay: Duration) {
        tracing::warn!("Attempt {attempt} failed: {error}; retrying in {delay:?}");
    }

    fn on_finish(&self, bytes: u64) {
        tracing::info!("Downloaded {}", format_bytes(bytes));
    }
}

/// Terminal progress bar for interactive use
pub struct ProgressBarReporter {
    label: String,
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressBarReporter {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        if let Ok(mut bar) = self.bar.lock() {
            f(&mut bar);
        }
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn on_attempt(&self, _url: &str, attempt: u32, max_attempts: u32) {
        let label = self.label.clone();
        self.with_bar(|bar| {
            if let Some(old) = bar.take() {
                old.finish_and_clear();
            }
            let pb = ProgressBar::new(0);
            let style = ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
            pb.set_style(style);
            if max_attempts > 1 && attempt > 1 {
                pb.set_message(format!("{label} (attempt {attempt}/{max_attempts})"));
            } else {
                pb.set_message(label);
            }
            *bar = Some(pb);
        });
    }

    fn on_progress(&self, downloaded: u64, total: Option<u64>) {
        self.with_bar(|bar| {
            if let Some(pb) = bar.as_ref() {
                if let Some(total) = total {
                    pb.set_length(total);
                }
                pb.set_position(downloaded);
            }
        });
    }

    fn on_retry(&self, attempt: u32, error: &DownloadError, delay: Duration) {
        self.with_bar(|bar| {
            if let Some(pb) = bar.take() {
                pb.abandon_with_message(format!("attempt {attempt} failed: {error}"));
            }
        });
        tracing::warn!("Retrying in {delay:?}");
    }

    fn on_finish(&self, bytes: u64) {
        self.with_bar(|bar| {
            if let Some(pb) = bar.take() {
                pb.finish_with_message(format!("✓ {} ({})", self.label, format_bytes(bytes)));
            }
        });
    }
}

/// What to fetch and how to check it
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_size: Option<u64>,
    pub expected_checksum: Option<&'a str>,
    pub format: ArtifactFormat,
}

/// A verified file at the destination
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub attempts: u32,
    pub report: VerificationReport,
}

/// Fetches artifacts and validates them before handing them back
#[derive(Clone)]
pub struct ModelDownloader {
    transport: Arc<dyn Transport>,
    verifier: IntegrityVerifier,
    policy: RetryPolicy,
    disk_buffer_bytes: u64,
}

impl ModelDownloader {
    /// Create new downloader
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        verifier: IntegrityVerifier,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            verifier,
            policy,
            disk_buffer_bytes: 100 * 1024 * 1024,
        }
    }

    #[must_use]
    pub const fn with_disk_buffer_mb(mut self, mb: u64) -> Self {
        self.disk_buffer_bytes = mb * 1024 * 1024;
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    /// Download `request.url` to `request.dest` and verify it
    ///
    /// Size mismatches and integrity failures are retried like network errors.
    /// On every failed attempt the partial file is removed, so on error the
    /// destination never holds a partial or invalid file. A checksum the
    /// policy rejects fails before the first request.
    pub async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        reporter: &dyn ProgressReporter,
    ) -> Result<FetchOutcome, DownloadError> {
        self.verifier
            .expected_checksum(request.expected_checksum, request.url)?;

        if let Some(expected) = request.expected_size {
            if let Some(parent) = request.dest.parent() {
                self.check_disk_space(parent, expected)?;
            }
        }

        let deadline = self.policy.overall_timeout.map(|d| Instant::now() + d);
        let mut attempt = 1;

        loop {
            reporter.on_attempt(request.url, attempt, self.policy.max_attempts);

            let result = match self.attempt_budget(deadline) {
                Some(budget) => tokio::time::timeout(budget, self.attempt(request, reporter))
                    .await
                    .unwrap_or(Err(DownloadError::Timeout(budget))),
                None => self.attempt(request, reporter).await,
            };

            match result {
                Ok((bytes_written, report)) => {
                    reporter.on_finish(bytes_written);
                    return Ok(FetchOutcome {
                        bytes_written,
                        attempts: attempt,
                        report,
                    });
                }
                Err(err) => {
                    remove_partial(request.dest).await;

                    let Some(delay) = self.policy.next_delay(attempt, &err) else {
                        tracing::warn!(
                            "Giving up on {} after {attempt} attempt(s): {err}",
                            request.url
                        );
                        return Err(err);
                    };

                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            tracing::warn!("Deadline reached for {} after {attempt} attempt(s)", request.url);
                            return Err(err);
                        }
                    }

                    reporter.on_retry(attempt, &err, delay);
                    tracing::debug!("Attempt {attempt} for {} failed: {err}", request.url);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Time allowed for the next attempt given both timeouts
    fn attempt_budget(&self, deadline: Option<Instant>) -> Option<Duration> {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match (self.policy.attempt_timeout, remaining) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (Some(a), None) => Some(a),
            (None, r) => r,
        }
    }

    async fn attempt(
        &self,
        request: &FetchRequest<'_>,
        reporter: &dyn ProgressReporter,
    ) -> Result<(u64, VerificationReport), DownloadError> {
        let response = self.transport.get(request.url).await?;
        if !(200..300).contains(&response.status) {
            return Err(DownloadError::Status {
                url: request.url.to_string(),
                status: response.status,
            });
        }

        let total = request.expected_size.or(response.content_length);
        let io_err = |source: std::io::Error| DownloadError::Io {
            path: request.dest.to_path_buf(),
            source,
        };

        let file = tokio::fs::File::create(request.dest).await.map_err(io_err)?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut body = response.body;
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|reason| DownloadError::Network {
                url: request.url.to_string(),
                reason,
            })?;
            writer.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
            reporter.on_progress(written, total);
        }

        writer.flush().await.map_err(io_err)?;
        writer.into_inner().sync_all().await.map_err(io_err)?;

        // A short or long body is a corrupt download, retried like a bad checksum
        if let Some(expected) = request.expected_size {
            if written != expected {
                return Err(DownloadError::Integrity(
                    crate::error::IntegrityError::SizeMismatch {
                        path: request.dest.to_path_buf(),
                        expected,
                        actual: written,
                    },
                ));
            }
        }

        let report = verify_blocking(
            self.verifier,
            request.dest.to_path_buf(),
            request.expected_size,
            request.expected_checksum.map(str::to_string),
            request.format,
            SizeCheck::Exact,
        )
        .await?;

        Ok((written, report))
    }

    /// Fetch a small document fully into memory, with the same retry policy
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let mut attempt = 1;
        loop {
            let result = async {
                let response = self.transport.get(url).await?;
                if !(200..300).contains(&response.status) {
                    return Err(DownloadError::Status {
                        url: url.to_string(),
                        status: response.status,
                    });
                }
                let mut body = response.body;
                let mut buf = Vec::new();
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|reason| DownloadError::Network {
                        url: url.to_string(),
                        reason,
                    })?;
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf)
            }
            .await;

            match result {
                Ok(buf) => return Ok(buf),
                Err(err) => match self.policy.next_delay(attempt, &err) {
                    Some(delay) => {
                        tracing::warn!("Fetching {url} failed: {err}; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Check if enough disk space is available
    fn check_disk_space(&self, dir: &Path, required_bytes: u64) -> Result<(), DownloadError> {
        let stats = match nix::sys::statvfs::statvfs(dir) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("Failed to check disk space for {}: {e}", dir.display());
                return Ok(());
            }
        };

        let available =
            u64::from(stats.blocks_available()).saturating_mul(u64::from(stats.fragment_size()));
        let required = required_bytes.saturating_add(self.disk_buffer_bytes);

        if available < required {
            return Err(DownloadError::InsufficientSpace {
                required,
                available,
            });
        }

        Ok(())
    }
}

/// Run a full verification on the blocking pool
pub(crate) async fn verify_blocking(
    verifier: IntegrityVerifier,
    path: PathBuf,
    size_bytes: Option<u64>,
    checksum: Option<String>,
    format: ArtifactFormat,
    size_check: SizeCheck,
) -> Result<VerificationReport, DownloadError> {
    let dest = path.clone();
    tokio::task::spawn_blocking(move || {
        verifier.verify(
            &path,
            &Expectations {
                size_bytes,
                checksum: checksum.as_deref(),
                size_check,
                format,
            },
        )
    })
    .await
    .map_err(|e| DownloadError::Io {
        path: dest,
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?
    .map_err(DownloadError::Integrity)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial file {}: {e}", path.display()),
    }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Serves a fixed payload, optionally corrupting it for the first N calls
    struct FlakyTransport {
        payload: Vec<u8>,
        corrupt_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn get(&self, _url: &str) -> Result<TransportResponse, DownloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut data = self.payload.clone();
            if call <= self.corrupt_first {
                data[0] ^= 0xff;
            }
            let chunks: Vec<_> = data
                .chunks(1000)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(TransportResponse {
                status: 200,
                content_length: Some(data.len() as u64),
                body: stream::iter(chunks).boxed(),
            })
        }
    }

    fn payload() -> Vec<u8> {
        (0..4096u32).map(|i| (i % 251) as u8).collect()
    }

    fn checksum_of(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    fn downloader(transport: Arc<dyn Transport>, attempts: u32) -> ModelDownloader {
        ModelDownloader::new(
            transport,
            IntegrityVerifier::default(),
            RetryPolicy::new(attempts, Duration::ZERO),
        )
        .with_disk_buffer_mb(0)
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_retry_policy_next_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let network = DownloadError::Network {
            url: "u".to_string(),
            reason: "reset".to_string(),
        };
        assert_eq!(policy.next_delay(1, &network), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(2, &network), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(3, &network), None);

        let disk = DownloadError::InsufficientSpace {
            required: 10,
            available: 1,
        };
        assert_eq!(policy.next_delay(1, &disk), None);

        let unsupported = DownloadError::Integrity(
            crate::error::IntegrityError::UnsupportedAlgorithm("md5".to_string()),
        );
        assert_eq!(policy.next_delay(1, &unsupported), None);
    }

    #[tokio::test]
    async fn test_unusable_checksum_fails_without_request() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("m.bin.partial");
        let transport = Arc::new(FlakyTransport {
            payload: payload(),
            corrupt_first: 0,
            calls: AtomicU32::new(0),
        });

        let err = downloader(transport.clone(), 3)
            .fetch(
                &FetchRequest {
                    url: "https://example.com/m.bin",
                    dest: &dest,
                    expected_size: None,
                    expected_checksum: Some("md5:0cc175b9c0f1b6a831c399e269772661"),
                    format: ArtifactFormat::Opaque,
                },
                &NoopReporter,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Integrity(crate::error::IntegrityError::UnsupportedAlgorithm(_))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_succeeds_after_corrupt_attempt() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("m.bin.partial");
        let data = payload();
        let checksum = checksum_of(&data);
        let transport = Arc::new(FlakyTransport {
            payload: data.clone(),
            corrupt_first: 1,
            calls: AtomicU32::new(0),
        });

        let outcome = downloader(transport.clone(), 3)
            .fetch(
                &FetchRequest {
                    url: "https://example.com/m.bin",
                    dest: &dest,
                    expected_size: Some(data.len() as u64),
                    expected_checksum: Some(&checksum),
                    format: ArtifactFormat::Opaque,
                },
                &NoopReporter,
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(outcome.report.digest, checksum);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_exhausts_retries_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("m.bin.partial");
        let data = payload();
        let checksum = checksum_of(&data);
        let transport = Arc::new(FlakyTransport {
            payload: data.clone(),
            corrupt_first: u32::MAX,
            calls: AtomicU32::new(0),
        });

        let err = downloader(transport.clone(), 4)
            .fetch(
                &FetchRequest {
                    url: "https://example.com/m.bin",
                    dest: &dest,
                    expected_size: Some(data.len() as u64),
                    expected_checksum: Some(&checksum),
                    format: ArtifactFormat::Opaque,
                },
                &LogReporter,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Integrity(crate::error::IntegrityError::ChecksumMismatch { .. })
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_goes_through_retry_path() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("m.bin.partial");
        let data = payload();
        let transport = Arc::new(FlakyTransport {
            payload: data.clone(),
            corrupt_first: 0,
            calls: AtomicU32::new(0),
        });

        let err = downloader(transport.clone(), 2)
            .fetch(
                &FetchRequest {
                    url: "https://example.com/m.bin",
                    dest: &dest,
                    expected_size: Some(data.len() as u64 + 10),
                    expected_checksum: None,
                    format: ArtifactFormat::Opaque,
                },
                &NoopReporter,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Integrity(crate::error::IntegrityError::SizeMismatch { .. })
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let transport = Arc::new(FlakyTransport {
            payload: b"{\"models\":{}}".to_vec(),
            corrupt_first: 0,
            calls: AtomicU32::new(0),
        });
        let body = downloader(transport, 1)
            .fetch_bytes("https://example.com/registry.json")
            .await
            .unwrap();
        assert_eq!(body, b"{\"models\":{}}");
    }
}
