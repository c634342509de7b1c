//! Local cache of model artifacts, keyed by source URL.
//!
//! Remote artifacts are fetched once with bounded retries, written to a
//! `.part` file and renamed into place, so a partially downloaded model is
//! never mistaken for a cached one.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::model_registry::ModelDescriptor;

const DOWNLOAD_RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct ModelStore {
    cache_dir: PathBuf,
    download: DownloadConfig,
}

impl ModelStore {
    pub fn new(cache_dir: PathBuf, download: DownloadConfig) -> Self {
        Self {
            cache_dir,
            download,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the artifact for `url` lives once cached.
    pub fn cached_path(&self, url: &Url) -> PathBuf {
        let digest = Sha256::digest(url.as_str().as_bytes());
        let digest_hex = format!("{digest:x}");
        let basename = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "model.onnx".to_string());
        self.cache_dir
            .join(format!("{}-{basename}", &digest_hex[..16]))
    }

    pub fn is_cached(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor
            .url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok())
            .map(|url| match url.scheme() {
                "file" => url.to_file_path().map(|p| p.is_file()).unwrap_or(false),
                _ => self.cached_path(&url).is_file(),
            })
            .unwrap_or(false)
    }

    /// Returns a local path for the descriptor's artifact, downloading it first
    /// when it is remote and not yet cached.
    pub fn materialize(&self, descriptor: &ModelDescriptor) -> Result<PathBuf> {
        let raw = descriptor
            .url
            .as_deref()
            .with_context(|| format!("model {} has no source location", descriptor.id))?;
        let url = parse_model_url(raw)?;
        let redacted = redacted_url_for_display(&url);

        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("invalid file URL for model {}: {redacted}", descriptor.id))?;
            if !path.is_file() {
                bail!("model file not found: {}", path.display());
            }
            verify_if_configured(descriptor, &path)?;
            return Ok(path);
        }

        let final_path = self.cached_path(&url);
        if final_path.is_file() {
            match verify_if_configured(descriptor, &final_path) {
                Ok(()) => {
                    debug!(model = %descriptor.id, path = %final_path.display(), "Using cached model");
                    return Ok(final_path);
                }
                Err(error) => {
                    warn!(
                        model = %descriptor.id,
                        error = %error,
                        "Cached model failed verification; downloading again"
                    );
                    let _ = fs::remove_file(&final_path);
                }
            }
        }

        fs::create_dir_all(&self.cache_dir).with_context(|| {
            format!(
                "failed to create model cache dir: {}",
                self.cache_dir.display()
            )
        })?;

        info!(model = %descriptor.id, url = %redacted, "Downloading model");
        self.download_with_retries(&url, &redacted, &final_path, descriptor)?;
        info!(model = %descriptor.id, path = %final_path.display(), "Model download complete");
        Ok(final_path)
    }

    fn download_with_retries(
        &self,
        url: &Url,
        redacted_url: &str,
        final_path: &Path,
        descriptor: &ModelDescriptor,
    ) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(self.download.connect_timeout_secs))
            .timeout(Duration::from_secs(self.download.request_timeout_secs))
            .build()
            .context("failed to build HTTP client for model download")?;

        let max_attempts = self.download.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match download_once(&client, url, redacted_url, final_path, descriptor) {
                Ok(()) => return Ok(()),
                Err(DownloadAttemptError { retryable, error }) => {
                    if retryable && attempt < max_attempts {
                        debug!(
                            url = %redacted_url,
                            attempt,
                            max_attempts,
                            error = %error,
                            "model download attempt failed; retrying"
                        );
                        let backoff_ms = DOWNLOAD_RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                        continue;
                    }

                    if retryable {
                        return Err(anyhow!(
                            "Model download failed after {max_attempts} attempts for {redacted_url}: {error}"
                        ));
                    }
                    return Err(error);
                }
            }
        }

        Err(anyhow!(
            "Model download failed after {max_attempts} attempts for {redacted_url}"
        ))
    }
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &Url,
    redacted_url: &str,
    final_path: &Path,
    descriptor: &ModelDescriptor,
) -> std::result::Result<(), DownloadAttemptError> {
    let mut response = client.get(url.as_str()).send().map_err(|err| {
        let wrapped = anyhow!("failed to start model download from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let wrapped = anyhow!(
            "Model download failed (HTTP {}) for {redacted_url}",
            status.as_u16()
        );
        if is_retryable_status(status) {
            return Err(DownloadAttemptError::retryable(wrapped));
        }
        return Err(DownloadAttemptError::fatal(wrapped));
    }

    let tmp_path = part_path(final_path);
    let _ = fs::remove_file(&tmp_path);

    let mut tmp_file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

    response.copy_to(&mut tmp_file).map_err(|err| {
        let wrapped = anyhow!("failed while reading model body from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    tmp_file
        .flush()
        .and_then(|_| tmp_file.sync_all())
        .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    drop(tmp_file);

    verify_if_configured(descriptor, &tmp_path).map_err(DownloadAttemptError::fatal)?;

    fs::rename(&tmp_path, final_path)
        .with_context(|| {
            format!(
                "failed to move {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })
        .map_err(DownloadAttemptError::fatal)?;

    tmp_guard.disarm();
    Ok(())
}

fn verify_if_configured(descriptor: &ModelDescriptor, path: &Path) -> Result<()> {
    let Some(expected) = descriptor.sha256.as_deref() else {
        return Ok(());
    };
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "SHA256 mismatch for model {}: expected {expected}, got {actual}",
            descriptor.id
        );
    }
    debug!(model = %descriptor.id, "Model hash verified");
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn parse_model_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw).with_context(|| {
        format!(
            "invalid model URL: {}",
            crate::logging::redact_sensitive_text(raw)
        )
    })?;
    match parsed.scheme() {
        "http" | "https" | "file" => Ok(parsed),
        scheme => bail!(
            "unsupported model URL scheme '{scheme}' for '{}'",
            redacted_url_for_display(&parsed)
        ),
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

pub fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    if !redacted.username().is_empty() || redacted.password().is_some() {
        let _ = redacted.set_username("");
        let _ = redacted.set_password(None);
    }
    redacted.to_string()
}

struct DownloadAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl DownloadAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}
