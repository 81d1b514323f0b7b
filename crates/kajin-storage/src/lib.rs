//! Durable local state + upstream HTTP utilities for Kajin.
//!
//! Everything that touches disk goes through [`write_atomic`], so a crash in
//! the middle of a persist leaves the previous snapshot intact.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod cache;
pub mod http;
pub mod ledger;
pub mod table;

pub use cache::{CachedLink, LinkCache};
pub use http::{UpstreamClient, UpstreamConfig, UpstreamError};
pub use ledger::{Ledger, LedgerError, LedgerRow};

pub const CRATE_NAME: &str = "kajin-storage";

/// Replace `path` with `bytes` via a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry for listing fetches: a fixed pause between attempts, no
/// exponential growth. The default allows exactly one retry after 30 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {url} failed: {source}")]
    Transport {
        url: String,
        disposition: RetryDisposition,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FetchError {
    pub fn transient(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            url: url.into(),
            disposition: RetryDisposition::Retryable,
            source: source.into(),
        }
    }

    pub fn fatal(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            url: url.into(),
            disposition: RetryDisposition::NonRetryable,
            source: source.into(),
        }
    }

    pub fn from_reqwest(url: impl Into<String>, err: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            disposition: classify_reqwest_error(&err),
            source: Box::new(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { disposition, .. } => *disposition == RetryDisposition::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_previous_content_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"{\"v\":1}").await.expect("first write");
        write_atomic(&path, b"{\"v\":2}").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"v\":2}");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn default_policy_allows_exactly_one_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff, Duration::from_secs(30));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn fetch_error_reports_its_disposition() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(FetchError::transient("http://x", io).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad");
        assert!(!FetchError::fatal("http://x", io).is_transient());
    }
}
