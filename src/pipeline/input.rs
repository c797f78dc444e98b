//! Input resolution: turn a user-supplied path or URL into PDF bytes.
//!
//! The bytes are handed to [`crate::orchestrator::Orchestrator::submit`],
//! which stores them in the job directory; the original file or download is
//! never referenced again. The `%PDF` magic is checked here so callers get a
//! meaningful error instead of a pdfium failure minutes later.

use crate::error::Pdf2VideoError;
use std::path::PathBuf;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF read from disk or the network.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    /// Path or URL the bytes came from, for messages.
    pub source_name: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Read a local file or download a URL, validating the PDF magic bytes.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2VideoError> {
    let resolved = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    check_pdf_magic(&resolved.source_name, &resolved.bytes)?;
    Ok(resolved)
}

/// Reject anything that does not start with `%PDF`.
pub fn check_pdf_magic(source_name: &str, bytes: &[u8]) -> Result<(), Pdf2VideoError> {
    if bytes.starts_with(PDF_MAGIC) {
        Ok(())
    } else {
        Err(Pdf2VideoError::NotAPdf {
            source_name: source_name.to_string(),
            magic: bytes.iter().take(4).copied().collect(),
        })
    }
}

async fn read_local(path_str: &str) -> Result<ResolvedInput, Pdf2VideoError> {
    if path_str.trim().is_empty() {
        return Err(Pdf2VideoError::InvalidInput {
            input: path_str.to_string(),
        });
    }
    let path = PathBuf::from(path_str);

    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => Pdf2VideoError::PermissionDenied { path: path.clone() },
        _ => Pdf2VideoError::FileNotFound { path: path.clone() },
    })?;

    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(ResolvedInput {
        source_name: path_str.to_string(),
        bytes,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2VideoError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Pdf2VideoError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| download_error(url, timeout_secs, e))?;

    if !response.status().is_success() {
        return Err(Pdf2VideoError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| download_error(url, timeout_secs, e))?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(ResolvedInput {
        source_name: url.to_string(),
        bytes: bytes.to_vec(),
    })
}

fn download_error(url: &str, timeout_secs: u64, e: reqwest::Error) -> Pdf2VideoError {
    if e.is_timeout() {
        Pdf2VideoError::DownloadTimeout {
            url: url.to_string(),
            secs: timeout_secs,
        }
    } else {
        Pdf2VideoError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}
