//! OpenShift release metadata from the public mirror

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Mirror used when the site doesn't name one
pub const DEFAULT_MIRROR: &str = "https://mirror.openshift.com/pub/openshift-v4/clients/ocp";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const RHCOS_LINE: &str = r"(?m)^\s*machine-os\s+(.*)\s+Red\s+Hat\s+Enterprise\s+Linux\s+CoreOS\s*$";

/// Fetches the `release.txt` of an OpenShift version
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Text of `<mirror>/<version>/release.txt`
    async fn release_txt(&self, mirror: &str, version: &str) -> Result<String>;
}

/// Downloads release notes over HTTPS
#[derive(Clone, Debug)]
pub struct HttpReleaseSource {
    http: reqwest::Client,
}

impl HttpReleaseSource {
    /// Create a source with a bounded download time
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("release source", e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn release_txt(&self, mirror: &str, version: &str) -> Result<String> {
        let url = format!("{}/{}/release.txt", mirror.trim_end_matches('/'), version);
        debug!(url = %url, "Downloading release notes");
        let response = self.http.get(&url).send().await.map_err(|e| {
            Error::transport(format!("failed to download 'release.txt' file from URL '{}': {}", url, e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                message: format!(
                    "failed to download 'release.txt' file from URL '{}' because server responded \
                     with status code {}",
                    url,
                    status.as_u16()
                ),
                code: Some(status.as_u16()),
            });
        }
        response
            .text()
            .await
            .map_err(|e| Error::transport(format!("failed to read 'release.txt' file from URL '{}': {}", url, e)))
    }
}

/// RHCOS release named on the `machine-os` line of a `release.txt`
pub fn rhcos_release(release_txt: &str) -> Result<String> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(RHCOS_LINE))
        .as_ref()
        .map_err(|e| Error::internal_with_context("release notes", e.to_string()))?;
    pattern
        .captures(release_txt)
        .and_then(|captures| captures.get(1))
        .map(|release| release.as_str().trim().to_string())
        .ok_or_else(|| Error::validation_for("hub", "failed to find RHCOS release inside 'release.txt' file"))
}
