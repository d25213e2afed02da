use anyhow::{Context, Result, bail, ensure};
use log::{debug, info};
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::{Client, Response};
use std::time::Duration;
use trait_variant::make;

/// Source of effect files and model binaries
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait AssetFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Fetches `http(s)://` locations over the network and everything else from
/// the local filesystem
#[derive(Clone, Default)]
pub struct HttpAssetFetcher {
    client: Client,
}

impl HttpAssetFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_remote(location: &str) -> bool {
        location.starts_with("http://") || location.starts_with("https://")
    }
}

impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if Self::is_remote(location) {
            info!("GET {location}");

            let res = self
                .client
                .get(location)
                .send()
                .await
                .context(format!("failed to send GET request to {location}"))?;

            return handle_http_response(res, &format!("GET {location}")).await;
        }

        debug!("reading {location}");
        tokio::fs::read(location)
            .await
            .context(format!("failed to read {location}"))
    }
}

/// Handle HTTP response by checking status and extracting the body bytes
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET model")
///
/// # Returns
/// * `Ok(Vec<u8>)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<Vec<u8>> {
    let status = res.status();
    let body = res.bytes().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {}",
        String::from_utf8_lossy(&body)
    );

    Ok(body.to_vec())
}

/// Fetch `location`, giving up after `timeout` if one is configured
pub async fn fetch_with_timeout<F>(
    fetcher: &F,
    location: &str,
    timeout: Option<Duration>,
) -> Result<Vec<u8>>
where
    F: AssetFetcher + Sync,
{
    let Some(timeout) = timeout else {
        return fetcher.fetch(location).await;
    };

    match tokio::time::timeout(timeout, fetcher.fetch(location)).await {
        Ok(result) => result,
        Err(_) => bail!("fetching {location} timed out after {timeout:?}"),
    }
}

/// Resolve a possibly relative asset path against the configured root
///
/// URLs and absolute paths are returned unchanged.
pub fn resolve_location(root: &str, path: &str) -> String {
    if path.contains("://") || path.starts_with('/') || root.is_empty() {
        return path.to_string();
    }

    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches("./");
    format!("{root}/{path}")
}
