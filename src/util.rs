use std::path::Path;

use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{fs::File, io::AsyncWriteExt};
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:82.0) Gecko/20100101 Firefox/82.0";

#[derive(Clone)]
pub struct HttpClient {
    pub client: ClientWithMiddleware,
}

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HttpClient {
    pub fn new() -> reqwest::Result<HttpClient> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client })
    }

    pub async fn download_file(&self, url: &str, path: &Path) -> Result<usize, HttpError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).await?;
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut size = 0;

        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len();
        }

        file.flush().await?;
        tokio::fs::rename(temp_path, path).await?;

        Ok(size)
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, HttpError> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
            .map_err(|e| e.into())
    }
}

/// Replaces the last path component of `url`, keeping scheme, host and query.
pub fn with_file_name(url: &Url, name: &str) -> Url {
    let mut out = url.clone();
    if let Ok(mut segments) = out.path_segments_mut() {
        segments.pop().push(name);
    }
    out
}

/// Last path component of a URI, ignoring any query or fragment.
pub fn file_name(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path)
}

/// `<prefix>-<yymmdd.HHMMSS>`, the naming scheme for everything captured live.
pub fn timestamped_name(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Local::now().format("%y%m%d.%H%M%S"))
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "KiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "MiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "GiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "TiB";
    }

    format!("{:.2} {}", bytes, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_file_name_and_keeps_query() {
        let url = Url::parse("https://cdn.example.net/abc/chunked/12v3-456.ts?token=x%20y").unwrap();
        let out = with_file_name(&url, "456.ts");
        assert_eq!(
            out.as_str(),
            "https://cdn.example.net/abc/chunked/456.ts?token=x%20y"
        );
    }

    #[test]
    fn file_name_ignores_query() {
        assert_eq!(file_name("https://a/b/c/7-muted.ts?x=/y"), "7-muted.ts");
        assert_eq!(file_name("12.ts"), "12.ts");
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
