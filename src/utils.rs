use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{} is missing and no {var} is set", .path.display())]
    Missing { path: std::path::PathBuf, var: &'static str },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to download {url}: {status}")]
    Status { url: String, status: reqwest::StatusCode },
    #[error("invalid GITHUB_TOKEN format")]
    Token,
    #[error("failed to write file: {0}")]
    Io(#[from] std::io::Error),
}

async fn download_file(url: &str, path: &Path) -> Result<(), DownloadError> {
    info!("Downloading {} from {}", path.display(), url);

    let mut header_map = HeaderMap::new();

    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| DownloadError::Token)?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client.get(url).headers(header_map).send().await?;

    if !response.status().is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, bytes).await?;
    Ok(())
}

async fn ensure_file(
    path: &Path,
    url: Option<&str>,
    var: &'static str,
) -> Result<(), DownloadError> {
    if fs::try_exists(path).await? {
        return Ok(());
    }
    match url {
        Some(url) => download_file(url, path).await,
        None => Err(DownloadError::Missing {
            path: path.to_path_buf(),
            var,
        }),
    }
}

/// Fetches the model graph and charset if they are not on disk yet.
pub async fn ensure_files_exist(config: &Config) -> Result<(), DownloadError> {
    info!("Checking model...");
    ensure_file(&config.model_path, config.model_url.as_deref(), "MODEL_URL").await?;
    ensure_file(&config.charset_path, config.charset_url.as_deref(), "CHARSET_URL").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(model_path: &Path, charset_path: &Path) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.model_path = model_path.to_path_buf();
        config.charset_path = charset_path.to_path_buf();
        config
    }

    #[tokio::test]
    async fn present_files_need_no_download() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("captcha.pb");
        let charset = dir.path().join("charset.txt");
        std::fs::write(&model, b"graph").unwrap();
        std::fs::write(&charset, b"\na").unwrap();

        ensure_files_exist(&config_with(&model, &charset)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_without_url_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("captcha.pb");
        let charset = dir.path().join("charset.txt");
        std::fs::write(&model, b"graph").unwrap();

        let err = ensure_files_exist(&config_with(&model, &charset))
            .await
            .unwrap_err();

        match err {
            DownloadError::Missing { path, var } => {
                assert_eq!(path, charset);
                assert_eq!(var, "CHARSET_URL");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
