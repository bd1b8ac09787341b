//! Materializes layer sources into local files the readers can open.

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;

use super::error::InfraError;
use crate::{
    application::repos::SourceFetcher, config::RemoteSettings, domain::layer::SourceLocator,
    source::SourceError,
};

const DOWNLOADS_DIR: &str = "downloads";
const USER_AGENT: &str = concat!("parcelmap/", env!("CARGO_PKG_VERSION"));

/// Local paths pass through; remote URLs are downloaded into the staging directory and
/// reused until released.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    downloads: PathBuf,
    max_attempts: NonZeroU32,
    initial_backoff: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &RemoteSettings, staging_directory: &Path) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            downloads: staging_directory.join(DOWNLOADS_DIR),
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff,
        })
    }

    fn download_path(&self, url: &Url) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let file_name = SourceLocator::Remote(url.clone())
            .file_name()
            .unwrap_or_else(|| "source".to_string());
        self.downloads.join(format!("{}-{file_name}", &digest[..16]))
    }

    async fn download(&self, url: &Url) -> Result<PathBuf, SourceError> {
        let target = self.download_path(url);
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!(url = %url, path = %target.display(), "Reusing downloaded source");
            return Ok(target);
        }

        fs::create_dir_all(&self.downloads)
            .await
            .map_err(|err| SourceError::io(&self.downloads, err))?;

        let mut backoff = self.initial_backoff;
        let attempts = self.max_attempts.get();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch_once(url, &target).await {
                Ok(bytes) => {
                    info!(
                        url = %url,
                        path = %target.display(),
                        bytes,
                        attempt,
                        "Downloaded remote source"
                    );
                    return Ok(target);
                }
                Err(err) => {
                    warn!(url = %url, attempt, attempts, error = %err, "Source download failed");
                    last_error = err;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(SourceError::unavailable(
            url.as_str(),
            format!("gave up after {attempts} attempts: {last_error}"),
        ))
    }

    /// Streams the body into a sibling temp file and renames it into place.
    async fn fetch_once(&self, url: &Url, target: &Path) -> Result<u64, String> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| err.to_string())?;

        let partial = target.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&partial)
            .await
            .map_err(|err| err.to_string())?;

        let mut written = 0u64;
        let result: Result<(), String> = async {
            while let Some(chunk) = response.chunk().await.map_err(|err| err.to_string())? {
                file.write_all(&chunk).await.map_err(|err| err.to_string())?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(|err| err.to_string())?;
            fs::rename(&partial, target)
                .await
                .map_err(|err| err.to_string())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }
        Ok(written)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn materialize(&self, locator: &SourceLocator) -> Result<PathBuf, SourceError> {
        match locator {
            SourceLocator::Local(path) => {
                if fs::try_exists(path).await.unwrap_or(false) {
                    Ok(path.clone())
                } else {
                    Err(SourceError::unavailable(
                        path.display().to_string(),
                        "file does not exist",
                    ))
                }
            }
            SourceLocator::Remote(url) => self.download(url).await,
        }
    }

    async fn release(&self, locator: &SourceLocator) -> Result<PathBuf, SourceError> {
        let url = match locator {
            SourceLocator::Local(path) => return Ok(path.clone()),
            SourceLocator::Remote(url) => url,
        };

        let target = self.download_path(url);
        match fs::remove_file(&target).await {
            Ok(()) => info!(url = %url, path = %target.display(), "Dropped downloaded source"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(SourceError::io(&target, err)),
        }
        Ok(target)
    }

    async fn release_all(&self) -> Result<(), SourceError> {
        match fs::remove_dir_all(&self.downloads).await {
            Ok(()) => {
                info!(directory = %self.downloads.display(), "Dropped downloaded sources");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SourceError::io(&self.downloads, err)),
        }
    }
}
