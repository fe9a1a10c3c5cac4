//! Fetching files and artifacts out of repositories.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cairn_schema::{ArtifactMetadata, Sha256Hash};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{RepositoryAuth, RepositoryConfig, RepositoryKind};

/// Errors fetching repository files.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the fetched file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A downloaded artifact does not match its recorded checksum.
    #[error("Hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Artifact file name.
        file: String,
        /// Checksum from the index.
        expected: String,
        /// Checksum of the downloaded file.
        actual: String,
    },

    /// No location had the file.
    #[error("{file} not found in any of {tried} location(s)")]
    NotFound {
        /// File requested.
        file: String,
        /// Locations tried.
        tried: usize,
    },
}

/// Fetches files from one repository's locations.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Fetch `file`, relative to the repository root, into `dest_dir`.
    async fn download_file(&self, file: &str, dest_dir: &Path) -> Result<PathBuf, ClientError>;

    /// Fetch an artifact archive into `cache_dir` and verify its checksum.
    /// A cached copy with the right checksum is reused.
    async fn download_artifact(
        &self,
        artifact: &ArtifactMetadata,
        cache_dir: &Path,
    ) -> Result<PathBuf, ClientError> {
        let cached = cache_dir.join(&artifact.path);
        if is_cached(&cached, &artifact.checksum).await {
            debug!("Cache hit for {}", artifact.path);
            return Ok(cached);
        }

        let path = self.download_file(&artifact.path, cache_dir).await?;
        if !artifact.checksum.is_empty() {
            let actual = checksum(&path).await?;
            if actual != artifact.checksum {
                tokio::fs::remove_file(&path).await.ok();
                return Err(ClientError::HashMismatch {
                    file: artifact.path.clone(),
                    expected: artifact.checksum.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(path)
    }
}

/// The client matching a repository's type.
pub fn client_for(config: &RepositoryConfig) -> Result<Arc<dyn RepositoryClient>, ClientError> {
    Ok(match config.kind {
        RepositoryKind::Local => Arc::new(LocalClient::new(&config.urls)),
        RepositoryKind::Http => Arc::new(HttpClient::new(&config.urls, config.auth.clone())?),
    })
}

async fn checksum(path: &Path) -> Result<Sha256Hash, ClientError> {
    let path = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || Sha256Hash::of_file(&path))
        .await
        .map_err(std::io::Error::other)??;
    Ok(hash)
}

async fn is_cached(path: &Path, expected: &Sha256Hash) -> bool {
    if expected.is_empty() || !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return false;
    }
    matches!(checksum(path).await, Ok(actual) if &actual == expected)
}

fn file_name(file: &str) -> &str {
    file.rsplit('/').next().unwrap_or(file)
}

/// Repositories on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalClient {
    roots: Vec<PathBuf>,
}

impl LocalClient {
    /// A client over the given directories.
    pub fn new(urls: &[String]) -> Self {
        Self {
            roots: urls.iter().map(PathBuf::from).collect(),
        }
    }
}

#[async_trait]
impl RepositoryClient for LocalClient {
    async fn download_file(&self, file: &str, dest_dir: &Path) -> Result<PathBuf, ClientError> {
        for root in &self.roots {
            let source = root.join(file);
            if !tokio::fs::try_exists(&source).await? {
                continue;
            }

            tokio::fs::create_dir_all(dest_dir).await?;
            let dest = dest_dir.join(file_name(file));
            if source != dest {
                tokio::fs::copy(&source, &dest).await?;
            }
            debug!("Copied {} to {}", source.display(), dest.display());
            return Ok(dest);
        }

        Err(ClientError::NotFound {
            file: file.to_string(),
            tried: self.roots.len(),
        })
    }
}

/// Repositories served over HTTP(S). Mirrors are tried in order.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    urls: Vec<String>,
    auth: Option<RepositoryAuth>,
}

impl HttpClient {
    /// A client over the given base URLs.
    pub fn new(urls: &[String], auth: Option<RepositoryAuth>) -> Result<Self, ClientError> {
        let client = Client::builder().user_agent(crate::USER_AGENT).build()?;
        Ok(Self {
            client,
            urls: urls.to_vec(),
            auth,
        })
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.auth {
            Some(RepositoryAuth {
                token: Some(token), ..
            }) => request.bearer_auth(token),
            Some(RepositoryAuth {
                username: Some(user),
                password,
                ..
            }) => request.basic_auth(user, password.as_ref()),
            _ => request,
        }
    }

    /// Stream `url` into `dest`, hashing as it goes.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<Sha256Hash, ClientError> {
        debug!("GET {url}");
        let response = self.request(url).send().await?.error_for_status()?;

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    tokio::fs::remove_file(dest).await.ok();
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            hasher.write_all(&chunk)?;
        }
        file.flush().await?;

        Ok(Sha256Hash::new(hex::encode(hasher.finalize())))
    }

    fn url(base: &str, file: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), file.trim_start_matches('/'))
    }
}

#[async_trait]
impl RepositoryClient for HttpClient {
    async fn download_file(&self, file: &str, dest_dir: &Path) -> Result<PathBuf, ClientError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(file_name(file));

        let mut last = None;
        for base in &self.urls {
            let url = Self::url(base, file);
            match self.fetch(&url, &dest).await {
                Ok(_) => return Ok(dest),
                Err(e) => {
                    warn!("Failed to fetch {url}: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| ClientError::NotFound {
            file: file.to_string(),
            tried: 0,
        }))
    }

    async fn download_artifact(
        &self,
        artifact: &ArtifactMetadata,
        cache_dir: &Path,
    ) -> Result<PathBuf, ClientError> {
        let dest = cache_dir.join(file_name(&artifact.path));
        if is_cached(&dest, &artifact.checksum).await {
            debug!("Cache hit for {}", artifact.path);
            return Ok(dest);
        }
        tokio::fs::create_dir_all(cache_dir).await?;

        let mut last = None;
        for base in &self.urls {
            let url = Self::url(base, &artifact.path);
            let error = match self.fetch(&url, &dest).await {
                Ok(actual) if artifact.checksum.is_empty() || actual == artifact.checksum => {
                    return Ok(dest);
                }
                Ok(actual) => {
                    tokio::fs::remove_file(&dest).await.ok();
                    ClientError::HashMismatch {
                        file: artifact.path.clone(),
                        expected: artifact.checksum.to_string(),
                        actual: actual.to_string(),
                    }
                }
                Err(e) => e,
            };
            warn!("Failed to fetch {url}: {error}");
            last = Some(error);
        }
        Err(last.unwrap_or_else(|| ClientError::NotFound {
            file: artifact.path.clone(),
            tried: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_schema::{BuildRecipe, CompressionType, Package, PackagesAssertions};
    use mockito::Server;
    use tempfile::tempdir;

    fn artifact(body: &str) -> ArtifactMetadata {
        ArtifactMetadata {
            path: "a-test-1.0.package.tar".into(),
            package: Package::new("test", "a", "1.0"),
            recipe: BuildRecipe::default(),
            dependencies: Vec::new(),
            source_assertion: PackagesAssertions::new(),
            compression: CompressionType::None,
            checksum: Sha256Hash::digest(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_http_download_verifies_checksum() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repo/a-test-1.0.package.tar")
            .with_status(200)
            .with_body("payload")
            .create_async()
            .await;

        let cache = tempdir().unwrap();
        let client = HttpClient::new(&[format!("{}/repo/", server.url())], None).unwrap();

        let path = client
            .download_artifact(&artifact("payload"), cache.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "payload");

        let err = client
            .download_artifact(&artifact("something else"), cache.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HashMismatch { .. }));
        assert!(!cache.path().join("a-test-1.0.package.tar").exists());
    }

    #[tokio::test]
    async fn test_http_falls_back_to_next_mirror() {
        let mut server = Server::new_async().await;
        let _down = server
            .mock("GET", "/down/repository.json")
            .with_status(503)
            .create_async()
            .await;
        let _up = server
            .mock("GET", "/up/repository.json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let dest = tempdir().unwrap();
        let urls = [format!("{}/down", server.url()), format!("{}/up", server.url())];
        let client = HttpClient::new(&urls, None).unwrap();

        let path = client
            .download_file("repository.json", dest.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_http_sends_token() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/repository.json")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let auth = RepositoryAuth {
            token: Some("secret".into()),
            ..RepositoryAuth::default()
        };
        let dest = tempdir().unwrap();
        let client = HttpClient::new(&[server.url()], Some(auth)).unwrap();
        client
            .download_file("repository.json", dest.path())
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_cached_artifact_is_not_refetched() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/a-test-1.0.package.tar")
            .expect(0)
            .create_async()
            .await;

        let cache = tempdir().unwrap();
        std::fs::write(cache.path().join("a-test-1.0.package.tar"), "payload").unwrap();
        let client = HttpClient::new(&[server.url()], None).unwrap();

        client
            .download_artifact(&artifact("payload"), cache.path())
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_local_client() {
        let repo = tempdir().unwrap();
        std::fs::write(repo.path().join("a-test-1.0.package.tar"), "payload").unwrap();
        let cache = tempdir().unwrap();

        let missing = tempdir().unwrap();
        let client = LocalClient::new(&[
            missing.path().display().to_string(),
            repo.path().display().to_string(),
        ]);

        let path = client
            .download_artifact(&artifact("payload"), cache.path())
            .await
            .unwrap();
        assert_eq!(path, cache.path().join("a-test-1.0.package.tar"));

        let err = client
            .download_file("nope.tar", cache.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound { tried: 2, .. }));
    }
}
