use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::{WebDavRemote, remote_join};
use crate::{Error, Result};

const COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// Progress callback: `(bytes_transferred, total_bytes)`; total is 0 when unknown.
pub type TransferProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Remote archive store. Remote paths are `/`-separated and relative to the
/// client's root.
pub trait CloudClient: Send + Sync {
    fn provider(&self) -> &'static str;

    fn exists<'a>(
        &'a self,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Uploads `local` as `{remote_dir}/{file name}`.
    fn upload<'a>(
        &'a self,
        local: &'a Path,
        remote_dir: &'a str,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Downloads `remote_path` into `local_dir`; returns the local file.
    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        local_dir: &'a Path,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>>;
}

fn file_name_of(path: &str) -> Result<&str> {
    path.rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Cloud {
            message: format!("remote path has no file name: {path}"),
        })
}

fn local_file_name(local: &Path) -> Result<&str> {
    local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::NonUtf8Path {
            path: local.to_path_buf(),
        })
}

/// A remote that is mounted as a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryCloudClient {
    root: PathBuf,
}

impl DirectoryCloudClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote_path: &str) -> PathBuf {
        remote_path
            .split('/')
            .filter(|c| !c.is_empty() && *c != "." && *c != "..")
            .fold(self.root.clone(), |acc, c| acc.join(c))
    }
}

async fn copy_with_progress(src: &Path, dst: &Path, on_progress: TransferProgress<'_>) -> Result<()> {
    let mut reader = tokio::fs::File::open(src).await?;
    let total = reader.metadata().await?.len();
    let mut writer = tokio::fs::File::create(dst).await?;
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut done = 0u64;
    on_progress(0, total);
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        done += n as u64;
        on_progress(done, total);
    }
    writer.flush().await?;
    writer.sync_all().await?;
    Ok(())
}

impl CloudClient for DirectoryCloudClient {
    fn provider(&self) -> &'static str {
        "directory"
    }

    fn exists<'a>(
        &'a self,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(tokio::fs::try_exists(self.resolve(remote_path)).await?) })
    }

    fn upload<'a>(
        &'a self,
        local: &'a Path,
        remote_dir: &'a str,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let name = local_file_name(local)?;
            let dir = self.resolve(remote_dir);
            tokio::fs::create_dir_all(&dir).await?;
            copy_with_progress(local, &dir.join(name), on_progress).await
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        local_dir: &'a Path,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            let name = file_name_of(remote_path)?;
            tokio::fs::create_dir_all(local_dir).await?;
            let dst = local_dir.join(name);
            copy_with_progress(&self.resolve(remote_path), &dst, on_progress).await?;
            Ok(dst)
        })
    }
}

/// WebDAV remote over reqwest.
#[derive(Debug, Clone)]
pub struct WebDavClient {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl WebDavClient {
    pub fn new(remote: &WebDavRemote) -> Self {
        Self {
            base_url: remote.url.trim_end_matches('/').to_string(),
            username: remote.username.clone(),
            password: remote.password.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, remote_path: &str) -> String {
        remote_join(&self.base_url, remote_path)
    }

    fn request(&self, method: reqwest::Method, remote_path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, self.url(remote_path));
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    async fn make_collections(&self, remote_dir: &str) -> Result<()> {
        let mkcol = reqwest::Method::from_bytes(b"MKCOL").map_err(|e| Error::Cloud {
            message: format!("invalid method: {e}"),
        })?;
        let mut current = String::new();
        for segment in remote_dir.split('/').filter(|s| !s.is_empty()) {
            current = remote_join(&current, segment);
            let res = self
                .request(mkcol.clone(), &format!("{current}/"))
                .send()
                .await
                .map_err(|e| Error::Cloud {
                    message: format!("MKCOL {current} failed: {e}"),
                })?;
            let status = res.status();
            // 405: collection already exists
            if !status.is_success() && status != reqwest::StatusCode::METHOD_NOT_ALLOWED {
                return Err(Error::Cloud {
                    message: format!("MKCOL {current}: http {status}"),
                });
            }
        }
        Ok(())
    }
}

impl CloudClient for WebDavClient {
    fn provider(&self) -> &'static str {
        "webdav"
    }

    fn exists<'a>(
        &'a self,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let res = self
                .request(reqwest::Method::HEAD, remote_path)
                .send()
                .await
                .map_err(|e| Error::Cloud {
                    message: format!("HEAD {remote_path} failed: {e}"),
                })?;
            let status = res.status();
            if status.is_success() {
                Ok(true)
            } else if status == reqwest::StatusCode::NOT_FOUND {
                Ok(false)
            } else {
                Err(Error::Cloud {
                    message: format!("HEAD {remote_path}: http {status}"),
                })
            }
        })
    }

    fn upload<'a>(
        &'a self,
        local: &'a Path,
        remote_dir: &'a str,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let name = local_file_name(local)?;
            self.make_collections(remote_dir).await?;

            let bytes = tokio::fs::read(local).await?;
            let total = bytes.len() as u64;
            on_progress(0, total);
            let remote_path = remote_join(remote_dir, name);
            debug!(
                event = "cloud.webdav.put",
                remote_path = %remote_path,
                bytes = total,
                "cloud.webdav.put"
            );
            let res = self
                .request(reqwest::Method::PUT, &remote_path)
                .body(bytes)
                .send()
                .await
                .map_err(|e| Error::Cloud {
                    message: format!("PUT {remote_path} failed: {e}"),
                })?;
            let status = res.status();
            if !status.is_success() {
                return Err(Error::Cloud {
                    message: format!("PUT {remote_path}: http {status}"),
                });
            }
            on_progress(total, total);
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        local_dir: &'a Path,
        on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            let name = file_name_of(remote_path)?;
            let mut res = self
                .request(reqwest::Method::GET, remote_path)
                .send()
                .await
                .map_err(|e| Error::Cloud {
                    message: format!("GET {remote_path} failed: {e}"),
                })?;
            let status = res.status();
            if !status.is_success() {
                return Err(Error::Cloud {
                    message: format!("GET {remote_path}: http {status}"),
                });
            }

            tokio::fs::create_dir_all(local_dir).await?;
            let dst = local_dir.join(name);
            let total = res.content_length().unwrap_or(0);
            let mut file = tokio::fs::File::create(&dst).await?;
            let mut done = 0u64;
            on_progress(0, total);
            while let Some(chunk) = res.chunk().await.map_err(|e| Error::Cloud {
                message: format!("GET {remote_path} body failed: {e}"),
            })? {
                file.write_all(&chunk).await?;
                done += chunk.len() as u64;
                on_progress(done, total);
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(dst)
        })
    }
}
