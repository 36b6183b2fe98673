use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_zip::base::read::mem::ZipFileReader;
use buildgrid_common::model::BuildId;
use buildgrid_common::SafeDisplay;
use futures_util::io::AsyncReadExt as _;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("path escapes the storage root: {path}")]
    PathViolation { path: String },
    #[error("artifact not found: {path}")]
    NotFound { path: String },
    #[error("invalid credential bundle: {0}")]
    InvalidBundle(String),
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
}

impl SafeDisplay for StorageError {
    fn to_safe_string(&self) -> String {
        match self {
            StorageError::PayloadTooLarge { .. } => self.to_string(),
            StorageError::PathViolation { .. } => "Internal storage error".to_string(),
            StorageError::NotFound { .. } => self.to_string(),
            StorageError::InvalidBundle(_) => self.to_string(),
            StorageError::Unavailable(_) => "Storage temporarily unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Source,
    Credentials,
    Result,
}

impl ArtifactKind {
    fn subtree(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::Credentials => "credentials",
            ArtifactKind::Result => "result",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "bundle",
            ArtifactKind::Credentials => "bundle.zip",
            ArtifactKind::Result => "artifact",
        }
    }
}

/// Bytes written to the staging area but not yet visible under a build.
/// Commit renames the file into place; discard removes it.
#[derive(Debug)]
pub struct StagedArtifact {
    staging_path: PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub relative_path: String,
    pub size: u64,
}

/// The decoded credential bundle. See
/// [`ArtifactStore::read_secure_credentials`].
#[derive(Debug)]
pub struct SecureCredentials {
    pub key: Vec<u8>,
    pub password: String,
    pub profiles: Vec<Vec<u8>>,
}

/// Content-addressed artifact bytes under a single storage root. Every
/// derived path must stay inside the root; writes are staged and renamed
/// into place so a build path never holds a partial file.
pub struct ArtifactStore {
    root: PathBuf,
    staging_root: PathBuf,
    config: StorageConfig,
}

impl ArtifactStore {
    pub async fn new(config: &StorageConfig) -> Result<ArtifactStore, StorageError> {
        tokio::fs::create_dir_all(&config.root).await?;
        let staging_root = config.root.join("staging");
        tokio::fs::create_dir_all(&staging_root).await?;
        Ok(ArtifactStore {
            root: config.root.clone(),
            staging_root,
            config: config.clone(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    pub fn max_bytes(&self, kind: ArtifactKind) -> u64 {
        match kind {
            ArtifactKind::Source => self.config.source_max_bytes,
            ArtifactKind::Credentials => self.config.credentials_max_bytes,
            ArtifactKind::Result => self.config.result_max_bytes,
        }
    }

    pub fn relative_path(build_id: &BuildId, kind: ArtifactKind) -> String {
        format!("builds/{build_id}/{}/{}", kind.subtree(), kind.file_name())
    }

    /// Canonicalizing join: only plain path segments are accepted, and the
    /// joined result must remain a prefix extension of the storage root.
    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => {
                    return Err(StorageError::PathViolation {
                        path: relative.to_string(),
                    })
                }
            }
        }
        if !path.starts_with(&self.root) {
            return Err(StorageError::PathViolation {
                path: relative.to_string(),
            });
        }
        Ok(path)
    }

    /// Streams the reader into a fresh staging file, enforcing the byte cap
    /// for the target kind before anything becomes visible. The staging file
    /// is fsynced on success and removed on any failure.
    pub async fn stage<R>(&self, kind: ArtifactKind, reader: &mut R) -> Result<StagedArtifact, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staging_path = self.staging_root.join(format!("{}.part", Uuid::new_v4()));
        match self.write_capped(&staging_path, kind, reader).await {
            Ok(size) => Ok(StagedArtifact {
                staging_path,
                kind,
                size,
            }),
            Err(err) => {
                let _ = tokio::fs::remove_file(&staging_path).await;
                Err(err)
            }
        }
    }

    async fn write_capped<R>(
        &self,
        staging_path: &Path,
        kind: ArtifactKind,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let limit = self.max_bytes(kind);
        let mut file = File::create(staging_path).await?;
        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut total: u64 = 0;
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            total += read as u64;
            if total > limit {
                return Err(StorageError::PayloadTooLarge { limit });
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.sync_all().await?;
        Ok(total)
    }

    pub async fn commit(
        &self,
        staged: StagedArtifact,
        build_id: &BuildId,
    ) -> Result<StoredArtifact, StorageError> {
        let relative = Self::relative_path(build_id, staged.kind);
        let target = self.resolve(&relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = tokio::fs::rename(&staged.staging_path, &target).await {
            let _ = tokio::fs::remove_file(&staged.staging_path).await;
            return Err(err.into());
        }
        Ok(StoredArtifact {
            relative_path: relative,
            size: staged.size,
        })
    }

    pub async fn discard(&self, staged: StagedArtifact) {
        let _ = tokio::fs::remove_file(&staged.staging_path).await;
    }

    pub async fn ingest<R>(
        &self,
        build_id: &BuildId,
        kind: ArtifactKind,
        reader: &mut R,
    ) -> Result<StoredArtifact, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staged = self.stage(kind, reader).await?;
        self.commit(staged, build_id).await
    }

    /// Opens an artifact for chunked egress. Returns the file and its length.
    pub async fn open_stream(&self, relative: &str) -> Result<(File, u64), StorageError> {
        let path = self.resolve(relative)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound {
                    path: relative.to_string(),
                }
            } else {
                StorageError::Unavailable(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Copies stored bytes between builds, preferring a hardlink and falling
    /// back to a plain copy across devices.
    pub async fn link_or_copy(
        &self,
        from_relative: &str,
        to_relative: &str,
    ) -> Result<(), StorageError> {
        let from = self.resolve(from_relative)?;
        let to = self.resolve(to_relative)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::hard_link(&from, &to).await.is_err() {
            tokio::fs::copy(&from, &to).await?;
        }
        Ok(())
    }

    /// Removes staging leftovers from requests that died without cleanup.
    pub async fn clean_staging(&self, older_than: SystemTime) -> Result<u64, StorageError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.staging_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified < older_than && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Decodes the credential bundle in memory so the guest never receives
    /// the raw archive. The bundle is a ZIP holding one signing key
    /// (`*.p12`), a `password.txt` and zero or more `*.mobileprovision`
    /// profiles. Both the archive and every decompressed entry are held to
    /// the credentials byte ceiling to defeat decompression bombs.
    pub async fn read_secure_credentials(
        &self,
        relative: &str,
    ) -> Result<SecureCredentials, StorageError> {
        let path = self.resolve(relative)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound {
                    path: relative.to_string(),
                }
            } else {
                StorageError::Unavailable(err)
            }
        })?;
        let ceiling = self.config.credentials_max_bytes;
        if metadata.len() > ceiling {
            return Err(StorageError::PayloadTooLarge { limit: ceiling });
        }

        let bytes = tokio::fs::read(&path).await?;
        let reader = ZipFileReader::new(bytes)
            .await
            .map_err(|err| StorageError::InvalidBundle(err.to_string()))?;

        let mut key: Option<Vec<u8>> = None;
        let mut password: Option<String> = None;
        let mut profiles: Vec<Vec<u8>> = Vec::new();

        for index in 0..reader.file().entries().len() {
            let file_name = {
                let entry = &reader.file().entries()[index];
                entry
                    .filename()
                    .as_str()
                    .map_err(|err| StorageError::InvalidBundle(err.to_string()))?
                    .to_string()
            };
            if file_name.ends_with('/') {
                continue;
            }

            let mut entry_reader = reader
                .reader_with_entry(index)
                .await
                .map_err(|err| StorageError::InvalidBundle(err.to_string()))?;
            let mut content = Vec::new();
            let mut limited = (&mut entry_reader).take(ceiling + 1);
            limited
                .read_to_end(&mut content)
                .await
                .map_err(|err| StorageError::InvalidBundle(err.to_string()))?;
            if content.len() as u64 > ceiling {
                return Err(StorageError::PayloadTooLarge { limit: ceiling });
            }

            if file_name.ends_with(".p12") {
                key = Some(content);
            } else if file_name.ends_with("password.txt") {
                password = Some(
                    String::from_utf8(content)
                        .map_err(|_| {
                            StorageError::InvalidBundle("password is not valid UTF-8".to_string())
                        })?
                        .trim()
                        .to_string(),
                );
            } else if file_name.ends_with(".mobileprovision") {
                profiles.push(content);
            }
        }

        match (key, password) {
            (Some(key), Some(password)) => Ok(SecureCredentials {
                key,
                password,
                profiles,
            }),
            (None, _) => Err(StorageError::InvalidBundle(
                "missing signing key entry".to_string(),
            )),
            (_, None) => Err(StorageError::InvalidBundle(
                "missing password entry".to_string(),
            )),
        }
    }
}
