//! Content-addressed blob store.
//!
//! A flat directory of files named `{job_id}.{suffix}` where the suffix
//! set is closed: `audio.<ext>`, `txt.gz`, `segments.json.gz`. Job ids
//! are unique, so keys never collide; repeated writes to the same key
//! are whole-file overwrites.
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, with the parent directory fsynced before `put_stream`
//! returns. A failed write unlinks the partial file.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{Result, ScribaError};
use crate::job::JobId;

/// Suffix of the gzip text artifact.
pub const TEXT_SUFFIX: &str = "txt.gz";
/// Suffix of the gzip segments artifact.
pub const SEGMENTS_SUFFIX: &str = "segments.json.gz";

/// Blob key for an uploaded audio file.
pub fn audio_key(id: JobId, ext: &str) -> String {
    format!("{id}.audio.{ext}")
}

/// Blob key for the text artifact of a job.
pub fn text_key(id: JobId) -> String {
    format!("{id}.{TEXT_SUFFIX}")
}

/// Blob key for the segments artifact of a job.
pub fn segments_key(id: JobId) -> String {
    format!("{id}.{SEGMENTS_SUFFIX}")
}

/// Reject keys that are not `{job_id}.{known-suffix}`.
///
/// This doubles as path-traversal protection: a valid key starts with a
/// UUID and contains no separators.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = || ScribaError::Config(format!("invalid blob key: {key}"));

    let (id_part, suffix) = key.split_once('.').ok_or_else(invalid)?;
    id_part.parse::<JobId>().map_err(|_| invalid())?;

    if suffix == TEXT_SUFFIX || suffix == SEGMENTS_SUFFIX {
        return Ok(());
    }
    if let Some(ext) = suffix.strip_prefix("audio.") {
        let ext_ok = !ext.is_empty()
            && ext.len() <= 8
            && ext.chars().all(|c| c.is_ascii_alphanumeric());
        if ext_ok {
            return Ok(());
        }
    }
    Err(invalid())
}

/// Flat filesystem keyspace for audio uploads and result artifacts.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Stream `reader` into the blob at `key`. Durable before return.
    pub async fn put_stream<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        validate_key(key)?;
        let final_path = self.path_for(key);
        let tmp_path = self
            .root
            .join(format!(".{key}.{}.part", Uuid::new_v4().simple()));

        let result = self.write_tmp(&tmp_path, &final_path, reader).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn write_tmp<R>(&self, tmp: &Path, dest: &Path, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = fs::File::create(tmp).await?;
        let copied = tokio::io::copy(reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(tmp, dest).await?;
        self.sync_root().await?;
        Ok(copied)
    }

    /// fsync the store directory so a completed rename survives a crash.
    async fn sync_root(&self) -> Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || std::fs::File::open(&root)?.sync_all())
            .await
            .map_err(|e| ScribaError::Other(format!("fsync task failed: {e}")))??;
        Ok(())
    }

    /// Convenience wrapper around `put_stream` for in-memory payloads.
    pub async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut reader = bytes;
        self.put_stream(key, &mut reader).await.map(|_| ())
    }

    /// Open the blob for reading.
    pub async fn get_stream(&self, key: &str) -> Result<fs::File> {
        validate_key(key)?;
        match fs::File::open(self.path_for(key)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScribaError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the whole blob into memory.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let mut file = self.get_stream(key).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok()
            && fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Size in bytes, `NotFound` if absent.
    pub async fn size(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScribaError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent delete.
    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn key_helpers_and_validation() {
        let id = JobId::new();
        assert!(validate_key(&audio_key(id, "wav")).is_ok());
        assert!(validate_key(&text_key(id)).is_ok());
        assert!(validate_key(&segments_key(id)).is_ok());

        assert!(validate_key("not-a-uuid.txt.gz").is_err());
        assert!(validate_key(&format!("{id}.evil")).is_err());
        assert!(validate_key(&format!("{id}.audio.../x")).is_err());
        assert!(validate_key("../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn put_then_get_returns_bytes() {
        let (_dir, store) = store();
        let key = text_key(JobId::new());
        store.put_bytes(&key, b"hello").await.unwrap();
        assert!(store.exists(&key).await);
        assert_eq!(store.read(&key).await.unwrap(), b"hello");
        assert_eq!(store.size(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let (_dir, store) = store();
        let key = text_key(JobId::new());
        store.put_bytes(&key, b"first").await.unwrap();
        store.put_bytes(&key, b"second").await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let key = text_key(JobId::new());
        assert!(matches!(
            store.read(&key).await,
            Err(ScribaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store();
        let key = text_key(JobId::new());
        store.put_bytes(&key, b"x").await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await);
    }
}
