use crate::device::DeviceId;
use crate::store::error::{StoreError, StoreResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// BLAKE3 digest, hex encoded
    pub checksum: String,
}

/// Retrieved files on local disk, laid out as `<root>/<device>/<campaign>/<name>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, device_id: DeviceId, campaign_id: u64, name: &str) -> StoreResult<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0')
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self
            .root
            .join(device_id.to_string())
            .join(campaign_id.to_string())
            .join(name))
    }

    /// Write through a temp file and rename, so a crash never leaves a
    /// truncated artifact under the final name.
    pub async fn write(
        &self,
        device_id: DeviceId,
        campaign_id: u64,
        name: &str,
        data: &[u8],
    ) -> StoreResult<StoredArtifact> {
        let path = self.path_for(device_id, campaign_id, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_file_name(format!("{name}.partial"));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        Ok(StoredArtifact {
            path,
            size: data.len() as u64,
            checksum: blake3::hash(data).to_hex().to_string(),
        })
    }

    pub async fn read(&self, path: &Path) -> StoreResult<Bytes> {
        Ok(Bytes::from(fs::read(path).await?))
    }

    /// Remove an artifact; a missing file is not an error
    pub async fn remove(&self, path: &Path) -> StoreResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn verify(data: &[u8], checksum: &str) -> bool {
        blake3::hash(data).to_hex().as_str() == checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let artifact = store
            .write(DeviceId(42), 7, "a.ubx", b"payload")
            .await
            .unwrap();
        assert_eq!(artifact.size, 7);
        assert_eq!(artifact.path, dir.path().join("42").join("7").join("a.ubx"));
        assert!(ArtifactStore::verify(b"payload", &artifact.checksum));
        assert!(!ArtifactStore::verify(b"other", &artifact.checksum));

        let data = store.read(&artifact.path).await.unwrap();
        assert_eq!(&data[..], b"payload");

        store.remove(&artifact.path).await.unwrap();
        assert!(store.read(&artifact.path).await.is_err());
        // Second remove is fine
        store.remove(&artifact.path).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        for bad in ["", "..", "../x", "a/b", "a\\b"] {
            let result = store.write(DeviceId(1), 1, bad, b"x").await;
            assert!(matches!(result, Err(StoreError::InvalidName(_))), "{bad}");
        }
    }
}
