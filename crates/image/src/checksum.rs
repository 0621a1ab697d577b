//! SHA-256 helpers and the `.sha256` sidecar next to prepared artefacts.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use {
    sha2::{Digest, Sha256},
    tracing::debug,
};

use crate::error::{Error, Result};

/// Read-back record for one file inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksum {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub modified: u64,
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash a file in 1 MiB chunks on the blocking pool.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1 << 20];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Message(format!("checksum task failed: {e}")))?
}

#[must_use]
pub fn sidecar_path(artefact: &Path) -> PathBuf {
    let mut name = artefact.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write `<digest>  <file name>` in the format `sha256sum -c` accepts.
pub async fn write_sidecar(artefact: &Path, digest: &str) -> Result<PathBuf> {
    let sidecar = sidecar_path(artefact);
    let name = artefact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tokio::fs::write(&sidecar, format!("{digest}  {name}\n")).await?;
    debug!(path = %sidecar.display(), "wrote checksum sidecar");
    Ok(sidecar)
}

/// Digest recorded in the sidecar, if one exists and is well formed.
pub async fn read_sidecar(artefact: &Path) -> Result<Option<String>> {
    let sidecar = sidecar_path(artefact);
    let raw = match tokio::fs::read_to_string(&sidecar).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(raw
        .split_whitespace()
        .next()
        .filter(|d| d.len() == 64 && d.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn digest_of_known_input() {
        assert_eq!(sha256_bytes(b"hello"), HELLO);
    }

    #[tokio::test]
    async fn file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"hello").await.unwrap();
        assert_eq!(sha256_file(&path).await.unwrap(), HELLO);
    }

    #[tokio::test]
    async fn sidecar_round_trip_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let artefact = dir.path().join("node1.img.xz");
        assert_eq!(read_sidecar(&artefact).await.unwrap(), None);

        let written = write_sidecar(&artefact, HELLO).await.unwrap();
        assert_eq!(written, dir.path().join("node1.img.xz.sha256"));
        let raw = tokio::fs::read_to_string(&written).await.unwrap();
        assert_eq!(raw, format!("{HELLO}  node1.img.xz\n"));
        assert_eq!(read_sidecar(&artefact).await.unwrap().as_deref(), Some(HELLO));
    }

    #[tokio::test]
    async fn malformed_sidecar_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let artefact = dir.path().join("node2.img.xz");
        tokio::fs::write(sidecar_path(&artefact), "not-a-digest node2.img.xz\n")
            .await
            .unwrap();
        assert_eq!(read_sidecar(&artefact).await.unwrap(), None);
    }
}
