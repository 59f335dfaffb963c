use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::boxcar::Boxcar;
use crate::error::DrifterError;

/// Canonical cache location for a boxcar archive: the final path segment
/// of its source locator inside the cache directory.
pub fn archive_path(cache_dir: &Path, boxcar: &Boxcar) -> PathBuf {
    let file = boxcar.url.rsplit('/').next().unwrap_or("boxcar.tgz");
    cache_dir.join(file)
}

/// Ensure the boxcar archive is cached locally and digest-verified.
///
/// Idempotent and cheap to call unconditionally: a present artifact is
/// re-hashed, never re-fetched. A mismatching cached file is deleted so
/// the next fetch starts clean. Downloads go to a uniquely named temp
/// file and only an atomic rename makes the canonical path appear.
pub async fn fetch(boxcar: &Boxcar, cache_dir: &Path) -> Result<PathBuf, DrifterError> {
    let archive = archive_path(cache_dir, boxcar);

    if archive.exists() {
        let actual = digest_file(&archive).await?;
        if actual != boxcar.sha256 {
            tokio::fs::remove_file(&archive)
                .await
                .map_err(|e| DrifterError::Io {
                    context: format!("removing corrupt artifact {}", archive.display()),
                    source: e,
                })?;
            return Err(DrifterError::DigestMismatch {
                path: archive,
                expected: boxcar.sha256.clone(),
                actual,
            });
        }
        tracing::info!(path = %archive.display(), "using cached boxcar archive");
        return Ok(archive);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| DrifterError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let file_name = archive
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "boxcar.tgz".into());
    let tmp_path = cache_dir.join(format!(".{file_name}-{nanos}"));

    println!("Fetching {} to {}", boxcar.url, archive.display());

    let actual = match download(&boxcar.url, &tmp_path).await {
        Ok(digest) => digest,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
    };

    if actual != boxcar.sha256 {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(DrifterError::DigestMismatch {
            path: archive,
            expected: boxcar.sha256.clone(),
            actual,
        });
    }

    tokio::fs::rename(&tmp_path, &archive)
        .await
        .map_err(|e| DrifterError::Io {
            context: format!(
                "renaming {} to {}",
                tmp_path.display(),
                archive.display()
            ),
            source: e,
        })?;

    tracing::info!(path = %archive.display(), "boxcar archive cached");
    Ok(archive)
}

/// Hash an existing file in chunks.
async fn digest_file(path: &Path) -> Result<String, DrifterError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| DrifterError::Io {
            context: format!("opening {}", path.display()),
            source: e,
        })?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut chunk).await.map_err(|e| DrifterError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming sink that keeps a running digest of everything written.
/// Both retrieval schemes funnel through this, so the digest always covers
/// exactly the bytes on disk.
struct DigestWriter {
    file: tokio::fs::File,
    hasher: Sha256,
    pb: ProgressBar,
}

impl DigestWriter {
    async fn create(dest: &Path, total: u64) -> Result<Self, DrifterError> {
        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| DrifterError::Io {
                context: format!("creating temp file {}", dest.display()),
                source: e,
            })?;
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        Ok(Self {
            file,
            hasher: Sha256::new(),
            pb,
        })
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), DrifterError> {
        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| DrifterError::Io {
                context: "writing archive data".into(),
                source: e,
            })?;
        self.pb.inc(chunk.len() as u64);
        Ok(())
    }

    async fn finish(mut self) -> Result<String, DrifterError> {
        self.file.flush().await.map_err(|e| DrifterError::Io {
            context: "flushing archive file".into(),
            source: e,
        })?;
        self.pb.finish_and_clear();
        Ok(hex::encode(self.hasher.finalize()))
    }
}

/// Retrieve `url` into `dest`, returning the digest of the written bytes.
/// Supports `file://` and `http(s)://` locators.
async fn download(url: &str, dest: &Path) -> Result<String, DrifterError> {
    if let Some(local) = url.strip_prefix("file://") {
        let mut src = tokio::fs::File::open(local)
            .await
            .map_err(|e| DrifterError::Io {
                context: format!("opening {local}"),
                source: e,
            })?;
        let total = src.metadata().await.map(|m| m.len()).unwrap_or(0);
        let mut sink = DigestWriter::create(dest, total).await?;
        let mut chunk = vec![0u8; 1 << 16];
        loop {
            let n = src.read(&mut chunk).await.map_err(|e| DrifterError::Io {
                context: format!("reading {local}"),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            sink.write_chunk(&chunk[..n]).await?;
        }
        sink.finish().await
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::get(url).await.map_err(|e| DrifterError::Download {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(DrifterError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        let total = response.content_length().unwrap_or(0);
        let mut sink = DigestWriter::create(dest, total).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DrifterError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            sink.write_chunk(&chunk).await?;
        }
        sink.finish().await
    } else {
        Err(DrifterError::Validation {
            message: format!("unsupported url scheme: {url}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn fixture_boxcar(source: &Path, data: &[u8]) -> Boxcar {
        std::fs::write(source, data).unwrap();
        Boxcar {
            name: "demo".into(),
            url: format!("file://{}", source.display()),
            version: "1".into(),
            sha256: sha256_hex(data),
            bootstrap_cmd_lines: vec![],
        }
    }

    #[test]
    fn archive_path_uses_final_url_segment() {
        let bxc = Boxcar {
            url: "https://example.com/images/demo.tgz".into(),
            ..Boxcar::default()
        };
        assert_eq!(
            archive_path(Path::new("/cache"), &bxc),
            PathBuf::from("/cache/demo.tgz")
        );
    }

    #[tokio::test]
    async fn second_fetch_serves_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo.tgz");
        let cache = dir.path().join("cache");
        let bxc = fixture_boxcar(&source, b"archive-bytes");

        let first = fetch(&bxc, &cache).await.unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), b"archive-bytes");

        // Remove the source: a second fetch must not need it.
        std::fs::remove_file(&source).unwrap();
        let second = fetch(&bxc, &cache).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupt_cached_artifact_is_deleted_then_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo.tgz");
        let cache = dir.path().join("cache");
        let bxc = fixture_boxcar(&source, b"archive-bytes");

        let cached = fetch(&bxc, &cache).await.unwrap();
        std::fs::write(&cached, b"corrupted").unwrap();

        let err = fetch(&bxc, &cache).await.unwrap_err();
        assert!(matches!(err, DrifterError::DigestMismatch { .. }));
        assert!(!cached.exists(), "corrupt artifact must be deleted");

        // The next fetch starts clean and succeeds.
        let refetched = fetch(&bxc, &cache).await.unwrap();
        assert_eq!(std::fs::read(&refetched).unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn declared_digest_mismatch_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo.tgz");
        let cache = dir.path().join("cache");
        let mut bxc = fixture_boxcar(&source, b"archive-bytes");
        bxc.sha256 = "0".repeat(64);

        let err = fetch(&bxc, &cache).await.unwrap_err();
        match err {
            DrifterError::DigestMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "0".repeat(64));
                assert_eq!(actual, sha256_hex(b"archive-bytes"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(!archive_path(&cache, &bxc).exists());
        // No temp litter either.
        let leftovers: Vec<_> = std::fs::read_dir(&cache).unwrap().collect();
        assert!(leftovers.is_empty(), "temp files must be cleaned up");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let bxc = Boxcar {
            name: "demo".into(),
            url: format!("file://{}/absent.tgz", dir.path().display()),
            sha256: "a".repeat(64),
            ..Boxcar::default()
        };
        assert!(matches!(
            fetch(&bxc, &cache).await.unwrap_err(),
            DrifterError::Io { .. }
        ));
    }
}
