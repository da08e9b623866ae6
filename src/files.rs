use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::platform::{FileRef, FileSource};

/// Materialize a `FileSource` into bytes plus a filename, for adapters whose
/// platforms require uploading the raw contents.
pub async fn fetch(source: &FileSource) -> Result<(Vec<u8>, String)> {
    match source {
        FileSource::Url(url) => {
            let response = reqwest::get(url)
                .await
                .with_context(|| format!("Failed to fetch file: {url}"))?
                .error_for_status()
                .with_context(|| format!("File fetch rejected: {url}"))?;
            let filename = source
                .filename()
                .unwrap_or_else(|| format!("file_{}", chrono::Utc::now().timestamp_millis()));
            let data = response.bytes().await?.to_vec();
            Ok((data, filename))
        }
        FileSource::Path(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read file: {}", path.display()))?;
            let filename = source
                .filename()
                .unwrap_or_else(|| format!("file_{}", chrono::Utc::now().timestamp_millis()));
            Ok((data, filename))
        }
        FileSource::Bytes { data, filename } => Ok((data.clone(), filename.clone())),
    }
}

/// Download an inbound attachment into `dir` under its normalized filename.
pub async fn save_file(file: &FileRef, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let data = reqwest::get(&file.url)
        .await
        .with_context(|| format!("Failed to download attachment: {}", file.url))?
        .error_for_status()?
        .bytes()
        .await?;

    let path = dir.join(&file.filename);
    tokio::fs::write(&path, &data)
        .await
        .with_context(|| format!("Failed to write attachment: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_from_bytes() {
        let source = FileSource::Bytes {
            data: vec![1, 2, 3],
            filename: "blob.bin".to_string(),
        };
        let (data, filename) = fetch(&source).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(filename, "blob.bin");
    }

    #[tokio::test]
    async fn test_fetch_from_path() {
        let dir = std::env::temp_dir();
        let path = dir.join("stepbot_fetch_test.txt");
        tokio::fs::write(&path, b"contents").await.unwrap();

        let (data, filename) = fetch(&FileSource::Path(path.clone())).await.unwrap();
        assert_eq!(data, b"contents");
        assert_eq!(filename, "stepbot_fetch_test.txt");

        tokio::fs::remove_file(&path).await.ok();
    }
}
