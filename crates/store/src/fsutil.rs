use std::io::Write;
use std::path::{Path, PathBuf};

use ct_domain::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize values to a JSONL buffer.
pub(crate) fn to_jsonl<T: Serialize>(items: &[T]) -> Result<String> {
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    Ok(buf)
}

pub(crate) fn append_sync(path: &Path, buf: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(buf.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// Append on a blocking thread so file I/O never stalls the runtime.
pub(crate) async fn append(path: PathBuf, buf: String) -> Result<()> {
    tokio::task::spawn_blocking(move || append_sync(&path, &buf))
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
}

/// Write-to-temp then rename, so readers never see a torn file.
pub(crate) fn write_atomic_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &bytes))
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
}

/// Read a JSONL file, skipping (and logging) malformed lines.
pub(crate) fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)?;
    let mut items = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed line"
                );
            }
        }
    }
    Ok(items)
}
