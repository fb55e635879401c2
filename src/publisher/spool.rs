use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// `metricsave__<local time>_<8 hex>.json.gz`; the suffix keeps two spills
/// in the same second apart.
pub fn spool_file_name() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!(
        "metricsave__{}_{}.json.gz",
        Local::now().format("%Y-%m-%d_%H:%M:%S"),
        &token[..8]
    )
}

/// Writes `payload` gzip-compressed into `dir` on the blocking pool. The
/// caller does not have to wait for the handle.
pub fn spool_payload(dir: &Path, payload: Vec<u8>) -> JoinHandle<io::Result<PathBuf>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let result = write_gzip(&dir, &payload);
        match &result {
            Ok(path) => info!(
                "Saved {} bytes of undelivered metrics to {}",
                payload.len(),
                path.display()
            ),
            Err(e) => error!(
                "Failed to save undelivered metrics under {}: {}",
                dir.display(),
                e
            ),
        }
        result
    })
}

fn write_gzip(dir: &Path, payload: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(spool_file_name());

    let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()?.sync_all()?;

    Ok(path)
}
