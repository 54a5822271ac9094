//! Files written on behalf of the user: downloaded datasets and exported artifacts.
//!
//! Names are claimed with `create_new`, so two saves never write to the same file.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const DOWNLOAD_NAME: &str = "feature_data";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// The user's download directory, falling back to home and then the working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn timestamp_slug() -> String {
    let fmt = time::macros::format_description!("[year][month][day]-[hour][minute][second]");
    time::OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "now".into())
}

/// Open `<stem>.<ext>`, or the first free `<stem>-<n>.<ext>`.
fn create_unique(dir: &Path, stem: &str, ext: &str) -> Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for n in 0..MAX_NAME_ATTEMPTS {
        let name = match n {
            0 => format!("{stem}.{ext}"),
            n => format!("{stem}-{n}.{ext}"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
        }
    }
    anyhow::bail!(
        "no free name for {stem}.{ext} in {} after {MAX_NAME_ATTEMPTS} attempts",
        dir.display()
    )
}

/// Save a downloaded dataset as `feature_data.csv`, numbering the name if it is taken.
pub fn save_download(dir: Option<&Path>, bytes: &[u8]) -> Result<PathBuf> {
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_download_dir);
    let (path, mut file) = create_unique(&dir, DOWNLOAD_NAME, "csv")?;
    file.write_all(bytes)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Write `value` as pretty JSON to `<dir>/<stem>-<timestamp>.json`.
pub fn export_artifact<T: Serialize>(dir: &Path, stem: &str, value: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(value).context("serialize artifact")?;
    let (path, mut file) = create_unique(dir, &format!("{stem}-{}", timestamp_slug()), "json")?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
