//! Walks watch folders for candidate media files and computes content hashes.

use globset::{Glob, GlobSetBuilder};
pub use globset::GlobSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::task;
use walkdir::WalkDir;

/// Full-file blake3 hex digest; the identity of a tracked file.
pub fn content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Lists regular, non-hidden files under `roots` that no exclude glob matches.
pub async fn discover(roots: &[PathBuf], excludes: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let filter = exclude_set(excludes)?;
    let roots = roots.to_vec();
    let found = task::spawn_blocking(move || {
        let mut found = Vec::new();
        for root in roots {
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || is_candidate(e.path(), &filter))
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if entry.file_type().is_file() {
                    found.push(entry.into_path());
                }
            }
        }
        found.sort();
        found
    })
    .await?;
    Ok(found)
}

pub fn exclude_set(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat)?);
    }
    Ok(builder.build()?)
}

/// Neither hidden nor matched by an exclude glob.
pub fn is_candidate(path: &Path, excludes: &GlobSet) -> bool {
    !excludes.is_match(path) && !is_hidden(path)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}
