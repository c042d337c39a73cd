use std::path::{Path, PathBuf};

const FALLBACK_CATEGORY: &str = "UNKNOWN";

/// Characters rejected in a path component on at least one supported OS.
const INVALID_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turns a free-form category label into a single directory name.
///
/// Uppercases, drops characters that are illegal in file names, and maps
/// spaces to underscores. Empty results, and results made only of dots
/// (`.`, `..`), fall back to `UNKNOWN`.
pub fn sanitize_category(category: &str) -> String {
    let cleaned: String = category
        .to_uppercase()
        .chars()
        .filter(|c| !INVALID_CHARS.contains(c) && !c.is_control())
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        FALLBACK_CATEGORY.to_string()
    } else {
        cleaned
    }
}

/// `<library_root>/<SANITIZED_CATEGORY>/<file_name>`
pub fn library_target(library_root: &Path, category: &str, file_name: &str) -> PathBuf {
    library_root
        .join(sanitize_category(category))
        .join(file_name)
}

/// Whether a file name contains characters no supported OS accepts.
pub fn has_invalid_file_name_chars(name: &str) -> bool {
    name.chars()
        .any(|c| c == '\0' || c.is_control() || (cfg!(windows) && INVALID_CHARS.contains(&c)))
}

/// Picks `name_1.ext`, `name_2.ext`, ... next to `dest` until one is free.
pub fn resolve_conflict(dest: &Path) -> PathBuf {
    let stem = dest
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = dest
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut counter = 1;
    loop {
        let name = if ext.is_empty() {
            format!("{}_{}", stem, counter)
        } else {
            format!("{}_{}.{}", stem, counter, ext)
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
