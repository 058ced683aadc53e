use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::HandlerError;

const MAX_FILENAME_LEN: usize = 255;

/// `(token, strftime pattern)`; an empty pattern means the token itself is
/// a strftime specifier.
const SPECIFIERS: [(&str, &str); 23] = [
    ("%CCYY", "%Y"),
    ("%YY", "%y"),
    ("%MM", "%m"),
    ("%DD", "%d"),
    ("%hh", "%H"),
    ("%mm", "%M"),
    ("%ss", "%S"),
    ("%%", "%%"),
    ("%a", ""),
    ("%A", ""),
    ("%b", ""),
    ("%B", ""),
    ("%d", ""),
    ("%H", ""),
    ("%I", ""),
    ("%m", ""),
    ("%M", ""),
    ("%p", ""),
    ("%S", ""),
    ("%y", ""),
    ("%Y", ""),
    ("%z", ""),
    ("%Z", ""),
];

/// Expands a recording filename template such as
/// `"%CCYY-%MM-%DD %hh-%mm-%ss"` and appends the extension.
///
/// Unknown `%` sequences lose their `%`; specifiers that expand to nothing
/// are dropped.
pub fn generate_specified_filename(
    extension: &str,
    no_space: bool,
    format: &str,
    now: &DateTime<Local>,
) -> String {
    let mut out = String::with_capacity(format.len() + extension.len() + 8);
    let mut rest = format;
    while let Some(ch) = rest.chars().next() {
        if let Some((token, pattern)) = SPECIFIERS.iter().find(|(t, _)| rest.starts_with(t)) {
            let pattern = if pattern.is_empty() { token } else { pattern };
            let expanded = now.format(pattern).to_string();
            if !expanded.trim_matches(' ').is_empty() {
                out.push_str(&expanded);
            }
            rest = &rest[token.len()..];
        } else {
            if ch != '%' {
                out.push(ch);
            }
            rest = &rest[ch.len_utf8()..];
        }
    }

    if no_space {
        out = out.replace(' ', "_");
    }
    out.push('.');
    out.push_str(extension);

    if out.chars().count() > MAX_FILENAME_LEN {
        out = out.chars().take(MAX_FILENAME_LEN).collect();
    }
    out
}

/// Appends ` (2)`, ` (3)`, ... (or `_2`, `_3` without spaces) before the
/// extension until the name is free.
pub async fn find_best_filename(path: PathBuf, no_space: bool) -> PathBuf {
    if !exists(&path).await {
        return path;
    }
    let full = path.to_string_lossy().into_owned();
    let Some(ext_start) = full.rfind('.') else {
        return path;
    };

    let mut num = 2;
    loop {
        let suffix = if no_space {
            format!("_{num}")
        } else {
            format!(" ({num})")
        };
        let mut candidate = full.clone();
        candidate.insert_str(ext_start, &suffix);
        let candidate = PathBuf::from(candidate);
        if !exists(&candidate).await {
            return candidate;
        }
        num += 1;
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Creates the directories a generated filename may contain.
pub async fn ensure_directory_exists(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Checks that `dir` is a writable directory and returns a fresh recording
/// file path inside it.
pub async fn prepare_recording_path(
    dir: &str,
    extension: &str,
    no_space: bool,
    format: &str,
    overwrite: bool,
) -> Result<PathBuf, HandlerError> {
    let dir_path = PathBuf::from(dir);
    let bad_path = || HandlerError::BadPath(dir_path.clone());
    if dir.is_empty() {
        return Err(bad_path());
    }
    let meta = tokio::fs::metadata(&dir_path).await.map_err(|_| bad_path())?;
    if !meta.is_dir() || meta.permissions().readonly() {
        return Err(bad_path());
    }

    let name = generate_specified_filename(extension, no_space, format, &Local::now());
    let path = dir_path.join(name);
    ensure_directory_exists(&path).await.map_err(|e| {
        log::warn!("create directories for {}: {}", path.display(), e);
        bad_path()
    })?;

    if overwrite {
        Ok(path)
    } else {
        Ok(find_best_filename(path, no_space).await)
    }
}
