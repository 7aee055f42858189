use crate::db::MATERIALS_DIR;
use anyhow::{anyhow, Context};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Workspace-relative, forward slashes.
    pub file_url: String,
    pub sha256: String,
    pub size: u64,
    pub mime: &'static str,
}

pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).context("failed to read source file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copies `source` into the workspace material store under its content hash.
/// Identical uploads share one stored file.
pub fn store_material_file(
    workspace: &Path,
    source: &Path,
    max_bytes: u64,
) -> anyhow::Result<StoredFile> {
    let meta = std::fs::metadata(source)
        .with_context(|| format!("source file not found: {}", source.to_string_lossy()))?;
    if !meta.is_file() {
        return Err(anyhow!("not a file: {}", source.to_string_lossy()));
    }
    if meta.len() > max_bytes {
        return Err(anyhow!(
            "file is {} bytes; the limit is {} bytes",
            meta.len(),
            max_bytes
        ));
    }

    let sha = sha256_file(source)?;
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    let file_url = format!("{}/{}{}", MATERIALS_DIR, sha, ext);
    let dst = resolve(workspace, &file_url);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    if !dst.is_file() {
        std::fs::copy(source, &dst).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
    }

    Ok(StoredFile {
        file_url,
        sha256: sha,
        size: meta.len(),
        mime: mime_for(source),
    })
}

pub fn resolve(workspace: &Path, file_url: &str) -> PathBuf {
    file_url
        .split('/')
        .filter(|p| !p.is_empty() && *p != "..")
        .fold(workspace.to_path_buf(), |acc, p| acc.join(p))
}

/// Deletes the stored file once no material row points at it any more.
pub fn remove_if_unreferenced(
    conn: &Connection,
    workspace: &Path,
    file_url: &str,
) -> anyhow::Result<bool> {
    let refs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM teaching_materials WHERE file_url = ?",
        [file_url],
        |r| r.get(0),
    )?;
    if refs > 0 {
        return Ok(false);
    }
    let p = resolve(workspace, file_url);
    if p.is_file() {
        std::fs::remove_file(&p)
            .with_context(|| format!("failed to remove {}", p.to_string_lossy()))?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn identical_content_is_stored_once() {
        let ws = temp_dir("portald-storage-ws");
        let src_dir = temp_dir("portald-storage-src");
        let a = src_dir.join("notes.PDF");
        let b = src_dir.join("copy.pdf");
        std::fs::write(&a, b"lecture one").unwrap();
        std::fs::write(&b, b"lecture one").unwrap();

        let sa = store_material_file(&ws, &a, 1024).unwrap();
        let sb = store_material_file(&ws, &b, 1024).unwrap();
        assert_eq!(sa.file_url, sb.file_url);
        assert!(sa.file_url.ends_with(".pdf"));
        assert_eq!(sa.size, 11);
        assert_eq!(sa.mime, "application/pdf");
        assert!(resolve(&ws, &sa.file_url).is_file());
    }

    #[test]
    fn oversized_files_are_rejected() {
        let ws = temp_dir("portald-storage-limit");
        let src = ws.join("big.bin");
        std::fs::write(&src, vec![0u8; 32]).unwrap();
        assert!(store_material_file(&ws, &src, 16).is_err());
    }

    #[test]
    fn resolve_ignores_parent_segments() {
        let ws = PathBuf::from("/tmp/ws");
        assert_eq!(resolve(&ws, "materials/../../etc/passwd"), ws.join("materials/etc/passwd"));
    }
}
