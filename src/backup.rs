use crate::db::{DB_FILE, MATERIALS_DIR};
use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/portal.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "portal-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub material_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub material_count: usize,
}

fn material_files(workspace_path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let dir = workspace_path.join(MATERIALS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for ent in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to list {}", dir.to_string_lossy()))?
    {
        let p = ent?.path();
        if p.is_file() {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Writes `manifest.json`, the database and every stored material file
/// into a zip bundle at `out_path`.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let materials = material_files(workspace_path)?;
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::db::now_rfc3339(),
        "materialCount": materials.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for p in &materials {
        let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        zip.start_file(format!("{}/{}", MATERIALS_DIR, name), opts)
            .with_context(|| format!("failed to start entry for {}", name))?;
        let mut f = File::open(p)
            .with_context(|| format!("failed to open material {}", p.to_string_lossy()))?;
        std::io::copy(&mut f, &mut zip)
            .with_context(|| format!("failed to write material {}", name))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;
    tracing::info!(
        out = %out_path.to_string_lossy(),
        materials = materials.len(),
        "workspace exported"
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2 + materials.len(),
        material_count: materials.len(),
    })
}

/// Only plain `materials/<file>` entries are extracted.
fn material_entry_name(entry: &str) -> Option<String> {
    let p = Path::new(entry);
    let mut comps = p.components();
    match comps.next() {
        Some(Component::Normal(d)) if d == MATERIALS_DIR => {}
        _ => return None,
    }
    let Some(Component::Normal(name)) = comps.next() else {
        return None;
    };
    if comps.next().is_some() {
        return None;
    }
    name.to_str().map(str::to_string)
}

/// Restores a bundle into `workspace_path`, replacing the database and
/// adding any material files that are not already present. The caller must
/// close its database connection first and reopen it afterwards.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let materials_dir = workspace_path.join(MATERIALS_DIR);
    std::fs::create_dir_all(&materials_dir).with_context(|| {
        format!(
            "failed to create workspace {}",
            materials_dir.to_string_lossy()
        )
    })?;

    let dst = workspace_path.join(DB_FILE);
    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    let mut db_out = File::create(&tmp_dst).with_context(|| {
        format!(
            "failed to create temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/portal.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;
    drop(db_out);

    let mut material_count = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("failed to read bundle entry")?;
        let Some(name) = material_entry_name(entry.name()) else {
            continue;
        };
        let out = materials_dir.join(&name);
        material_count += 1;
        if out.is_file() {
            continue;
        }
        let mut f = File::create(&out)
            .with_context(|| format!("failed to create {}", out.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut f)
            .with_context(|| format!("failed to extract material {}", name))?;
    }

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;
    tracing::info!(material_count, "workspace bundle imported");

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        material_count,
    })
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
    fn bundle_carries_database_and_materials() {
        let src = temp_dir("portald-backup-src");
        let dst = temp_dir("portald-backup-dst");
        std::fs::create_dir_all(src.join(MATERIALS_DIR)).unwrap();
        std::fs::write(src.join(DB_FILE), b"sqlite-test-payload").unwrap();
        std::fs::write(src.join(MATERIALS_DIR).join("abc.pdf"), b"lecture").unwrap();

        let bundle = src.join("out").join("ws.zip");
        let export = export_workspace_bundle(&src, &bundle).expect("export");
        assert_eq!(export.entry_count, 3);
        assert_eq!(export.material_count, 1);

        let import = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(import.bundle_format_detected, BUNDLE_FORMAT_V1);
        assert_eq!(import.material_count, 1);
        assert_eq!(std::fs::read(dst.join(DB_FILE)).unwrap(), b"sqlite-test-payload");
        assert_eq!(
            std::fs::read(dst.join(MATERIALS_DIR).join("abc.pdf")).unwrap(),
            b"lecture"
        );
    }

    #[test]
    fn rejects_foreign_bundle_format() {
        let ws = temp_dir("portald-backup-foreign");
        let bundle = ws.join("foreign.zip");
        let mut zip = ZipWriter::new(File::create(&bundle).unwrap());
        zip.start_file(MANIFEST_ENTRY, FileOptions::default()).unwrap();
        zip.write_all(br#"{"format":"something-else"}"#).unwrap();
        zip.finish().unwrap();
        let e = import_workspace_bundle(&bundle, &ws).unwrap_err();
        assert!(e.to_string().contains("unsupported bundle format"));
    }

    #[test]
    fn only_flat_material_entries_are_extracted() {
        assert_eq!(material_entry_name("materials/a.pdf").as_deref(), Some("a.pdf"));
        assert_eq!(material_entry_name("materials/../a.pdf"), None);
        assert_eq!(material_entry_name("db/portal.sqlite3"), None);
        assert_eq!(material_entry_name("materials/x/y.pdf"), None);
    }
}
