use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))
}

/// Streams the file through the hasher so multi-gigabyte trajectories never
/// have to fit in memory.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| anyhow!("failed to open {} for hashing: {}", path.display(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Copies `src` into `dst_dir`, keeping the file name. Returns the new path.
pub fn copy_file_into(src: &Path, dst_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("cannot copy path without file name: {}", src.display()))?;
    ensure_dir(dst_dir)?;
    let target = dst_dir.join(name);
    fs::copy(src, &target).map_err(|e| {
        anyhow!(
            "failed to copy {} to {}: {}",
            src.display(),
            target.display(),
            e
        )
    })?;
    Ok(target)
}

/// Recursively copies `src` into `dst`, skipping any entry whose path
/// relative to `src` starts with one of `exclude`.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true; // root entry
        }
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() || entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            // fs::copy follows symlinks, so linked force-field files land as
            // plain copies.
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mdpipe_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = scratch("sha");
        let path = dir.join("a.txt");
        atomic_write_bytes(&path, b"abc").expect("write");
        assert_eq!(
            sha256_file(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = scratch("atomic");
        let path = dir.join("nested").join("record.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"ok": true})).expect("write");
        let names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["record.json".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn copy_dir_filtered_skips_excluded_prefixes() {
        let dir = scratch("copy");
        let src = dir.join("src");
        ensure_dir(&src.join("logs")).unwrap();
        fs::write(src.join("conf.gro"), "x").unwrap();
        fs::write(src.join("logs").join("old.log"), "y").unwrap();
        let dst = dir.join("dst");
        copy_dir_filtered(&src, &dst, &["logs"]).expect("copy");
        assert!(dst.join("conf.gro").exists());
        assert!(!dst.join("logs").exists());
        let _ = fs::remove_dir_all(dir);
    }
}
