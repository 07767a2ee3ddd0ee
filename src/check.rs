// # Integrity Check and Repair
//
// Reconciles the index against the file heap under one transaction: the
// engine's own integrity check, file agreement for out-of-line values,
// orphaned files and empty directories, and the trigger-maintained
// counters. Inconsistencies are reported as warnings and, when `fix` is
// set, repaired in place. Two successive repair runs converge to a clean
// report.

use crate::cache::Cache;
use crate::error::Result;
use crate::store::DBNAME;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

const ROW_CHUNK: i64 = 100;

pub(crate) fn run(cache: &Cache, fix: bool) -> Result<Vec<String>> {
    let warnings = cache.store.transact(true, |scope| {
        let conn = scope.conn();
        let mut warnings = Vec::new();

        // Engine-level structural check.
        {
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            let lines = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for line in lines {
                let line = line?;
                if line != "ok" {
                    warnings.push(format!("integrity check: {}", line));
                }
            }
        }

        // File agreement: every filename row must point at a real file of
        // at least the recorded size.
        let mut referenced: HashSet<String> = HashSet::new();
        let mut last_rowid = 0i64;
        loop {
            let rows: Vec<(i64, i64, String)> = {
                let mut stmt = conn.prepare(
                    "SELECT rowid, size, filename FROM Cache \
                     WHERE rowid > ?1 AND filename IS NOT NULL \
                     ORDER BY rowid LIMIT ?2",
                )?;
                let mapped = stmt.query_map(rusqlite::params![last_rowid, ROW_CHUNK], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row?);
                }
                rows
            };

            for (rowid, size, filename) in &rows {
                last_rowid = *rowid;
                let full_path = cache.heap.path(filename);
                match fs::metadata(&full_path) {
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        warnings.push(format!("missing file for row {}: {}", rowid, filename));
                        if fix {
                            conn.execute(
                                "DELETE FROM Cache WHERE rowid = ?1",
                                rusqlite::params![rowid],
                            )?;
                        }
                    }
                    Err(e) => return Err(e.into()),
                    Ok(meta) if (meta.len() as i64) < *size => {
                        warnings.push(format!(
                            "file {} is {} bytes, row {} expects at least {}",
                            filename,
                            meta.len(),
                            rowid,
                            size
                        ));
                        if fix {
                            conn.execute(
                                "DELETE FROM Cache WHERE rowid = ?1",
                                rusqlite::params![rowid],
                            )?;
                            // The file is already corrupt; removing it now
                            // lets the empty-directory sweep below see the
                            // result in this same pass.
                            match fs::remove_file(&full_path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                    Ok(_) => {
                        referenced.insert(filename.clone());
                    }
                }
            }

            if (rows.len() as i64) < ROW_CHUNK {
                break;
            }
        }

        // Orphans: regular files under the root no row refers to. The
        // index store file and its sidecars are excluded.
        let root = cache.directory().to_path_buf();
        let (files, mut dirs) = walk_tree(&root)?;
        for path in files {
            let Some(relative) = relative_name(&root, &path) else {
                continue;
            };
            if is_store_file(&relative) {
                continue;
            }
            if !referenced.contains(&relative) {
                warnings.push(format!("unreferenced file: {}", relative));
                if fix {
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        // Empty directories are ordinary debris left by file deletion, not
        // an inconsistency; repair prunes them silently, deepest first.
        if fix {
            dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
            for dir in dirs {
                if fs::read_dir(&dir)?.next().is_none() {
                    match fs::remove_dir(&dir) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        // Counters, recomputed last so row repairs above are reflected.
        let (actual_count, actual_size): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM Cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let stored_count: i64 = conn.query_row(
            "SELECT value FROM Settings WHERE key = 'count'",
            [],
            |row| row.get(0),
        )?;
        let stored_size: i64 = conn.query_row(
            "SELECT value FROM Settings WHERE key = 'size'",
            [],
            |row| row.get(0),
        )?;
        if stored_count != actual_count {
            warnings.push(format!(
                "count counter is {}, table holds {} rows",
                stored_count, actual_count
            ));
            if fix {
                conn.execute(
                    "UPDATE Settings SET value = ?1 WHERE key = 'count'",
                    rusqlite::params![actual_count],
                )?;
            }
        }
        if stored_size != actual_size {
            warnings.push(format!(
                "size counter is {}, rows sum to {}",
                stored_size, actual_size
            ));
            if fix {
                conn.execute(
                    "UPDATE Settings SET value = ?1 WHERE key = 'size'",
                    rusqlite::params![actual_size],
                )?;
            }
        }

        Ok(warnings)
    })?;

    if fix && !warnings.is_empty() {
        info!(repairs = warnings.len(), "cache repaired");
    }
    Ok(warnings)
}

/// Collect every regular file and directory under `root`, excluding the
/// root itself.
fn walk_tree(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    Ok((files, dirs))
}

/// Path relative to the cache root with forward-slash separators, as
/// stored in filename columns.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn is_store_file(relative: &str) -> bool {
    relative.starts_with(DBNAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_name() {
        let root = Path::new("/tmp/cache");
        let path = root.join("ab").join("cd").join("xyz.val");
        assert_eq!(
            relative_name(root, &path),
            Some("ab/cd/xyz.val".to_string())
        );
        assert_eq!(relative_name(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn test_store_files_excluded() {
        assert!(is_store_file("cache.db"));
        assert!(is_store_file("cache.db-wal"));
        assert!(is_store_file("cache.db-shm"));
        assert!(!is_store_file("ab/cd/xyz.val"));
    }
}
