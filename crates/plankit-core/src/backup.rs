//! Timestamped snapshots of an installation, used as the rollback source for
//! upgrades.
//!
//! A backup is `<root>/backup-<timestamp>/` holding a copy of the installation
//! plus `.backup-metadata.json`. The metadata file is written last, so its
//! presence marks a complete backup.

use crate::error::{PlankitError, Result};
use crate::io::{atomic_write, copy_dir_recursive, copy_tree, ensure_dir, list_files};
use crate::manifest::ToolkitManifest;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Paths a backup must contain to be restorable.
pub const REQUIRED_BACKUP_PATHS: &[&str] = &[paths::MANIFEST_FILE, paths::TEMPLATES_DIR];

/// Allowed drift between recorded and actual file counts, in percent.
pub const FILE_COUNT_TOLERANCE_PCT: u64 = 5;

pub const BACKUP_PREFIX: &str = "backup-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub timestamp: String,
    pub version: String,
    pub source_dir: PathBuf,
    pub files: u64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl BackupMetadata {
    pub fn load(backup_dir: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(paths::backup_metadata_path(backup_dir))?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub name: String,
    pub path: PathBuf,
    /// `None` when the sidecar is missing or unreadable.
    pub metadata: Option<BackupMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Version to record; read from the source manifest when `None`.
    pub version: Option<String>,
    /// Extra relative paths to leave out, on top of the dependency caches.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreResult {
    pub backup: PathBuf,
    pub target: PathBuf,
    pub files_restored: u64,
    /// Excluded paths carried over from the replaced target.
    pub reattached: Vec<String>,
}

fn is_metadata_file(relative: &Path) -> bool {
    relative == Path::new(paths::BACKUP_METADATA_FILE)
}

fn within_tolerance(recorded: u64, actual: u64) -> bool {
    recorded.abs_diff(actual) * 100 <= recorded * FILE_COUNT_TOLERANCE_PCT
}

fn unique_suffix() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

// ---------------------------------------------------------------------------
// BackupManager
// ---------------------------------------------------------------------------

pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Allocate a fresh `backup-<timestamp>` directory. Same-millisecond
    /// collisions get a numeric suffix.
    fn allocate_dir(&self, timestamp: &str) -> Result<(String, PathBuf)> {
        ensure_dir(&self.root)?;
        let base = format!("{BACKUP_PREFIX}{timestamp}");
        let mut attempt = 0_u32;
        loop {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let path = self.root.join(&name);
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Copy `source_dir` into a new backup.
    ///
    /// On any failure the partial backup directory is removed before the
    /// error is returned.
    pub fn create(&self, source_dir: &Path, opts: &BackupOptions) -> Result<Backup> {
        let failed = |reason: String| PlankitError::BackupCreationFailed {
            path: source_dir.to_path_buf(),
            reason,
        };
        if !source_dir.is_dir() {
            return Err(failed("source directory does not exist".to_string()));
        }

        let created = Utc::now();
        let timestamp = created.format("%Y%m%dT%H%M%S%3fZ").to_string();
        let (name, path) = self
            .allocate_dir(&timestamp)
            .map_err(|e| failed(e.to_string()))?;

        let mut exclude: Vec<String> = paths::DEFAULT_BACKUP_EXCLUDES
            .iter()
            .map(|s| s.to_string())
            .collect();
        for extra in &opts.exclude {
            if !exclude.contains(extra) {
                exclude.push(extra.clone());
            }
        }

        let version = match &opts.version {
            Some(v) => v.clone(),
            None => ToolkitManifest::load(source_dir)
                .map(|m| m.version.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        };

        let result = copy_tree(source_dir, &path, |rel| {
            is_metadata_file(rel) || exclude.iter().any(|ex| rel.starts_with(ex))
        })
        .and_then(|files| {
            let metadata = BackupMetadata {
                timestamp,
                version,
                source_dir: source_dir.to_path_buf(),
                files,
                created,
                exclude,
            };
            let data = serde_json::to_string_pretty(&metadata)?;
            atomic_write(&paths::backup_metadata_path(&path), data.as_bytes())?;
            Ok(metadata)
        });

        match result {
            Ok(metadata) => {
                info!(backup = %path.display(), files = metadata.files, "backup created");
                Ok(Backup {
                    name,
                    path,
                    metadata: Some(metadata),
                })
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&path) {
                    warn!(backup = %path.display(), error = %cleanup, "failed removing partial backup");
                }
                Err(failed(e.to_string()))
            }
        }
    }

    /// Structural check of a backup directory. Never fails; problems are
    /// returned in [`BackupValidation::errors`].
    pub fn validate(&self, backup_dir: &Path) -> BackupValidation {
        let mut errors = Vec::new();

        if !backup_dir.is_dir() {
            errors.push(format!("{} does not exist", backup_dir.display()));
            return BackupValidation {
                valid: false,
                errors,
            };
        }

        let metadata = match BackupMetadata::load(backup_dir) {
            Ok(m) => Some(m),
            Err(e) => {
                errors.push(format!("metadata unreadable: {e}"));
                None
            }
        };

        for required in REQUIRED_BACKUP_PATHS {
            if !backup_dir.join(required).exists() {
                errors.push(format!("missing required path '{required}'"));
            }
        }

        if let Some(metadata) = &metadata {
            match list_files(backup_dir, is_metadata_file) {
                Ok(files) => {
                    let actual = files.len() as u64;
                    if !within_tolerance(metadata.files, actual) {
                        errors.push(format!(
                            "file count mismatch: metadata records {}, found {actual}",
                            metadata.files
                        ));
                    }
                }
                Err(e) => errors.push(format!("could not count files: {e}")),
            }
        }

        BackupValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Every backup under the root, newest first.
    pub fn list(&self) -> Result<Vec<Backup>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(BACKUP_PREFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let metadata = BackupMetadata::load(&path).ok();
            backups.push(Backup {
                name,
                path,
                metadata,
            });
        }
        backups.sort_by(|a, b| {
            let created = |x: &Backup| x.metadata.as_ref().map(|m| m.created);
            created(b)
                .cmp(&created(a))
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// Look a backup up by directory name. Anything but a single
    /// `backup-*` path component is rejected.
    pub fn find(&self, name: &str) -> Result<Backup> {
        let path = self.root.join(name);
        let mut components = Path::new(name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        );
        if !single || !name.starts_with(BACKUP_PREFIX) || !path.is_dir() {
            return Err(PlankitError::BackupNotFound(name.to_string()));
        }
        Ok(Backup {
            name: name.to_string(),
            metadata: BackupMetadata::load(&path).ok(),
            path,
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let backup = self.find(name)?;
        std::fs::remove_dir_all(&backup.path)?;
        info!(backup = %backup.path.display(), "backup deleted");
        Ok(())
    }

    /// Replace `target` with the contents of `backup_dir`.
    ///
    /// Refuses invalid backups. Paths the backup excluded (dependency caches
    /// and configured exclusions) are moved aside rather than copied and are
    /// put back afterwards, whatever the outcome. The rest of the current
    /// target is kept in a safety copy until the copy-in succeeds; if it
    /// fails the safety copy is put back.
    pub fn restore(&self, backup_dir: &Path, target: &Path) -> Result<RestoreResult> {
        self.restore_with(backup_dir, target, |from, to| {
            copy_tree(from, to, is_metadata_file)
        })
    }

    fn restore_with<F>(&self, backup_dir: &Path, target: &Path, copy_in: F) -> Result<RestoreResult>
    where
        F: Fn(&Path, &Path) -> Result<u64>,
    {
        let validation = self.validate(backup_dir);
        if !validation.valid {
            return Err(PlankitError::BackupValidationFailed {
                path: backup_dir.to_path_buf(),
                errors: validation.errors,
            });
        }
        let metadata = BackupMetadata::load(backup_dir)?;

        let parent = target.parent().unwrap_or(Path::new("."));
        let suffix = unique_suffix();

        let kept = SetAside::take(
            target,
            &parent.join(format!(".plankit-keep-{suffix}")),
            &metadata.exclude,
        )?;

        let safety = parent.join(format!(".plankit-restore-safety-{suffix}"));
        let had_target = target.exists();
        if had_target {
            if let Err(e) = copy_dir_recursive(target, &safety) {
                let _ = std::fs::remove_dir_all(&safety);
                kept.put_back();
                return Err(e);
            }
            if let Err(e) = std::fs::remove_dir_all(target) {
                // Whatever survived the failed removal is topped up from the safety copy.
                let _ = copy_dir_recursive(&safety, target);
                let _ = std::fs::remove_dir_all(&safety);
                kept.put_back();
                return Err(e.into());
            }
        }

        let copied = copy_in(backup_dir, target);
        let files_restored = match copied {
            Ok(n) => n,
            Err(copy_err) => {
                warn!(target = %target.display(), error = %copy_err, "restore copy failed; rolling back");
                let _ = std::fs::remove_dir_all(target);
                let rollback = if had_target {
                    copy_dir_recursive(&safety, target).map(|_| ())
                } else {
                    Ok(())
                };
                let unplaced = kept.put_back();
                return match rollback {
                    Ok(()) => {
                        let _ = std::fs::remove_dir_all(&safety);
                        Err(PlankitError::RestoreRolledBack(copy_err.to_string()))
                    }
                    Err(rollback_err) => {
                        let mut reason = format!(
                            "{copy_err}; restoring previous contents from {} also failed: {rollback_err}",
                            safety.display()
                        );
                        if !unplaced.is_empty() {
                            reason.push_str(&format!(
                                "; excluded paths left in {}",
                                kept.holding.display()
                            ));
                        }
                        Err(PlankitError::RollbackFailed {
                            backup: backup_dir.to_path_buf(),
                            reason,
                        })
                    }
                };
            }
        };

        let unplaced = kept.put_back();
        let reattached: Vec<String> = kept
            .moved
            .iter()
            .filter(|rel| !unplaced.contains(rel))
            .cloned()
            .collect();
        if had_target {
            if let Err(e) = std::fs::remove_dir_all(&safety) {
                warn!(path = %safety.display(), error = %e, "failed removing restore safety copy");
            }
        }

        info!(backup = %backup_dir.display(), target = %target.display(), files = files_restored, "backup restored");
        Ok(RestoreResult {
            backup: backup_dir.to_path_buf(),
            target: target.to_path_buf(),
            files_restored,
            reattached,
        })
    }
}

/// Excluded paths moved out of a target for the duration of a restore.
struct SetAside {
    holding: PathBuf,
    target: PathBuf,
    /// Relative paths in the order they were moved.
    moved: Vec<String>,
}

impl SetAside {
    /// Move every existing `excludes` entry of `target` under `holding`.
    /// On failure, anything already moved is put back.
    fn take(target: &Path, holding: &Path, excludes: &[String]) -> Result<Self> {
        let mut kept = SetAside {
            holding: holding.to_path_buf(),
            target: target.to_path_buf(),
            moved: Vec::new(),
        };
        for rel in excludes {
            let from = target.join(rel);
            if from.symlink_metadata().is_err() {
                continue;
            }
            let to = holding.join(rel);
            let moved = to
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::rename(&from, &to));
            if let Err(e) = moved {
                kept.put_back();
                return Err(e.into());
            }
            debug!(path = %from.display(), "set aside excluded path");
            kept.moved.push(rel.clone());
        }
        Ok(kept)
    }

    /// Return every moved path to the target, latest first so nested
    /// exclusions land inside their restored parents. Returns the paths
    /// that could not be put back; they stay under `holding`.
    fn put_back(&self) -> Vec<String> {
        let mut unplaced = Vec::new();
        for rel in self.moved.iter().rev() {
            let from = self.holding.join(rel);
            let to = self.target.join(rel);
            if to.symlink_metadata().is_ok() {
                warn!(path = %to.display(), kept = %from.display(), "excluded path reappeared; leaving the set-aside copy");
                unplaced.push(rel.clone());
                continue;
            }
            let placed = to
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::rename(&from, &to));
            if let Err(e) = placed {
                warn!(path = %to.display(), kept = %from.display(), error = %e, "failed putting back excluded path");
                unplaced.push(rel.clone());
            }
        }
        if unplaced.is_empty() && self.holding.exists() {
            let _ = std::fs::remove_dir_all(&self.holding);
        }
        unplaced
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
