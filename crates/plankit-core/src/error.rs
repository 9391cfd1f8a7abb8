use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlankitError {
    #[error("not initialized: no plankit manifest found at {0}")]
    NotInitialized(PathBuf),

    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("invalid config {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid upgrade source {path}: {reason}")]
    InvalidSource { path: PathBuf, reason: String },

    #[error("no valid upgrade source found; tried: {}", .tried.join(", "))]
    SourceNotFound { tried: Vec<String> },

    #[error("backup creation failed for {path}: {reason}")]
    BackupCreationFailed { path: PathBuf, reason: String },

    #[error("backup {path} is invalid: {}", .errors.join("; "))]
    BackupValidationFailed { path: PathBuf, errors: Vec<String> },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error(
        "config merge rejected: {}; user changes to reapply manually: {}",
        .violations.join("; "),
        format_user_changes(.user_changes)
    )]
    MergeRejected {
        violations: Vec<String>,
        user_changes: Vec<String>,
    },

    #[error(
        "migration '{id}' failed after {completed} completed ({remaining} remaining): {reason}"
    )]
    MigrationFailed {
        id: String,
        completed: usize,
        remaining: usize,
        reason: String,
    },

    #[error("unknown migration implementation '{0}'")]
    UnknownMigration(String),

    #[error("version mismatch after upgrade: expected {expected}, found {found}")]
    VersionMismatchAfterUpgrade { expected: String, found: String },

    #[error("upgraded installation is incomplete: {0}")]
    IncompleteInstallation(String),

    #[error("dependency install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("restore failed, target rolled back to its previous contents: {0}")]
    RestoreRolledBack(String),

    #[error(
        "rollback failed; manual recovery required from backup {backup}: {reason}"
    )]
    RollbackFailed { backup: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

fn format_user_changes(changes: &[String]) -> String {
    if changes.is_empty() {
        "(none)".to_string()
    } else {
        changes.join(", ")
    }
}

pub type Result<T> = std::result::Result<T, PlankitError>;
