use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const INSTALL_DIR: &str = ".plankit";
pub const BACKUPS_DIR: &str = ".plankit-backups";

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const CONFIG_FILE: &str = "config.yaml";
pub const MIGRATIONS_FILE: &str = "migrations.yaml";
pub const PACKAGE_JSON: &str = "package.json";
pub const BASELINE_CONFIG: &str = ".baseline/config.yaml";
pub const BACKUP_METADATA_FILE: &str = ".backup-metadata.json";

pub const TEMPLATES_DIR: &str = "templates";
pub const GUIDELINES_DIR: &str = "guidelines";
pub const SCRIPTS_DIR: &str = "scripts";
pub const DEPENDENCY_CACHE_DIR: &str = "node_modules";

/// Subdirectories every toolkit tree must carry, installed or incoming.
pub const REQUIRED_SUBDIRS: &[&str] = &[TEMPLATES_DIR, GUIDELINES_DIR, SCRIPTS_DIR];

/// Regenerable bulk directories that backups never copy.
pub const DEFAULT_BACKUP_EXCLUDES: &[&str] = &[DEPENDENCY_CACHE_DIR, ".cache"];

/// Env var pointing at a local checkout to upgrade from.
pub const UPGRADE_PATH_ENV: &str = "PLANKIT_UPGRADE_PATH";

/// Conventional local candidates, relative to the project root.
pub const LOCAL_CANDIDATES: &[&str] = &[
    "../plankit",
    "../plankit/dist",
    "vendor/plankit",
    "node_modules/plankit",
];

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn install_dir(root: &Path) -> PathBuf {
    root.join(INSTALL_DIR)
}

pub fn backups_dir(root: &Path) -> PathBuf {
    root.join(BACKUPS_DIR)
}

pub fn manifest_path(tree: &Path) -> PathBuf {
    tree.join(MANIFEST_FILE)
}

pub fn config_path(tree: &Path) -> PathBuf {
    tree.join(CONFIG_FILE)
}

pub fn migrations_path(tree: &Path) -> PathBuf {
    tree.join(MIGRATIONS_FILE)
}

pub fn baseline_config_path(tree: &Path) -> PathBuf {
    tree.join(BASELINE_CONFIG)
}

pub fn backup_metadata_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join(BACKUP_METADATA_FILE)
}

/// Render a relative path with forward slashes regardless of platform.
pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            manifest_path(&install_dir(root)),
            PathBuf::from("/tmp/proj/.plankit/manifest.yaml")
        );
        assert_eq!(
            baseline_config_path(&install_dir(root)),
            PathBuf::from("/tmp/proj/.plankit/.baseline/config.yaml")
        );
        assert_eq!(backups_dir(root), PathBuf::from("/tmp/proj/.plankit-backups"));
    }

    #[test]
    fn normalize_uses_forward_slashes() {
        let rel = Path::new("templates").join("stages").join("plan.md");
        assert_eq!(normalize_relative(&rel), "templates/stages/plan.md");
    }
}
