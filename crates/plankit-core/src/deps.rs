//! Dependency installation for the helper scripts an installation ships.
//!
//! Installation is an opaque blocking step: the package manager runs to
//! completion and only its exit status matters. An installation without a
//! `package.json` has nothing to install.

use crate::error::{PlankitError, Result};
use crate::paths;
use crate::process::run_command;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed { tool: String },
    Skipped { reason: String },
}

pub trait DependencyInstaller {
    fn install(&self, install_dir: &Path) -> Result<InstallOutcome>;
}

/// Package managers in priority order, with their production-only install args.
const PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("npm", &["install", "--omit=dev", "--no-audit", "--no-fund"]),
    ("bun", &["install", "--production"]),
];

/// Runs the first package manager found on PATH.
#[derive(Debug, Clone, Default)]
pub struct PackageManagerInstaller {
    /// Fixed executable instead of PATH detection.
    program: Option<(PathBuf, Vec<String>)>,
}

impl PackageManagerInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: Some((program.into(), args)),
        }
    }

    fn detect(&self) -> Option<(PathBuf, Vec<String>)> {
        if let Some(program) = &self.program {
            return Some(program.clone());
        }
        PACKAGE_MANAGERS.iter().find_map(|(name, args)| {
            which::which(name)
                .ok()
                .map(|path| (path, args.iter().map(|a| a.to_string()).collect()))
        })
    }
}

impl DependencyInstaller for PackageManagerInstaller {
    fn install(&self, install_dir: &Path) -> Result<InstallOutcome> {
        if !install_dir.join(paths::PACKAGE_JSON).is_file() {
            return Ok(InstallOutcome::Skipped {
                reason: "no package.json".to_string(),
            });
        }
        let (program, args) = self.detect().ok_or_else(|| {
            PlankitError::DependencyInstallFailed("no package manager (npm, bun) on PATH".to_string())
        })?;
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        info!(%tool, dir = %install_dir.display(), "installing dependencies");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command(&program, &arg_refs, install_dir)
            .map_err(|e| PlankitError::DependencyInstallFailed(format!("{tool}: {e}")))?;
        if !output.success {
            return Err(PlankitError::DependencyInstallFailed(format!(
                "{tool} exited with {}: {}",
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.tail()
            )));
        }
        Ok(InstallOutcome::Installed { tool })
    }
}

/// Used when the caller opted out of dependency installation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipDependencies;

impl DependencyInstaller for SkipDependencies {
    fn install(&self, _install_dir: &Path) -> Result<InstallOutcome> {
        Ok(InstallOutcome::Skipped {
            reason: "dependency installation disabled".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn no_package_json_is_skipped() {
        let dir = TempDir::new().unwrap();
        let outcome = PackageManagerInstaller::new().install(dir.path()).unwrap();
        assert!(matches!(outcome, InstallOutcome::Skipped { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn failing_package_manager_is_an_install_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let installer = PackageManagerInstaller::with_program(
            "sh",
            vec!["-c".to_string(), "echo resolution failed >&2; exit 1".to_string()],
        );
        let err = installer.install(dir.path()).unwrap_err();
        match err {
            PlankitError::DependencyInstallFailed(msg) => {
                assert!(msg.contains("resolution failed"), "{msg}");
            }
            other => panic!("expected DependencyInstallFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_package_manager_reports_tool() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let installer =
            PackageManagerInstaller::with_program("sh", vec!["-c".to_string(), "exit 0".to_string()]);
        assert_eq!(
            installer.install(dir.path()).unwrap(),
            InstallOutcome::Installed {
                tool: "sh".to_string()
            }
        );
    }
}
