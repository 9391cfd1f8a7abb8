//! Where a new toolkit version comes from: the package registry or a local
//! checkout. A source is validated structurally before anything reads from it,
//! and registry artifacts are staged in an isolated temp dir so the live
//! installation is never touched during acquisition.

use crate::error::{PlankitError, Result};
use crate::manifest::{ToolkitManifest, TOOLKIT_NAME};
use crate::paths;
use crate::process::run_command;
use crate::registry::VersionLookup;
use crate::resolver::VersionResolver;
use crate::version::{parse_version, Version};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// UpgradeSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpgradeSource {
    Registry {
        package: String,
        version: Option<Version>,
    },
    Local {
        path: PathBuf,
    },
}

impl UpgradeSource {
    /// Interpret an explicit `--source` argument.
    ///
    /// Anything that looks like a path (or names an existing directory) is a
    /// local source; everything else is `package` or `package@version`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = home::home_dir() {
                return Ok(UpgradeSource::Local {
                    path: home.join(rest),
                });
            }
        }
        let looks_like_path = raw.starts_with('.')
            || raw.starts_with('/')
            || raw.contains('\\')
            || Path::new(raw).is_dir();
        if looks_like_path {
            return Ok(UpgradeSource::Local {
                path: PathBuf::from(raw),
            });
        }

        // `@scope/name@1.2.3`: the version separator is the last '@' past index 0.
        match raw.rfind('@').filter(|idx| *idx > 0) {
            Some(idx) => Ok(UpgradeSource::Registry {
                package: raw[..idx].to_string(),
                version: Some(parse_version(&raw[idx + 1..])?),
            }),
            None => Ok(UpgradeSource::Registry {
                package: raw.to_string(),
                version: None,
            }),
        }
    }
}

impl std::fmt::Display for UpgradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeSource::Registry {
                package,
                version: Some(v),
            } => write!(f, "registry:{package}@{v}"),
            UpgradeSource::Registry {
                package,
                version: None,
            } => write!(f, "registry:{package}"),
            UpgradeSource::Local { path } => write!(f, "local:{}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedSource
// ---------------------------------------------------------------------------

/// A validated toolkit tree ready to upgrade from.
///
/// Registry sources own their staging dir; it is removed when this is dropped.
#[derive(Debug)]
pub struct ResolvedSource {
    pub source: UpgradeSource,
    pub tree: PathBuf,
    pub version: Version,
    staging: Option<TempDir>,
}

impl ResolvedSource {
    pub fn local(tree: PathBuf, version: Version) -> Self {
        Self {
            source: UpgradeSource::Local { path: tree.clone() },
            tree,
            version,
            staging: None,
        }
    }

    pub fn is_staged(&self) -> bool {
        self.staging.is_some()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `tree` is a complete plankit tree: manifest with the toolkit
/// identity plus every required subdirectory. Any gap rejects the whole tree.
pub fn validate_source_tree(tree: &Path) -> Result<ToolkitManifest> {
    let invalid = |reason: String| PlankitError::InvalidSource {
        path: tree.to_path_buf(),
        reason,
    };

    if !tree.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    let manifest = ToolkitManifest::load(tree).map_err(|e| invalid(e.to_string()))?;
    if !manifest.is_toolkit() {
        return Err(invalid(format!(
            "manifest declares '{}', expected '{TOOLKIT_NAME}'",
            manifest.name
        )));
    }
    for dir in paths::REQUIRED_SUBDIRS {
        if !tree.join(dir).is_dir() {
            return Err(invalid(format!("missing required directory '{dir}/'")));
        }
    }
    Ok(manifest)
}

/// Local candidates in probe order: env override, configured paths, then the
/// conventional locations relative to `root`.
pub fn candidate_paths(
    root: &Path,
    env_override: Option<PathBuf>,
    configured: &[String],
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = env_override {
        candidates.push(path);
    }
    for rel in configured {
        candidates.push(root.join(rel));
    }
    for rel in paths::LOCAL_CANDIDATES {
        candidates.push(root.join(rel));
    }
    candidates
}

/// [`candidate_paths`] with the override read from `PLANKIT_UPGRADE_PATH`.
pub fn candidate_paths_from_env(root: &Path, configured: &[String]) -> Vec<PathBuf> {
    let env_override = std::env::var_os(paths::UPGRADE_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    candidate_paths(root, env_override, configured)
}

// ---------------------------------------------------------------------------
// SourceAcquirer
// ---------------------------------------------------------------------------

pub struct SourceAcquirer<'a> {
    resolver: &'a VersionResolver,
    candidates: Vec<PathBuf>,
}

impl<'a> SourceAcquirer<'a> {
    pub fn new(resolver: &'a VersionResolver, candidates: Vec<PathBuf>) -> Self {
        Self {
            resolver,
            candidates,
        }
    }

    /// Resolve the tree to upgrade from.
    ///
    /// An explicit local source is used as-is or rejected. Registry sources
    /// (explicit or the default package) fall back to the local candidates
    /// when the registry is unreachable or the artifact cannot be fetched.
    pub fn resolve(&self, explicit: Option<&UpgradeSource>) -> Result<ResolvedSource> {
        match explicit {
            Some(UpgradeSource::Local { path }) => self.acquire_local(path),
            Some(UpgradeSource::Registry { package, version }) => {
                let attempt = self.acquire_registry(package, version.as_ref());
                self.or_local_fallback(package, attempt)
            }
            None => {
                let package = self.resolver.package();
                let attempt = self.acquire_registry(package, None);
                self.or_local_fallback(package, attempt)
            }
        }
    }

    fn acquire_local(&self, path: &Path) -> Result<ResolvedSource> {
        let manifest = validate_source_tree(path)?;
        info!(path = %path.display(), version = %manifest.version, "using local source");
        Ok(ResolvedSource::local(path.to_path_buf(), manifest.version))
    }

    fn acquire_registry(&self, package: &str, pinned: Option<&Version>) -> Result<ResolvedSource> {
        let version = match pinned {
            Some(v) => v.clone(),
            None => match self.resolver.registry().latest_version(package) {
                VersionLookup::Available(v) => v,
                VersionLookup::Unavailable(reason) => {
                    return Err(PlankitError::SourceUnavailable(reason))
                }
            },
        };
        self.fetch_registry(package, &version)
    }

    fn fetch_registry(&self, package: &str, version: &Version) -> Result<ResolvedSource> {
        let registry = self.resolver.registry();
        let staging = tempfile::Builder::new()
            .prefix("plankit-upgrade-")
            .tempdir()?;
        let url = registry.tarball_url(package, version)?;
        let archive = staging.path().join("package.tgz");
        registry.download(&url, &archive)?;
        extract_tarball(&archive, staging.path())?;

        let tree = staging.path().join("package");
        let manifest = validate_source_tree(&tree)?;
        if manifest.version != *version {
            return Err(PlankitError::InvalidSource {
                path: tree,
                reason: format!(
                    "artifact declares {}, registry advertised {version}",
                    manifest.version
                ),
            });
        }
        info!(package, %version, "fetched registry source");
        Ok(ResolvedSource {
            source: UpgradeSource::Registry {
                package: package.to_string(),
                version: Some(version.clone()),
            },
            tree,
            version: version.clone(),
            staging: Some(staging),
        })
    }

    fn or_local_fallback(
        &self,
        package: &str,
        attempt: Result<ResolvedSource>,
    ) -> Result<ResolvedSource> {
        match attempt {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                warn!(package, error = %e, "registry source failed; trying local candidates");
                self.search_local(vec![format!("registry package '{package}' ({e})")])
            }
        }
    }

    fn search_local(&self, mut tried: Vec<String>) -> Result<ResolvedSource> {
        for candidate in &self.candidates {
            match validate_source_tree(candidate) {
                Ok(manifest) => {
                    info!(path = %candidate.display(), version = %manifest.version, "using local fallback source");
                    return Ok(ResolvedSource::local(candidate.clone(), manifest.version));
                }
                Err(e) => tried.push(format!("{} ({e})", candidate.display())),
            }
        }
        Err(PlankitError::SourceNotFound { tried })
    }
}

fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let tar = which::which("tar")
        .map_err(|_| PlankitError::SourceUnavailable("'tar' not found on PATH".to_string()))?;
    let archive_arg = archive.to_string_lossy().into_owned();
    let dest_arg = dest.to_string_lossy().into_owned();
    let output = run_command(&tar, &["-xzf", &archive_arg, "-C", &dest_arg], dest)?;
    if !output.success {
        return Err(PlankitError::SourceUnavailable(format!(
            "failed extracting {}: {}",
            archive.display(),
            output.tail()
        )));
    }
    Ok(())
}
