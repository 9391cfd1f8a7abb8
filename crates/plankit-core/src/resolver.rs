use crate::error::Result;
use crate::manifest::{ToolkitManifest, TOOLKIT_NAME};
use crate::registry::{RegistryClient, VersionLookup, DEFAULT_PACKAGE};
use crate::source::UpgradeSource;
use crate::version::{self, Version, VersionDiff};
use std::path::Path;
use tracing::debug;

/// Answers "what is installed", "what is available", and "how far apart".
#[derive(Debug, Clone)]
pub struct VersionResolver {
    registry: RegistryClient,
    package: String,
}

impl VersionResolver {
    pub fn new(registry: RegistryClient, package: impl Into<String>) -> Self {
        Self {
            registry,
            package: package.into(),
        }
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// Version declared by the installation at `install_dir`.
    pub fn current_version(&self, install_dir: &Path) -> Result<Version> {
        Ok(ToolkitManifest::load(install_dir)?.version)
    }

    /// Newest version offered by `source`.
    ///
    /// Registry sources are queried with the client's timeout; local sources
    /// are read from their manifest and must declare the toolkit identity.
    pub fn latest_version(&self, source: &UpgradeSource) -> VersionLookup {
        match source {
            UpgradeSource::Registry {
                package,
                version: None,
            } => self.registry.latest_version(package),
            UpgradeSource::Registry {
                package,
                version: Some(pinned),
            } => match self.registry.tarball_url(package, pinned) {
                Ok(_) => VersionLookup::Available(pinned.clone()),
                Err(e) => VersionLookup::Unavailable(e.to_string()),
            },
            UpgradeSource::Local { path } => match ToolkitManifest::load(path) {
                Ok(manifest) if manifest.is_toolkit() => VersionLookup::Available(manifest.version),
                Ok(manifest) => VersionLookup::Unavailable(format!(
                    "{} declares '{}', expected '{TOOLKIT_NAME}'",
                    path.display(),
                    manifest.name
                )),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "local source has no usable manifest");
                    VersionLookup::Unavailable(e.to_string())
                }
            },
        }
    }

    /// Newest version on the default registry package.
    pub fn latest_registry_version(&self) -> VersionLookup {
        self.registry.latest_version(&self.package)
    }

    pub fn diff(&self, current: &Version, latest: &Version) -> VersionDiff {
        version::diff(current, latest)
    }
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new(RegistryClient::default(), DEFAULT_PACKAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::UpdateKind;
    use tempfile::TempDir;

    #[test]
    fn local_source_reads_manifest() {
        let dir = TempDir::new().unwrap();
        ToolkitManifest::new(Version::new(1, 2, 0))
            .save(dir.path())
            .unwrap();

        let resolver = VersionResolver::default();
        let lookup = resolver.latest_version(&UpgradeSource::Local {
            path: dir.path().to_path_buf(),
        });
        assert_eq!(lookup, VersionLookup::Available(Version::new(1, 2, 0)));
    }

    #[test]
    fn local_source_with_foreign_identity_is_unavailable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "name: something-else\nversion: 3.0.0\n",
        )
        .unwrap();

        let resolver = VersionResolver::default();
        let lookup = resolver.latest_version(&UpgradeSource::Local {
            path: dir.path().to_path_buf(),
        });
        match lookup {
            VersionLookup::Unavailable(reason) => assert!(reason.contains("something-else")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn current_version_comes_from_install_manifest() {
        let dir = TempDir::new().unwrap();
        ToolkitManifest::new(Version::new(1, 0, 0))
            .save(dir.path())
            .unwrap();

        let resolver = VersionResolver::default();
        let current = resolver.current_version(dir.path()).unwrap();
        let diff = resolver.diff(&current, &Version::new(1, 2, 0));
        assert!(diff.has_update);
        assert_eq!(diff.kind, UpdateKind::Minor);
    }
}
