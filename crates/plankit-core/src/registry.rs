//! Blocking client for the package registry that publishes plankit releases.
//!
//! The registry speaks the npm package-document protocol:
//! `GET {registry}/{package}` returns `dist-tags` and per-version `dist.tarball`
//! URLs. Metadata queries are bounded by a short timeout and degrade to
//! [`VersionLookup::Unavailable`] instead of failing.

use crate::error::{PlankitError, Result};
use crate::version::{parse_version, Version};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
pub const DEFAULT_PACKAGE: &str = "plankit";
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Answer to "what is the newest version?". No answer is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionLookup {
    Available(Version),
    Unavailable(String),
}

impl VersionLookup {
    pub fn version(&self) -> Option<&Version> {
        match self {
            VersionLookup::Available(v) => Some(v),
            VersionLookup::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(rename = "dist-tags", default)]
    dist_tags: HashMap<String, String>,
    #[serde(default)]
    versions: HashMap<String, VersionDocument>,
}

#[derive(Debug, Deserialize)]
struct VersionDocument {
    dist: DistDocument,
}

#[derive(Debug, Deserialize)]
struct DistDocument {
    tarball: String,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    timeout: Duration,
    download_timeout: Duration,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: METADATA_TIMEOUT,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn package_url(&self, package: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), package)
    }

    fn client(&self, timeout: Duration) -> Result<Client> {
        Ok(Client::builder()
            .timeout(timeout)
            .connect_timeout(self.timeout)
            .build()?)
    }

    fn fetch_document(&self, package: &str) -> Result<PackageDocument> {
        let url = self.package_url(package);
        debug!(%url, "querying registry");
        let response = self.client(self.timeout)?.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlankitError::SourceUnavailable(format!(
                "registry returned {status} for {url}"
            )));
        }
        Ok(response.json()?)
    }

    /// Latest published version of `package`, or `Unavailable` on timeout,
    /// non-2xx status, network error, or an unusable document.
    pub fn latest_version(&self, package: &str) -> VersionLookup {
        let document = match self.fetch_document(package) {
            Ok(document) => document,
            Err(e) => {
                warn!(package, error = %e, "registry unavailable");
                return VersionLookup::Unavailable(e.to_string());
            }
        };
        let Some(latest) = document.dist_tags.get("latest") else {
            return VersionLookup::Unavailable(format!(
                "registry document for '{package}' has no 'latest' tag"
            ));
        };
        match parse_version(latest) {
            Ok(version) => VersionLookup::Available(version),
            Err(e) => VersionLookup::Unavailable(e.to_string()),
        }
    }

    /// Tarball URL for an exact published version.
    pub fn tarball_url(&self, package: &str, version: &Version) -> Result<String> {
        let document = self.fetch_document(package)?;
        document
            .versions
            .get(&version.to_string())
            .map(|v| v.dist.tarball.clone())
            .ok_or_else(|| {
                PlankitError::SourceUnavailable(format!(
                    "version {version} of '{package}' is not published"
                ))
            })
    }

    /// Download `url` into `dest`. Only `dest` is written.
    pub fn download(&self, url: &str, dest: &Path) -> Result<()> {
        debug!(%url, dest = %dest.display(), "downloading package artifact");
        let response = self.client(self.download_timeout)?.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlankitError::SourceUnavailable(format!(
                "artifact download returned {status} for {url}"
            )));
        }
        let bytes = response.bytes()?;
        std::fs::write(dest, &bytes)?;
        Ok(())
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const DOCUMENT: &str = r#"{
        "name": "plankit",
        "dist-tags": { "latest": "1.2.0" },
        "versions": {
            "1.1.0": { "dist": { "tarball": "http://example.test/plankit-1.1.0.tgz" } },
            "1.2.0": { "dist": { "tarball": "http://example.test/plankit-1.2.0.tgz" } }
        }
    }"#;

    #[test]
    fn latest_version_reads_dist_tag() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/plankit")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(DOCUMENT)
            .create();

        let client = RegistryClient::new(server.url());
        assert_eq!(
            client.latest_version("plankit"),
            VersionLookup::Available(Version::new(1, 2, 0))
        );
        mock.assert();
    }

    #[test]
    fn non_success_status_is_unavailable() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/plankit").with_status(503).create();

        let client = RegistryClient::new(server.url());
        let lookup = client.latest_version("plankit");
        match lookup {
            VersionLookup::Unavailable(reason) => assert!(reason.contains("503")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn timeout_is_unavailable_not_an_error() {
        // Accepts connections at the socket level but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = RegistryClient::new(format!("http://{addr}"))
            .with_timeout(Duration::from_millis(200));
        let lookup = client.latest_version("plankit");
        assert!(matches!(lookup, VersionLookup::Unavailable(_)));
        drop(listener);
    }

    #[test]
    fn tarball_url_requires_published_version() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/plankit")
            .with_status(200)
            .with_body(DOCUMENT)
            .expect(2)
            .create();

        let client = RegistryClient::new(server.url());
        assert_eq!(
            client
                .tarball_url("plankit", &Version::new(1, 1, 0))
                .unwrap(),
            "http://example.test/plankit-1.1.0.tgz"
        );
        assert!(matches!(
            client.tarball_url("plankit", &Version::new(9, 0, 0)),
            Err(PlankitError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn download_writes_only_destination() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/plankit-1.2.0.tgz")
            .with_status(200)
            .with_body("archive-bytes")
            .create();

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.tgz");
        let client = RegistryClient::new(server.url());
        client
            .download(&format!("{}/plankit-1.2.0.tgz", server.url()), &dest)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "archive-bytes");
    }
}
