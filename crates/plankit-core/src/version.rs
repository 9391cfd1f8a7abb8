use crate::error::{PlankitError, Result};
use serde::{Deserialize, Serialize};

pub use semver::Version;

// ---------------------------------------------------------------------------
// UpdateKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    None,
    Patch,
    Minor,
    Major,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::None => "none",
            UpdateKind::Patch => "patch",
            UpdateKind::Minor => "minor",
            UpdateKind::Major => "major",
        }
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub has_update: bool,
    pub kind: UpdateKind,
}

// ---------------------------------------------------------------------------
// Parsing and comparison
// ---------------------------------------------------------------------------

/// Parse a plain `MAJOR.MINOR.PATCH` version. A leading `v` is accepted;
/// pre-release and build suffixes are rejected.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let version =
        Version::parse(bare).map_err(|_| PlankitError::InvalidVersion(raw.to_string()))?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(PlankitError::InvalidVersion(raw.to_string()));
    }
    Ok(version)
}

/// Classify the move from `current` to `latest`. Equal or older `latest`
/// versions never count as an update.
pub fn diff(current: &Version, latest: &Version) -> VersionDiff {
    if latest <= current {
        return VersionDiff {
            has_update: false,
            kind: UpdateKind::None,
        };
    }
    let kind = if latest.major != current.major {
        UpdateKind::Major
    } else if latest.minor != current.minor {
        UpdateKind::Minor
    } else {
        UpdateKind::Patch
    };
    VersionDiff {
        has_update: true,
        kind,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
