use crate::error::{PlankitError, Result};
use crate::paths;
use crate::version::{parse_version, Version};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Identity every plankit tree must declare in its manifest.
pub const TOOLKIT_NAME: &str = "plankit";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

/// `manifest.yaml` at the root of an installed or incoming toolkit tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitManifest {
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
}

impl ToolkitManifest {
    pub fn new(version: Version) -> Self {
        Self {
            name: TOOLKIT_NAME.to_string(),
            version,
            description: None,
        }
    }

    /// Load the manifest of the tree rooted at `tree`.
    ///
    /// A missing manifest is [`PlankitError::NotInitialized`]; an unreadable one
    /// is [`PlankitError::InvalidManifest`].
    pub fn load(tree: &Path) -> Result<Self> {
        let path = paths::manifest_path(tree);
        if !path.is_file() {
            return Err(PlankitError::NotInitialized(path));
        }
        let data = std::fs::read_to_string(&path)?;
        let raw: RawManifest =
            serde_yaml::from_str(&data).map_err(|e| PlankitError::InvalidManifest {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let version = parse_version(&raw.version).map_err(|e| PlankitError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: raw.name,
            version,
            description: raw.description,
        })
    }

    pub fn save(&self, tree: &Path) -> Result<()> {
        let raw = RawManifest {
            name: self.name.clone(),
            version: self.version.to_string(),
            description: self.description.clone(),
        };
        let data = serde_yaml::to_string(&raw)?;
        crate::io::atomic_write(&paths::manifest_path(tree), data.as_bytes())
    }

    pub fn is_toolkit(&self) -> bool {
        self.name == TOOLKIT_NAME
    }
}
