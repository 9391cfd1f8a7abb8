use crate::error::Result;
use crate::paths;
use crate::version::parse_version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Top-level keys owned by the toolkit itself. They always take the incoming
/// value during an upgrade.
pub const SYSTEM_KEYS: &[&str] = &["version", "schema_version"];

pub const THEMES: &[&str] = &["light", "dark", "auto"];
pub const MAX_RESEARCH_SOURCES: u32 = 100;

// ---------------------------------------------------------------------------
// ValidatedDocument
// ---------------------------------------------------------------------------

/// A structured document with a typed schema and explicit validation rules.
pub trait ValidatedDocument: DeserializeOwned {
    /// Rule violations beyond what deserialization already enforces.
    fn violations(&self) -> Vec<String>;
}

/// Check `value` against the schema of `T`. Type errors and rule violations
/// are both reported; an empty list means the document is valid.
pub fn validate_document<T: ValidatedDocument>(value: &serde_yaml::Value) -> Vec<String> {
    match serde_yaml::from_value::<T>(value.clone()) {
        Ok(doc) => doc.violations(),
        Err(e) => vec![format!("schema: {e}")],
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_true")]
    pub approval_required: bool,
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
}

pub fn default_stages() -> Vec<String> {
    ["discover", "research", "plan", "build", "review"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            approval_required: true,
            stages: default_stages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_sources")]
    pub max_sources: u32,
}

fn default_max_sources() -> u32 {
    10
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sources: default_max_sources(),
        }
    }
}

/// Settings the upgrade engine reads from the installed config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Extra backup exclusions on top of the dependency caches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default = "default_true")]
    pub install_dependencies: bool,
    /// Extra local source candidates, relative to the project root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_candidates: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            registry: None,
            package: None,
            exclude: Vec::new(),
            install_dependencies: true,
            local_candidates: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_theme() -> String {
    "light".to_string()
}

// ---------------------------------------------------------------------------
// ToolkitConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitConfig {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeConfig>,
    /// Keys this schema does not know about, kept verbatim.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_yaml::Value>,
}

impl ToolkitConfig {
    /// Load `config.yaml` from an installation, `None` if it does not exist.
    pub fn load_optional(install_dir: &Path) -> Result<Option<Self>> {
        let path = paths::config_path(install_dir);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    pub fn save(&self, install_dir: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::config_path(install_dir), data.as_bytes())
    }

    pub fn upgrade_settings(&self) -> UpgradeConfig {
        self.upgrade.clone().unwrap_or_default()
    }
}

impl ValidatedDocument for ToolkitConfig {
    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if parse_version(&self.version).is_err() {
            violations.push(format!(
                "version: '{}' is not a MAJOR.MINOR.PATCH version",
                self.version
            ));
        }

        if !THEMES.contains(&self.theme.as_str()) {
            violations.push(format!(
                "theme: '{}' is not one of {}",
                self.theme,
                THEMES.join(", ")
            ));
        }

        if self.workflow.stages.is_empty() {
            violations.push("workflow.stages: must list at least one stage".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.workflow.stages {
            if stage.trim().is_empty() {
                violations.push("workflow.stages: stage names must not be empty".to_string());
            } else if !seen.insert(stage.as_str()) {
                violations.push(format!("workflow.stages: duplicate stage '{stage}'"));
            }
        }

        if self.research.max_sources == 0 || self.research.max_sources > MAX_RESEARCH_SOURCES {
            violations.push(format!(
                "research.max_sources: {} is outside 1..={MAX_RESEARCH_SOURCES}",
                self.research.max_sources
            ));
        }

        if let Some(upgrade) = &self.upgrade {
            if let Some(registry) = &upgrade.registry {
                if !(registry.starts_with("http://") || registry.starts_with("https://")) {
                    violations.push(format!(
                        "upgrade.registry: '{registry}' must be an http(s) URL"
                    ));
                }
            }
            if let Some(package) = &upgrade.package {
                if package.trim().is_empty() {
                    violations.push("upgrade.package: must not be empty".to_string());
                }
            }
        }

        violations
    }
}

/// Upgrade settings of the installation at `install_dir`.
///
/// A missing config yields defaults. An unreadable one also yields defaults
/// (with a warning) so a broken config never blocks an upgrade that would
/// replace it.
pub fn upgrade_settings(install_dir: &Path) -> UpgradeConfig {
    match ToolkitConfig::load_optional(install_dir) {
        Ok(Some(cfg)) => cfg.upgrade_settings(),
        Ok(None) => UpgradeConfig::default(),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable config.yaml for upgrade settings");
            UpgradeConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn value(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: ToolkitConfig = serde_yaml::from_str("version: 1.0.0\n").unwrap();
        assert_eq!(cfg.theme, "light");
        assert!(cfg.workflow.approval_required);
        assert_eq!(cfg.research.max_sources, 10);
        assert!(cfg.violations().is_empty());
    }

    #[test]
    fn unknown_keys_survive_roundtrip() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "version: 1.0.0\nteam_notes: keep me\n",
        )
        .unwrap();
        let cfg = ToolkitConfig::load_optional(dir.path()).unwrap().unwrap();
        cfg.save(dir.path()).unwrap();
        let reloaded = ToolkitConfig::load_optional(dir.path()).unwrap().unwrap();
        assert_eq!(
            reloaded.extensions.get("team_notes"),
            Some(&serde_yaml::Value::from("keep me"))
        );
    }

    #[test]
    fn rule_violations_are_listed() {
        let violations = validate_document::<ToolkitConfig>(&value(
            "version: next\ntheme: neon\nworkflow:\n  stages: [plan, plan]\nresearch:\n  max_sources: 0\n",
        ));
        assert_eq!(violations.len(), 4, "{violations:?}");
        assert!(violations.iter().any(|v| v.starts_with("theme:")));
        assert!(violations.iter().any(|v| v.contains("duplicate stage 'plan'")));
    }

    #[test]
    fn type_errors_are_violations() {
        let violations = validate_document::<ToolkitConfig>(&value(
            "version: 1.0.0\nworkflow:\n  approval_required: sometimes\n",
        ));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("schema:"));
    }

    #[test]
    fn upgrade_settings_default_when_missing() {
        let dir = TempDir::new().unwrap();
        let settings = upgrade_settings(dir.path());
        assert!(settings.install_dependencies);
        assert!(settings.exclude.is_empty());
    }

    #[test]
    fn upgrade_registry_must_be_http() {
        let violations = validate_document::<ToolkitConfig>(&value(
            "version: 1.0.0\nupgrade:\n  registry: ftp://mirror\n",
        ));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("upgrade.registry:"));
    }
}
