//! Version-scoped transformations of an installation.
//!
//! A release ships `migrations.yaml` mapping migration ids to a target version
//! and an implementation name. Implementation names resolve against a compiled
//! table of functions; nothing is loaded at run time.

use crate::config::WorkflowConfig;
use crate::error::{PlankitError, Result};
use crate::io::atomic_write;
use crate::paths;
use crate::version::{parse_version, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Registry document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Structure,
    Config,
    Content,
}

impl MigrationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Structure => "structure",
            MigrationKind::Config => "config",
            MigrationKind::Content => "content",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MigrationEntry {
    version: String,
    #[serde(default)]
    description: String,
    implementation: String,
    #[serde(rename = "type")]
    kind: MigrationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Migration {
    pub id: String,
    pub target_version: Version,
    pub description: String,
    pub implementation: String,
    pub kind: MigrationKind,
}

/// Migrations ordered by target version, then id.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by(|a, b| {
            a.target_version
                .cmp(&b.target_version)
                .then_with(|| a.id.cmp(&b.id))
        });
        Self { migrations }
    }

    /// Read `migrations.yaml` from a toolkit tree. A missing or empty file
    /// is an empty registry.
    pub fn load(tree: &Path) -> Result<Self> {
        let path = paths::migrations_path(tree);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries: Option<BTreeMap<String, MigrationEntry>> = serde_yaml::from_str(&data)?;
        let mut migrations = Vec::new();
        for (id, entry) in entries.unwrap_or_default() {
            migrations.push(Migration {
                target_version: parse_version(&entry.version)?,
                id,
                description: entry.description,
                implementation: entry.implementation,
                kind: entry.kind,
            });
        }
        Ok(Self::new(migrations))
    }

    pub fn all(&self) -> &[Migration] {
        &self.migrations
    }

    /// Migrations with `from < target_version <= to`, ascending.
    pub fn applicable(&self, from: &Version, to: &Version) -> Vec<Migration> {
        self.migrations
            .iter()
            .filter(|m| &m.target_version > from && &m.target_version <= to)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Everything a migration may look at. Passed explicitly to every step.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub install_dir: PathBuf,
    pub from: Version,
    pub to: Version,
}

pub type MigrationFn = fn(&MigrationContext) -> Result<()>;

/// Resolves implementation names to functions.
pub trait MigrationCatalog {
    fn lookup(&self, implementation: &str) -> Option<MigrationFn>;
}

/// The migrations compiled into this build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinMigrations;

const BUILTIN: &[(&str, MigrationFn)] = &[
    ("move_research_notes", move_research_notes),
    ("split_state_file", split_state_file),
    ("add_workflow_section", add_workflow_section),
];

impl MigrationCatalog for BuiltinMigrations {
    fn lookup(&self, implementation: &str) -> Option<MigrationFn> {
        BUILTIN
            .iter()
            .find(|(name, _)| *name == implementation)
            .map(|(_, f)| *f)
    }
}

fn move_without_clobber(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        )
        .into());
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(from, to)?;
    Ok(())
}

/// Loose `research/*.md` files move into `research/notes/`.
fn move_research_notes(ctx: &MigrationContext) -> Result<()> {
    let research = ctx.install_dir.join("research");
    if !research.is_dir() {
        return Ok(());
    }
    let notes = research.join("notes");
    for entry in std::fs::read_dir(&research)? {
        let entry = entry?;
        let path = entry.path();
        let is_markdown = path.extension().is_some_and(|ext| ext == "md");
        if entry.file_type()?.is_file() && is_markdown {
            move_without_clobber(&path, &notes.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// Legacy single `state.md` becomes `state/project.md`.
fn split_state_file(ctx: &MigrationContext) -> Result<()> {
    let legacy = ctx.install_dir.join("state.md");
    if !legacy.is_file() {
        return Ok(());
    }
    move_without_clobber(&legacy, &ctx.install_dir.join("state").join("project.md"))
}

/// Seed the `workflow` section of `config.yaml` with defaults when absent.
fn add_workflow_section(ctx: &MigrationContext) -> Result<()> {
    let path = paths::config_path(&ctx.install_dir);
    if !path.exists() {
        return Ok(());
    }
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(&path)?)?;
    let Some(mapping) = doc.as_mapping_mut() else {
        return Err(PlankitError::InvalidConfig {
            path,
            reason: "document is not a mapping".to_string(),
        });
    };
    if mapping.contains_key("workflow") {
        return Ok(());
    }
    mapping.insert(
        serde_yaml::Value::from("workflow"),
        serde_yaml::to_value(WorkflowConfig::default())?,
    );
    atomic_write(&path, serde_yaml::to_string(&doc)?.as_bytes())
}

// ---------------------------------------------------------------------------
// MigrationRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    Planned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationResult {
    pub id: String,
    pub version: Version,
    pub status: MigrationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationRun {
    pub migrations_run: usize,
    pub results: Vec<MigrationResult>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

pub struct MigrationRunner<'a> {
    registry: MigrationRegistry,
    catalog: &'a dyn MigrationCatalog,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(registry: MigrationRegistry, catalog: &'a dyn MigrationCatalog) -> Self {
        Self { registry, catalog }
    }

    pub fn applicable(&self, from: &Version, to: &Version) -> Vec<Migration> {
        self.registry.applicable(from, to)
    }

    /// Ids of applicable migrations whose implementation is not compiled in.
    pub fn unresolved(&self, from: &Version, to: &Version) -> Vec<String> {
        self.applicable(from, to)
            .into_iter()
            .filter(|m| self.catalog.lookup(&m.implementation).is_none())
            .map(|m| m.id)
            .collect()
    }

    /// Run the applicable migrations in order, stopping at the first failure.
    ///
    /// Migrations are not assumed to be re-runnable, so a failure is reported
    /// with exact progress and nothing after it is attempted.
    pub fn run(
        &self,
        install_dir: &Path,
        from: &Version,
        to: &Version,
        opts: &RunOptions,
    ) -> Result<MigrationRun> {
        let plan = self.applicable(from, to);
        let total = plan.len();
        let mut run = MigrationRun::default();

        if opts.dry_run {
            for m in &plan {
                info!(id = %m.id, version = %m.target_version, "would run migration");
                run.results.push(MigrationResult {
                    id: m.id.clone(),
                    version: m.target_version.clone(),
                    status: MigrationStatus::Planned,
                });
            }
            return Ok(run);
        }

        let ctx = MigrationContext {
            install_dir: install_dir.to_path_buf(),
            from: from.clone(),
            to: to.clone(),
        };

        for (index, m) in plan.iter().enumerate() {
            let fail = |reason: String| PlankitError::MigrationFailed {
                id: m.id.clone(),
                completed: index,
                remaining: total - index,
                reason,
            };
            let Some(implementation) = self.catalog.lookup(&m.implementation) else {
                warn!(id = %m.id, implementation = %m.implementation, "unknown migration implementation");
                return Err(fail(
                    PlankitError::UnknownMigration(m.implementation.clone()).to_string(),
                ));
            };
            info!(id = %m.id, version = %m.target_version, "running migration");
            if let Err(e) = implementation(&ctx) {
                warn!(id = %m.id, error = %e, completed = index, "migration failed");
                return Err(fail(e.to_string()));
            }
            run.migrations_run += 1;
            run.results.push(MigrationResult {
                id: m.id.clone(),
                version: m.target_version.clone(),
                status: MigrationStatus::Applied,
            });
        }

        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
