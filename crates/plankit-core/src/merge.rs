//! Per-file upgrade strategies and the three-way config merge.
//!
//! Every file of an incoming toolkit tree is classified as PRESERVE,
//! OVERWRITE or MERGE by ordered glob rules. MERGE documents are reconciled
//! against the pre-upgrade baseline so only the user's own edits survive on
//! top of the new release. Merge results are validated before anything is
//! written; a rejected merge leaves the installation untouched.

use crate::config::{validate_document, ToolkitConfig, SYSTEM_KEYS};
use crate::error::{PlankitError, Result};
use crate::io::{atomic_write, copy_symlink, list_files};
use crate::paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Strategy + classification rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Preserve,
    Overwrite,
    Merge,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Preserve => "PRESERVE",
            Strategy::Overwrite => "OVERWRITE",
            Strategy::Merge => "MERGE",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule groups in priority order. The first group with a matching pattern wins.
pub const RULES: &[(Strategy, &[&str])] = &[
    (
        Strategy::Preserve,
        &[
            "state/**",
            "research/**",
            "notes/**",
            "**/*.local.*",
            ".baseline/**",
        ],
    ),
    (
        Strategy::Overwrite,
        &[
            "templates/**",
            "guidelines/**",
            "scripts/**",
            "manifest.yaml",
            "migrations.yaml",
            "package.json",
        ],
    ),
    (Strategy::Merge, &["config.yaml"]),
];

/// Unmatched paths take the new release's copy.
pub const DEFAULT_STRATEGY: Strategy = Strategy::Overwrite;

/// Translate a path glob into an anchored regex.
///
/// `**/` matches zero or more leading directories, a trailing `**` matches
/// anything below, `*` and `?` never cross a `/`.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut rest = glob;
    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("**/") {
            out.push_str("(?:.*/)?");
            rest = tail;
            continue;
        }
        if let Some(tail) = rest.strip_prefix("**") {
            out.push_str(".*");
            rest = tail;
            continue;
        }
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        rest = &rest[c.len_utf8()..];
    }
    out.push('$');
    out
}

pub struct FileClassifier {
    rules: Vec<(Strategy, Vec<Regex>)>,
}

static CLASSIFIER: OnceLock<FileClassifier> = OnceLock::new();

impl FileClassifier {
    /// The classifier built from [`RULES`].
    pub fn standard() -> &'static FileClassifier {
        CLASSIFIER.get_or_init(|| FileClassifier {
            rules: RULES
                .iter()
                .map(|(strategy, globs)| {
                    let compiled = globs
                        .iter()
                        .map(|g| Regex::new(&glob_to_regex(g)).unwrap())
                        .collect();
                    (*strategy, compiled)
                })
                .collect(),
        })
    }

    /// Strategy for a path relative to the toolkit root.
    pub fn classify(&self, relative: &Path) -> Strategy {
        let normalized = paths::normalize_relative(relative);
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(&normalized)))
            .map(|(strategy, _)| *strategy)
            .unwrap_or(DEFAULT_STRATEGY)
    }
}

pub fn classify(relative: &Path) -> Strategy {
    FileClassifier::standard().classify(relative)
}

// ---------------------------------------------------------------------------
// Three-way merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMerge {
    pub merged: Value,
    /// Dotted key paths the user changed relative to base. Removals are
    /// prefixed with `-`.
    pub user_changes: Vec<String>,
}

/// Overlay the user's deltas from `base` onto `incoming`.
///
/// Nested mappings are compared key by key so new keys shipped inside a
/// section still arrive when the user edited a sibling. Top-level
/// [`SYSTEM_KEYS`] always keep the incoming value.
pub fn three_way_merge(base: &Value, user: &Value, incoming: &Value) -> ConfigMerge {
    let empty = Mapping::new();
    let base_map = base.as_mapping().unwrap_or(&empty);
    let user_map = user.as_mapping().unwrap_or(&empty);
    let mut merged = incoming.as_mapping().cloned().unwrap_or_default();
    let mut user_changes = Vec::new();

    overlay_deltas(base_map, user_map, &mut merged, "", &mut user_changes);

    ConfigMerge {
        merged: Value::Mapping(merged),
        user_changes,
    }
}

fn overlay_deltas(
    base: &Mapping,
    user: &Mapping,
    merged: &mut Mapping,
    prefix: &str,
    changes: &mut Vec<String>,
) {
    let mut keys: Vec<&Value> = user.keys().collect();
    keys.extend(base.keys().filter(|k| !user.contains_key(*k)));

    for key in keys {
        let label = key_label(key);
        if prefix.is_empty() && SYSTEM_KEYS.contains(&label.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            label
        } else {
            format!("{prefix}.{label}")
        };

        let base_value = base.get(key);
        let user_value = user.get(key);
        if base_value == user_value {
            continue;
        }

        match (base_value, user_value) {
            (_, None) => {
                merged.remove(key);
                changes.push(format!("-{path}"));
            }
            (Some(Value::Mapping(b)), Some(Value::Mapping(u))) => {
                if let Some(Value::Mapping(target)) = merged.get_mut(key) {
                    overlay_deltas(b, u, target, &path, changes);
                } else {
                    merged.insert(key.clone(), Value::Mapping(u.clone()));
                    changes.push(path);
                }
            }
            (None, Some(Value::Mapping(u))) => {
                if let Some(Value::Mapping(target)) = merged.get_mut(key) {
                    overlay_deltas(&Mapping::new(), u, target, &path, changes);
                } else {
                    merged.insert(key.clone(), Value::Mapping(u.clone()));
                    changes.push(path);
                }
            }
            (_, Some(u)) => {
                merged.insert(key.clone(), u.clone());
                changes.push(path);
            }
        }
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Schema check for a merged document, keyed by its path in the tree.
fn merge_violations(relative: &str, merged: &Value) -> Vec<String> {
    if relative == paths::CONFIG_FILE {
        validate_document::<ToolkitConfig>(merged)
    } else {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// MergePlan / MergeStats
// ---------------------------------------------------------------------------

/// Relative paths of an incoming tree grouped by strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    pub overwrite: Vec<String>,
    pub preserve: Vec<String>,
    pub merge: Vec<String>,
}

impl MergePlan {
    pub fn total(&self) -> usize {
        self.overwrite.len() + self.preserve.len() + self.merge.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    pub overwritten: usize,
    pub preserved: usize,
    pub merged: usize,
    /// PRESERVE files that did not exist in the target and were seeded.
    pub created: usize,
    pub user_changes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Compute and validate everything, write nothing.
    pub dry_run: bool,
}

/// Entries of an incoming tree the engine never reads.
fn skip_source_entry(relative: &Path) -> bool {
    relative.starts_with(".baseline") || relative.starts_with(paths::DEPENDENCY_CACHE_DIR)
}

// ---------------------------------------------------------------------------
// FileMergeEngine
// ---------------------------------------------------------------------------

pub struct FileMergeEngine<'a> {
    classifier: &'a FileClassifier,
}

impl Default for FileMergeEngine<'static> {
    fn default() -> Self {
        Self {
            classifier: FileClassifier::standard(),
        }
    }
}

struct PendingMerge {
    relative: String,
    incoming: Value,
    merged: Value,
    user_changes: Vec<String>,
}

impl<'a> FileMergeEngine<'a> {
    pub fn new(classifier: &'a FileClassifier) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, relative: &Path) -> Strategy {
        self.classifier.classify(relative)
    }

    pub fn plan(&self, source_tree: &Path) -> Result<MergePlan> {
        let mut plan = MergePlan::default();
        for relative in list_files(source_tree, skip_source_entry)? {
            let name = paths::normalize_relative(&relative);
            match self.classify(&relative) {
                Strategy::Overwrite => plan.overwrite.push(name),
                Strategy::Preserve => plan.preserve.push(name),
                Strategy::Merge => plan.merge.push(name),
            }
        }
        Ok(plan)
    }

    /// Apply `source_tree` onto `target`.
    ///
    /// The merge base for MERGE documents is the baseline recorded in
    /// `backup_dir`; without one every user value counts as a delta. All
    /// merges are computed and validated before the first write, so a
    /// [`PlankitError::MergeRejected`] leaves `target` byte-for-byte intact.
    pub fn apply(
        &self,
        source_tree: &Path,
        target: &Path,
        backup_dir: &Path,
        opts: &MergeOptions,
    ) -> Result<MergeStats> {
        let plan = self.plan(source_tree)?;
        let mut stats = MergeStats::default();

        let mut pending = Vec::new();
        let mut violations = Vec::new();
        for relative in &plan.merge {
            let pending_merge = self.compute_merge(source_tree, target, backup_dir, relative)?;
            for v in merge_violations(relative, &pending_merge.merged) {
                violations.push(format!("{relative}: {v}"));
            }
            stats
                .user_changes
                .extend(pending_merge.user_changes.iter().cloned());
            pending.push(pending_merge);
        }
        if !violations.is_empty() {
            return Err(PlankitError::MergeRejected {
                violations,
                user_changes: stats.user_changes,
            });
        }

        for relative in &plan.overwrite {
            if !opts.dry_run {
                copy_file(source_tree, target, relative)?;
            }
            stats.overwritten += 1;
        }

        for relative in &plan.preserve {
            if target.join(relative).exists() {
                stats.preserved += 1;
            } else {
                if !opts.dry_run {
                    copy_file(source_tree, target, relative)?;
                }
                stats.created += 1;
            }
        }

        for merge in &pending {
            if !opts.dry_run {
                atomic_write(
                    &target.join(&merge.relative),
                    serde_yaml::to_string(&merge.merged)?.as_bytes(),
                )?;
                if merge.relative == paths::CONFIG_FILE {
                    atomic_write(
                        &paths::baseline_config_path(target),
                        serde_yaml::to_string(&merge.incoming)?.as_bytes(),
                    )?;
                }
            }
            stats.merged += 1;
        }

        info!(
            overwritten = stats.overwritten,
            preserved = stats.preserved,
            created = stats.created,
            merged = stats.merged,
            dry_run = opts.dry_run,
            "applied incoming tree"
        );
        Ok(stats)
    }

    fn compute_merge(
        &self,
        source_tree: &Path,
        target: &Path,
        backup_dir: &Path,
        relative: &str,
    ) -> Result<PendingMerge> {
        let incoming = read_yaml(&source_tree.join(relative))?.unwrap_or(Value::Null);
        let Some(user) = read_yaml(&target.join(relative))? else {
            debug!(file = relative, "no user copy; taking incoming document");
            return Ok(PendingMerge {
                relative: relative.to_string(),
                merged: incoming.clone(),
                incoming,
                user_changes: Vec::new(),
            });
        };
        let base = if relative == paths::CONFIG_FILE {
            read_yaml(&paths::baseline_config_path(backup_dir))?
        } else {
            None
        }
        .unwrap_or_else(|| Value::Mapping(Mapping::new()));

        let result = three_way_merge(&base, &user, &incoming);
        debug!(file = relative, changes = ?result.user_changes, "three-way merge");
        Ok(PendingMerge {
            relative: relative.to_string(),
            incoming,
            merged: result.merged,
            user_changes: result.user_changes,
        })
    }
}

fn read_yaml(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_yaml::from_str(&data)?))
}

fn copy_file(source_tree: &Path, target: &Path, relative: &str) -> Result<()> {
    let to: PathBuf = target.join(relative);
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let from = source_tree.join(relative);
    if from.symlink_metadata()?.file_type().is_symlink() {
        return copy_symlink(&from, &to);
    }
    // Never write through a link the installation has at this path.
    if to.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
        std::fs::remove_file(&to)?;
    }
    std::fs::copy(&from, &to)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
