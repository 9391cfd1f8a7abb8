//! Upgrade pipeline for an installed toolkit.
//!
//! Stages run strictly in order:
//! `Init → SourceResolved → Previewed → (DryRunDone | NeedsConfirmation | Confirmed)
//!  → BackedUp → Merged → Migrated → Validated → DepsInstalled → Complete`.
//!
//! Nothing is mutated before `BackedUp`, so earlier failures are returned as
//! plain errors. Any failure after it triggers `RollingBack`, which restores
//! the backup taken in the same run and ends in `RolledBack` or
//! `RollbackFailed`.
//!
//! Single writer: no other process may modify the installation while an
//! upgrade runs. No lock is taken.

use crate::backup::{BackupManager, BackupOptions};
use crate::config::{self, UpgradeConfig};
use crate::deps::{DependencyInstaller, InstallOutcome, PackageManagerInstaller, SkipDependencies};
use crate::error::{PlankitError, Result};
use crate::manifest::ToolkitManifest;
use crate::merge::{FileMergeEngine, MergeOptions, MergeStats};
use crate::migrations::{
    BuiltinMigrations, Migration, MigrationCatalog, MigrationRegistry, MigrationRunner, RunOptions,
};
use crate::paths;
use crate::registry::{RegistryClient, DEFAULT_PACKAGE, DEFAULT_REGISTRY_URL};
use crate::resolver::VersionResolver;
use crate::source::{candidate_paths_from_env, ResolvedSource, SourceAcquirer, UpgradeSource};
use crate::version::{UpdateKind, Version};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// UpgradeStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeStage {
    Init,
    SourceResolved,
    Previewed,
    DryRunDone,
    NeedsConfirmation,
    Confirmed,
    BackedUp,
    Merged,
    Migrated,
    Validated,
    DepsInstalled,
    Complete,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl UpgradeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeStage::Init => "INIT",
            UpgradeStage::SourceResolved => "SOURCE_RESOLVED",
            UpgradeStage::Previewed => "PREVIEWED",
            UpgradeStage::DryRunDone => "DRY_RUN_DONE",
            UpgradeStage::NeedsConfirmation => "NEEDS_CONFIRMATION",
            UpgradeStage::Confirmed => "CONFIRMED",
            UpgradeStage::BackedUp => "BACKED_UP",
            UpgradeStage::Merged => "MERGED",
            UpgradeStage::Migrated => "MIGRATED",
            UpgradeStage::Validated => "VALIDATED",
            UpgradeStage::DepsInstalled => "DEPS_INSTALLED",
            UpgradeStage::Complete => "COMPLETE",
            UpgradeStage::RollingBack => "ROLLING_BACK",
            UpgradeStage::RolledBack => "ROLLED_BACK",
            UpgradeStage::RollbackFailed => "ROLLBACK_FAILED",
        }
    }
}

impl std::fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Preview / outcome types
// ---------------------------------------------------------------------------

/// Read-only projection of what an upgrade would do.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradePreview {
    pub current_version: Version,
    pub latest_version: Version,
    pub update_kind: UpdateKind,
    pub source: UpgradeSource,
    pub files_to_update: Vec<String>,
    pub files_to_preserve: Vec<String>,
    pub files_to_merge: Vec<String>,
    pub applicable_migrations: Vec<Migration>,
    /// Applicable migrations whose implementation is not compiled in.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved_migrations: Vec<String>,
}

impl UpgradePreview {
    pub fn has_update(&self) -> bool {
        self.update_kind != UpdateKind::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RollbackStatus {
    RolledBack,
    Failed {
        error: String,
        manual_steps: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum UpgradeOutcome {
    UpToDate {
        version: Version,
    },
    DryRunPreview {
        preview: UpgradePreview,
    },
    NeedsConfirmation {
        preview: UpgradePreview,
    },
    Success {
        from: Version,
        to: Version,
        backup_path: PathBuf,
        source: UpgradeSource,
        merge: MergeStats,
        migrations_run: usize,
        dependencies: InstallOutcome,
    },
    Failure {
        stage: UpgradeStage,
        error: String,
        rollback: RollbackStatus,
        backup_path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeReport {
    #[serde(flatten)]
    pub outcome: UpgradeOutcome,
    pub trail: Vec<UpgradeStage>,
}

impl UpgradeReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, UpgradeOutcome::Failure { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    pub source: Option<UpgradeSource>,
    pub dry_run: bool,
    pub force: bool,
    pub skip_dependencies: bool,
}

/// Recovery instructions for an installation the rollback could not restore.
pub fn manual_recovery_steps(install_dir: &Path, backup: &Path) -> Vec<String> {
    vec![
        format!(
            "Remove the partially upgraded installation: rm -rf \"{}\"",
            install_dir.display()
        ),
        format!(
            "Copy the backup over it: cp -R \"{}\" \"{}\"",
            backup.display(),
            install_dir.display()
        ),
        format!(
            "Remove the copied backup metadata: rm \"{}\"",
            install_dir.join(paths::BACKUP_METADATA_FILE).display()
        ),
    ]
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// Everything one upgrade run knows. Threaded through each stage instead of
/// living in shared state.
struct UpgradeContext {
    install_dir: PathBuf,
    current: Version,
    trail: Vec<UpgradeStage>,
}

impl UpgradeContext {
    fn enter(&mut self, stage: UpgradeStage) {
        info!(stage = %stage, "upgrade stage");
        self.trail.push(stage);
    }

    fn report(self, outcome: UpgradeOutcome) -> UpgradeReport {
        UpgradeReport {
            outcome,
            trail: self.trail,
        }
    }
}

struct Applied {
    merge: MergeStats,
    migrations_run: usize,
    dependencies: InstallOutcome,
}

// ---------------------------------------------------------------------------
// UpgradeOrchestrator
// ---------------------------------------------------------------------------

pub struct UpgradeOrchestrator {
    root: PathBuf,
    resolver: VersionResolver,
    settings: UpgradeConfig,
    candidates: Vec<PathBuf>,
    backups: BackupManager,
    catalog: Box<dyn MigrationCatalog>,
    installer: Box<dyn DependencyInstaller>,
}

impl UpgradeOrchestrator {
    /// Orchestrator for the project at `root`, configured from its installed
    /// `config.yaml`. `registry_override` wins over the configured registry.
    pub fn from_settings(root: &Path, registry_override: Option<String>) -> Self {
        let settings = config::upgrade_settings(&paths::install_dir(root));
        let registry_url = registry_override
            .or_else(|| settings.registry.clone())
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());
        let package = settings
            .package
            .clone()
            .unwrap_or_else(|| DEFAULT_PACKAGE.to_string());
        let resolver = VersionResolver::new(RegistryClient::new(registry_url), package);
        let candidates = candidate_paths_from_env(root, &settings.local_candidates);
        Self::new(root, resolver, settings).with_candidates(candidates)
    }

    pub fn new(root: &Path, resolver: VersionResolver, settings: UpgradeConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            resolver,
            settings,
            candidates: Vec::new(),
            backups: BackupManager::new(paths::backups_dir(root)),
            catalog: Box::new(BuiltinMigrations),
            installer: Box::new(PackageManagerInstaller::new()),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_catalog(mut self, catalog: Box<dyn MigrationCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_installer(mut self, installer: Box<dyn DependencyInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    /// Local sources probed when the registry fails, in order.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn install_dir(&self) -> PathBuf {
        paths::install_dir(&self.root)
    }

    /// Resolve the source and describe the upgrade without changing anything.
    pub fn preview(&self, opts: &UpgradeOptions) -> Result<UpgradePreview> {
        let install_dir = self.install_dir();
        let current = self.resolver.current_version(&install_dir)?;
        let source = self.acquire(opts)?;
        self.build_preview(&current, &source)
    }

    fn acquire(&self, opts: &UpgradeOptions) -> Result<ResolvedSource> {
        SourceAcquirer::new(&self.resolver, self.candidates.clone()).resolve(opts.source.as_ref())
    }

    fn build_preview(&self, current: &Version, source: &ResolvedSource) -> Result<UpgradePreview> {
        let diff = self.resolver.diff(current, &source.version);
        let plan = FileMergeEngine::default().plan(&source.tree)?;
        let runner = MigrationRunner::new(MigrationRegistry::load(&source.tree)?, self.catalog.as_ref());
        Ok(UpgradePreview {
            current_version: current.clone(),
            latest_version: source.version.clone(),
            update_kind: diff.kind,
            source: source.source.clone(),
            files_to_update: plan.overwrite,
            files_to_preserve: plan.preserve,
            files_to_merge: plan.merge,
            applicable_migrations: runner.applicable(current, &source.version),
            unresolved_migrations: runner.unresolved(current, &source.version),
        })
    }

    /// Drive one upgrade to a terminal outcome.
    ///
    /// Errors are returned only for failures before the backup exists; later
    /// failures come back as [`UpgradeOutcome::Failure`] after rollback.
    pub fn run(&self, opts: &UpgradeOptions) -> Result<UpgradeReport> {
        let install_dir = self.install_dir();
        let mut ctx = UpgradeContext {
            current: Version::new(0, 0, 0),
            install_dir,
            trail: Vec::new(),
        };
        ctx.enter(UpgradeStage::Init);

        ctx.current = self.resolver.current_version(&ctx.install_dir)?;
        let source = self.acquire(opts)?;
        ctx.enter(UpgradeStage::SourceResolved);

        let preview = self.build_preview(&ctx.current, &source)?;
        ctx.enter(UpgradeStage::Previewed);

        if !preview.has_update() {
            info!(version = %ctx.current, offered = %source.version, "already up to date");
            ctx.enter(UpgradeStage::Complete);
            let version = ctx.current.clone();
            return Ok(ctx.report(UpgradeOutcome::UpToDate { version }));
        }
        if opts.dry_run {
            ctx.enter(UpgradeStage::DryRunDone);
            return Ok(ctx.report(UpgradeOutcome::DryRunPreview { preview }));
        }
        if !opts.force {
            ctx.enter(UpgradeStage::NeedsConfirmation);
            return Ok(ctx.report(UpgradeOutcome::NeedsConfirmation { preview }));
        }
        ctx.enter(UpgradeStage::Confirmed);

        let backup = self.backups.create(
            &ctx.install_dir,
            &BackupOptions {
                version: Some(ctx.current.to_string()),
                exclude: self.settings.exclude.clone(),
            },
        )?;
        ctx.enter(UpgradeStage::BackedUp);

        match self.apply(&mut ctx, &source, &backup.path, opts) {
            Ok(applied) => {
                ctx.enter(UpgradeStage::Complete);
                info!(from = %ctx.current, to = %source.version, backup = %backup.path.display(), "upgrade complete");
                let from = ctx.current.clone();
                Ok(ctx.report(UpgradeOutcome::Success {
                    from,
                    to: source.version.clone(),
                    backup_path: backup.path,
                    source: source.source.clone(),
                    merge: applied.merge,
                    migrations_run: applied.migrations_run,
                    dependencies: applied.dependencies,
                }))
            }
            Err((stage, e)) => {
                warn!(stage = %stage, error = %e, "upgrade failed; rolling back");
                let rollback = self.roll_back(&mut ctx, &backup.path);
                Ok(ctx.report(UpgradeOutcome::Failure {
                    stage,
                    error: e.to_string(),
                    rollback,
                    backup_path: backup.path,
                }))
            }
        }
    }

    /// The mutating stages. On failure, reports the stage that was attempted.
    fn apply(
        &self,
        ctx: &mut UpgradeContext,
        source: &ResolvedSource,
        backup_dir: &Path,
        opts: &UpgradeOptions,
    ) -> std::result::Result<Applied, (UpgradeStage, PlankitError)> {
        let merge = FileMergeEngine::default()
            .apply(&source.tree, &ctx.install_dir, backup_dir, &MergeOptions::default())
            .map_err(|e| (UpgradeStage::Merged, e))?;
        ctx.enter(UpgradeStage::Merged);

        let migrations_run = MigrationRegistry::load(&ctx.install_dir)
            .and_then(|registry| {
                MigrationRunner::new(registry, self.catalog.as_ref()).run(
                    &ctx.install_dir,
                    &ctx.current,
                    &source.version,
                    &RunOptions::default(),
                )
            })
            .map_err(|e| (UpgradeStage::Migrated, e))?
            .migrations_run;
        ctx.enter(UpgradeStage::Migrated);

        verify_installation(&ctx.install_dir, &source.version)
            .map_err(|e| (UpgradeStage::Validated, e))?;
        ctx.enter(UpgradeStage::Validated);

        let install_deps = !opts.skip_dependencies && self.settings.install_dependencies;
        let dependencies = if install_deps {
            self.installer.install(&ctx.install_dir)
        } else {
            SkipDependencies.install(&ctx.install_dir)
        }
        .map_err(|e| (UpgradeStage::DepsInstalled, e))?;
        ctx.enter(UpgradeStage::DepsInstalled);

        Ok(Applied {
            merge,
            migrations_run,
            dependencies,
        })
    }

    fn roll_back(&self, ctx: &mut UpgradeContext, backup_dir: &Path) -> RollbackStatus {
        ctx.enter(UpgradeStage::RollingBack);
        match self.backups.restore(backup_dir, &ctx.install_dir) {
            Ok(_) => {
                ctx.enter(UpgradeStage::RolledBack);
                info!(backup = %backup_dir.display(), "rolled back to pre-upgrade backup");
                RollbackStatus::RolledBack
            }
            Err(e) => {
                ctx.enter(UpgradeStage::RollbackFailed);
                error!(backup = %backup_dir.display(), error = %e, "rollback failed; manual recovery required");
                RollbackStatus::Failed {
                    error: e.to_string(),
                    manual_steps: manual_recovery_steps(&ctx.install_dir, backup_dir),
                }
            }
        }
    }
}

/// Post-conditions of a finished upgrade: the manifest declares the target
/// version and every required directory is present.
fn verify_installation(install_dir: &Path, expected: &Version) -> Result<()> {
    let manifest = ToolkitManifest::load(install_dir)?;
    if manifest.version != *expected {
        return Err(PlankitError::VersionMismatchAfterUpgrade {
            expected: expected.to_string(),
            found: manifest.version.to_string(),
        });
    }
    let missing: Vec<&str> = paths::REQUIRED_SUBDIRS
        .iter()
        .copied()
        .filter(|dir| !install_dir.join(dir).is_dir())
        .collect();
    if !missing.is_empty() {
        return Err(PlankitError::IncompleteInstallation(format!(
            "missing {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::list_files;
    use crate::migrations::{MigrationContext, MigrationFn};
    use crate::test_support::write_toolkit_tree;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        project: TempDir,
        release: TempDir,
        // Keeps the silent registry port bound for the test's lifetime.
        _listener: TcpListener,
        resolver: VersionResolver,
    }

    impl Fixture {
        fn new(installed: &str, offered: &str) -> Self {
            let project = TempDir::new().unwrap();
            let install = paths::install_dir(project.path());
            write_toolkit_tree(&install, installed);
            std::fs::write(
                install.join("config.yaml"),
                format!("version: {installed}\ntheme: dark\n"),
            )
            .unwrap();
            std::fs::create_dir_all(install.join(".baseline")).unwrap();
            std::fs::write(
                install.join(".baseline/config.yaml"),
                format!("version: {installed}\ntheme: light\n"),
            )
            .unwrap();
            std::fs::create_dir_all(install.join("research")).unwrap();
            std::fs::write(install.join("research/sources.md"), "links").unwrap();

            let release = TempDir::new().unwrap();
            write_toolkit_tree(release.path(), offered);
            std::fs::write(
                release.path().join("migrations.yaml"),
                "research-notes:\n  version: 1.1.0\n  description: Move research notes\n  implementation: move_research_notes\n  type: content\n",
            )
            .unwrap();

            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let resolver = VersionResolver::new(
                RegistryClient::new(format!("http://{addr}"))
                    .with_timeout(Duration::from_millis(200)),
                "plankit",
            );
            Self {
                project,
                release,
                _listener: listener,
                resolver,
            }
        }

        fn install(&self) -> PathBuf {
            paths::install_dir(self.project.path())
        }

        fn orchestrator(&self) -> UpgradeOrchestrator {
            UpgradeOrchestrator::new(
                self.project.path(),
                self.resolver.clone(),
                UpgradeConfig::default(),
            )
            .with_installer(Box::new(SkipDependencies))
        }

        fn local_source(&self, force: bool) -> UpgradeOptions {
            UpgradeOptions {
                source: Some(UpgradeSource::Local {
                    path: self.release.path().to_path_buf(),
                }),
                force,
                ..Default::default()
            }
        }

        fn snapshot(&self) -> Vec<(PathBuf, Vec<u8>)> {
            let install = self.install();
            list_files(&install, |_| false)
                .unwrap()
                .into_iter()
                .map(|rel| {
                    let data = std::fs::read(install.join(&rel)).unwrap();
                    (rel, data)
                })
                .collect()
        }
    }

    #[test]
    fn same_version_is_up_to_date() {
        let fx = Fixture::new("1.2.0", "1.2.0");
        let report = fx.orchestrator().run(&fx.local_source(true)).unwrap();
        assert!(matches!(report.outcome, UpgradeOutcome::UpToDate { .. }));
        assert_eq!(report.trail.last(), Some(&UpgradeStage::Complete));
        assert!(fx.orchestrator().backups().list().unwrap().is_empty());
    }

    #[test]
    fn without_force_the_run_waits_for_confirmation() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let before = fx.snapshot();
        let report = fx.orchestrator().run(&fx.local_source(false)).unwrap();
        match &report.outcome {
            UpgradeOutcome::NeedsConfirmation { preview } => {
                assert_eq!(preview.update_kind, UpdateKind::Minor);
            }
            other => panic!("expected needs-confirmation, got {other:?}"),
        }
        assert_eq!(fx.snapshot(), before);
        assert!(fx.orchestrator().backups().list().unwrap().is_empty());
    }

    #[test]
    fn dry_run_reports_the_plan_without_mutating() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let before = fx.snapshot();
        let mut opts = fx.local_source(true);
        opts.dry_run = true;

        let report = fx.orchestrator().run(&opts).unwrap();
        match &report.outcome {
            UpgradeOutcome::DryRunPreview { preview } => {
                assert_eq!(preview.files_to_merge, vec!["config.yaml".to_string()]);
                assert!(preview.files_to_update.contains(&"templates/plan.md".to_string()));
                assert_eq!(preview.applicable_migrations.len(), 1);
                assert!(preview.unresolved_migrations.is_empty());
            }
            other => panic!("expected dry-run preview, got {other:?}"),
        }
        assert_eq!(report.trail.last(), Some(&UpgradeStage::DryRunDone));
        assert_eq!(fx.snapshot(), before);
    }

    #[test]
    fn forced_upgrade_completes_and_keeps_user_content() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let report = fx.orchestrator().run(&fx.local_source(true)).unwrap();

        match &report.outcome {
            UpgradeOutcome::Success {
                from,
                to,
                backup_path,
                migrations_run,
                merge,
                ..
            } => {
                assert_eq!(from, &Version::new(1, 0, 0));
                assert_eq!(to, &Version::new(1, 2, 0));
                assert!(backup_path.join(paths::BACKUP_METADATA_FILE).exists());
                assert_eq!(*migrations_run, 1);
                assert_eq!(merge.user_changes, vec!["theme".to_string()]);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(
            report.trail,
            vec![
                UpgradeStage::Init,
                UpgradeStage::SourceResolved,
                UpgradeStage::Previewed,
                UpgradeStage::Confirmed,
                UpgradeStage::BackedUp,
                UpgradeStage::Merged,
                UpgradeStage::Migrated,
                UpgradeStage::Validated,
                UpgradeStage::DepsInstalled,
                UpgradeStage::Complete,
            ]
        );

        let install = fx.install();
        assert_eq!(
            ToolkitManifest::load(&install).unwrap().version,
            Version::new(1, 2, 0)
        );
        let config = config::ToolkitConfig::load_optional(&install).unwrap().unwrap();
        assert_eq!(config.version, "1.2.0");
        assert_eq!(config.theme, "dark");
        assert!(install.join("research/notes/sources.md").exists());
        assert_eq!(
            std::fs::read_to_string(install.join("templates/plan.md")).unwrap(),
            "# Plan template v1.2.0\n"
        );
    }

    fn rewrite_manifest(ctx: &MigrationContext) -> Result<()> {
        ToolkitManifest::new(Version::new(9, 9, 9)).save(&ctx.install_dir)
    }

    fn broken(_: &MigrationContext) -> Result<()> {
        Err(PlankitError::IncompleteInstallation("simulated".to_string()))
    }

    struct Sabotage;

    impl MigrationCatalog for Sabotage {
        fn lookup(&self, implementation: &str) -> Option<MigrationFn> {
            match implementation {
                "move_research_notes" => Some(broken as MigrationFn),
                _ => None,
            }
        }
    }

    struct ManifestRewriter;

    impl MigrationCatalog for ManifestRewriter {
        fn lookup(&self, _implementation: &str) -> Option<MigrationFn> {
            Some(rewrite_manifest as MigrationFn)
        }
    }

    struct FailingInstaller;

    impl DependencyInstaller for FailingInstaller {
        fn install(&self, _install_dir: &Path) -> Result<InstallOutcome> {
            Err(PlankitError::DependencyInstallFailed("registry offline".to_string()))
        }
    }

    fn assert_rolled_back(fx: &Fixture, report: &UpgradeReport, stage: UpgradeStage, before: &[(PathBuf, Vec<u8>)]) {
        match &report.outcome {
            UpgradeOutcome::Failure {
                stage: failed,
                rollback,
                backup_path,
                ..
            } => {
                assert_eq!(*failed, stage);
                assert_eq!(rollback, &RollbackStatus::RolledBack);
                assert!(backup_path.exists());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            &report.trail[report.trail.len() - 2..],
            &[UpgradeStage::RollingBack, UpgradeStage::RolledBack]
        );
        assert_eq!(fx.snapshot(), before);
    }

    #[test]
    fn failed_migration_rolls_back() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let before = fx.snapshot();
        let report = fx
            .orchestrator()
            .with_catalog(Box::new(Sabotage))
            .run(&fx.local_source(true))
            .unwrap();
        assert_rolled_back(&fx, &report, UpgradeStage::Migrated, &before);
    }

    #[test]
    fn version_mismatch_rolls_back() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let before = fx.snapshot();
        let report = fx
            .orchestrator()
            .with_catalog(Box::new(ManifestRewriter))
            .run(&fx.local_source(true))
            .unwrap();
        assert_rolled_back(&fx, &report, UpgradeStage::Validated, &before);
        if let UpgradeOutcome::Failure { error, .. } = &report.outcome {
            assert!(error.contains("9.9.9"));
        }
    }

    #[test]
    fn dependency_failure_rolls_back() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let before = fx.snapshot();
        let report = fx
            .orchestrator()
            .with_installer(Box::new(FailingInstaller))
            .run(&fx.local_source(true))
            .unwrap();
        assert_rolled_back(&fx, &report, UpgradeStage::DepsInstalled, &before);
    }

    #[test]
    fn rejected_config_merge_rolls_back() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        std::fs::write(
            fx.install().join("config.yaml"),
            "version: 1.0.0\ntheme: neon\n",
        )
        .unwrap();
        let before = fx.snapshot();
        let report = fx.orchestrator().run(&fx.local_source(true)).unwrap();
        assert_rolled_back(&fx, &report, UpgradeStage::Merged, &before);
        if let UpgradeOutcome::Failure { error, .. } = &report.outcome {
            assert!(error.contains("theme"));
        }
    }

    #[test]
    fn rollback_keeps_paths_excluded_from_the_backup() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        std::fs::create_dir_all(fx.install().join("research/raw")).unwrap();
        std::fs::write(fx.install().join("research/raw/dump.html"), "big").unwrap();
        let before = fx.snapshot();

        let settings = UpgradeConfig {
            exclude: vec!["research/raw".to_string()],
            ..UpgradeConfig::default()
        };
        let report = UpgradeOrchestrator::new(fx.project.path(), fx.resolver.clone(), settings)
            .with_installer(Box::new(FailingInstaller))
            .run(&fx.local_source(true))
            .unwrap();

        if let UpgradeOutcome::Failure { backup_path, .. } = &report.outcome {
            assert!(!backup_path.join("research/raw").exists());
        }
        assert_rolled_back(&fx, &report, UpgradeStage::DepsInstalled, &before);
    }

    /// Damages every backup, then fails, so the rollback cannot restore.
    struct BackupWrecker;

    impl DependencyInstaller for BackupWrecker {
        fn install(&self, install_dir: &Path) -> Result<InstallOutcome> {
            let root = install_dir.parent().unwrap().join(paths::BACKUPS_DIR);
            for entry in std::fs::read_dir(root)? {
                let manifest = entry?.path().join(paths::MANIFEST_FILE);
                if manifest.exists() {
                    std::fs::remove_file(manifest)?;
                }
            }
            Err(PlankitError::DependencyInstallFailed("registry offline".to_string()))
        }
    }

    #[test]
    fn unrestorable_backup_reports_rollback_failed_with_manual_steps() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let report = fx
            .orchestrator()
            .with_installer(Box::new(BackupWrecker))
            .run(&fx.local_source(true))
            .unwrap();

        match &report.outcome {
            UpgradeOutcome::Failure {
                stage,
                rollback,
                backup_path,
                ..
            } => {
                assert_eq!(*stage, UpgradeStage::DepsInstalled);
                match rollback {
                    RollbackStatus::Failed {
                        error,
                        manual_steps,
                    } => {
                        assert!(error.contains("manifest.yaml"));
                        assert_eq!(manual_steps.len(), 3);
                        let backup = backup_path.display().to_string();
                        assert!(manual_steps.iter().any(|step| step.contains(&backup)));
                    }
                    other => panic!("expected failed rollback, got {other:?}"),
                }
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(report.is_failure());
        assert_eq!(report.trail.last(), Some(&UpgradeStage::RollbackFailed));
    }

    #[test]
    fn skip_dependencies_bypasses_the_installer() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let mut opts = fx.local_source(true);
        opts.skip_dependencies = true;
        let report = fx
            .orchestrator()
            .with_installer(Box::new(FailingInstaller))
            .run(&opts)
            .unwrap();
        assert!(matches!(report.outcome, UpgradeOutcome::Success { .. }));
    }

    #[test]
    fn registry_timeout_falls_back_to_local_candidate() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        let orchestrator = fx
            .orchestrator()
            .with_candidates(vec![fx.release.path().to_path_buf()]);

        let preview = orchestrator.preview(&UpgradeOptions::default()).unwrap();
        assert_eq!(preview.latest_version, Version::new(1, 2, 0));
        assert_eq!(
            preview.source,
            UpgradeSource::Local {
                path: fx.release.path().to_path_buf()
            }
        );
    }

    #[test]
    fn missing_installation_is_an_error_before_any_stage_mutates() {
        let fx = Fixture::new("1.0.0", "1.2.0");
        std::fs::remove_file(fx.install().join("manifest.yaml")).unwrap();
        let err = fx.orchestrator().run(&fx.local_source(true)).unwrap_err();
        assert!(matches!(err, PlankitError::NotInitialized(_)));
        assert!(fx.orchestrator().backups().list().unwrap().is_empty());
    }

    #[test]
    fn manual_steps_name_the_backup() {
        let steps = manual_recovery_steps(Path::new("/p/.plankit"), Path::new("/p/.plankit-backups/backup-1"));
        assert_eq!(steps.len(), 3);
        assert!(steps[1].contains("/p/.plankit-backups/backup-1"));
    }
}
