use crate::output::{print_fields, print_json};
use anyhow::Context;
use plankit_core::source::UpgradeSource;
use plankit_core::upgrade::{
    RollbackStatus, UpgradeOptions, UpgradeOrchestrator, UpgradeOutcome, UpgradePreview,
};
use std::path::Path;

pub struct UpgradeArgs {
    pub source: Option<String>,
    pub dry_run: bool,
    pub force: bool,
    pub skip_deps: bool,
}

/// `plankit upgrade`: drive one upgrade and report its outcome.
///
/// A failed upgrade exits non-zero even when the rollback succeeded.
pub fn run(
    root: &Path,
    registry: Option<String>,
    args: UpgradeArgs,
    json: bool,
) -> anyhow::Result<()> {
    let source = args
        .source
        .as_deref()
        .map(UpgradeSource::parse)
        .transpose()
        .context("invalid --source")?;
    let opts = UpgradeOptions {
        source,
        dry_run: args.dry_run,
        force: args.force,
        skip_dependencies: args.skip_deps,
    };

    let orchestrator = UpgradeOrchestrator::from_settings(root, registry);
    let report = orchestrator.run(&opts).context("upgrade failed")?;

    if json {
        print_json(&report)?;
    } else {
        print_outcome(&report.outcome);
    }

    if let UpgradeOutcome::Failure { stage, rollback, .. } = &report.outcome {
        let verdict = match rollback {
            RollbackStatus::RolledBack => "installation restored from backup",
            RollbackStatus::Failed { .. } => "rollback failed; manual recovery required",
        };
        anyhow::bail!("upgrade failed at {stage}: {verdict}");
    }
    Ok(())
}

fn print_preview(preview: &UpgradePreview) {
    print_fields(&[
        ("installed", preview.current_version.to_string()),
        ("available", preview.latest_version.to_string()),
        ("update", preview.update_kind.to_string()),
        ("source", preview.source.to_string()),
        ("overwrite", format!("{} file(s)", preview.files_to_update.len())),
        ("preserve", format!("{} file(s)", preview.files_to_preserve.len())),
        ("merge", preview.files_to_merge.join(", ")),
    ]);
    if preview.applicable_migrations.is_empty() {
        println!("\nNo migrations to run.");
    } else {
        println!("\nMigrations:");
        for m in &preview.applicable_migrations {
            println!("  {}  {}  {}", m.target_version, m.id, m.description);
        }
    }
    for id in &preview.unresolved_migrations {
        println!("  warning: migration '{id}' has no implementation in this build");
    }
}

fn print_outcome(outcome: &UpgradeOutcome) {
    match outcome {
        UpgradeOutcome::UpToDate { version } => {
            println!("Already up to date ({version}).");
        }
        UpgradeOutcome::DryRunPreview { preview } => {
            print_preview(preview);
            println!("\nDry run: nothing was changed.");
        }
        UpgradeOutcome::NeedsConfirmation { preview } => {
            print_preview(preview);
            println!("\nRe-run with --force to apply this upgrade.");
        }
        UpgradeOutcome::Success {
            from,
            to,
            backup_path,
            source,
            merge,
            migrations_run,
            ..
        } => {
            println!("Upgraded {from} → {to} from {source}.");
            print_fields(&[
                ("overwritten", merge.overwritten.to_string()),
                ("preserved", (merge.preserved + merge.created).to_string()),
                ("merged", merge.merged.to_string()),
                ("migrations", migrations_run.to_string()),
                ("backup", backup_path.display().to_string()),
            ]);
            if !merge.user_changes.is_empty() {
                println!("Kept your config changes: {}", merge.user_changes.join(", "));
            }
        }
        UpgradeOutcome::Failure {
            stage,
            error,
            rollback,
            backup_path,
        } => {
            eprintln!("Upgrade failed at {stage}: {error}");
            eprintln!("Backup: {}", backup_path.display());
            match rollback {
                RollbackStatus::RolledBack => {
                    eprintln!("The installation was restored to its previous state.");
                }
                RollbackStatus::Failed {
                    error,
                    manual_steps,
                } => {
                    eprintln!("Rollback failed: {error}");
                    eprintln!("Manual recovery:");
                    for (i, step) in manual_steps.iter().enumerate() {
                        eprintln!("  {}. {step}", i + 1);
                    }
                }
            }
        }
    }
}
