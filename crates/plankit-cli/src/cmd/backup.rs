use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use plankit_core::backup::{BackupManager, BackupOptions};
use plankit_core::{config, paths};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum BackupSubcommand {
    /// Snapshot the current installation
    Create,

    /// List backups, newest first
    List,

    /// Check a backup's structure and file count
    Validate { name: String },

    /// Replace the installation with a backup
    Restore { name: String },

    /// Delete a backup
    Delete { name: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: BackupSubcommand, json: bool) -> anyhow::Result<()> {
    let manager = BackupManager::new(paths::backups_dir(root));
    match subcmd {
        BackupSubcommand::Create => create(root, &manager, json),
        BackupSubcommand::List => list(&manager, json),
        BackupSubcommand::Validate { name } => validate(&manager, &name, json),
        BackupSubcommand::Restore { name } => restore(root, &manager, &name, json),
        BackupSubcommand::Delete { name } => delete(&manager, &name, json),
    }
}

fn create(root: &Path, manager: &BackupManager, json: bool) -> anyhow::Result<()> {
    let install_dir = paths::install_dir(root);
    let opts = BackupOptions {
        version: None,
        exclude: config::upgrade_settings(&install_dir).exclude,
    };
    let backup = manager
        .create(&install_dir, &opts)
        .context("failed to create backup")?;

    if json {
        print_json(&backup)?;
    } else {
        let files = backup.metadata.as_ref().map(|m| m.files).unwrap_or(0);
        println!("Created {} ({files} files)", backup.path.display());
    }
    Ok(())
}

fn list(manager: &BackupManager, json: bool) -> anyhow::Result<()> {
    let backups = manager.list().context("failed to list backups")?;

    if json {
        print_json(&backups)?;
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = backups
        .iter()
        .map(|b| match &b.metadata {
            Some(m) => vec![
                b.name.clone(),
                m.version.clone(),
                m.files.to_string(),
                m.created.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
            None => vec![
                b.name.clone(),
                "?".to_string(),
                "?".to_string(),
                "incomplete".to_string(),
            ],
        })
        .collect();
    print_table(&["NAME", "VERSION", "FILES", "CREATED"], &rows);
    Ok(())
}

fn validate(manager: &BackupManager, name: &str, json: bool) -> anyhow::Result<()> {
    let backup = manager.find(name)?;
    let validation = manager.validate(&backup.path);

    if json {
        print_json(&validation)?;
    } else if validation.valid {
        println!("{name}: valid");
    } else {
        println!("{name}: INVALID");
        for e in &validation.errors {
            println!("  - {e}");
        }
    }

    if !validation.valid {
        anyhow::bail!("backup '{name}' failed validation");
    }
    Ok(())
}

fn restore(root: &Path, manager: &BackupManager, name: &str, json: bool) -> anyhow::Result<()> {
    let backup = manager.find(name)?;
    let result = manager
        .restore(&backup.path, &paths::install_dir(root))
        .with_context(|| format!("failed to restore '{name}'"))?;

    if json {
        print_json(&result)?;
    } else {
        println!(
            "Restored {} files from {} into {}",
            result.files_restored,
            name,
            result.target.display()
        );
    }
    Ok(())
}

fn delete(manager: &BackupManager, name: &str, json: bool) -> anyhow::Result<()> {
    manager.delete(name)?;
    if json {
        print_json(&serde_json::json!({ "deleted": name }))?;
    } else {
        println!("Deleted {name}");
    }
    Ok(())
}
