use crate::output::{print_json, print_table};
use anyhow::Context;
use plankit_core::manifest::ToolkitManifest;
use plankit_core::migrations::{BuiltinMigrations, MigrationCatalog, MigrationRegistry};
use plankit_core::paths;
use plankit_core::version::parse_version;
use std::path::Path;

/// `plankit migrations`: list registered migrations in `(from, to]`.
///
/// `from` defaults to the installed version; without `to` there is no upper
/// bound.
pub fn run(root: &Path, from: Option<&str>, to: Option<&str>, json: bool) -> anyhow::Result<()> {
    let install_dir = paths::install_dir(root);
    let installed = ToolkitManifest::load(&install_dir)?;
    let registry = MigrationRegistry::load(&install_dir).context("failed to load migrations")?;

    let from = match from {
        Some(raw) => parse_version(raw)?,
        None => installed.version,
    };
    let to = to.map(parse_version).transpose()?;

    let listed: Vec<_> = registry
        .all()
        .iter()
        .filter(|m| m.target_version > from)
        .filter(|m| to.as_ref().map_or(true, |to| m.target_version <= *to))
        .collect();

    if json {
        print_json(&listed)?;
        return Ok(());
    }

    if listed.is_empty() {
        println!("No migrations after {from}.");
        return Ok(());
    }

    let catalog = BuiltinMigrations;
    let rows: Vec<Vec<String>> = listed
        .iter()
        .map(|m| {
            let implementation = if catalog.lookup(&m.implementation).is_some() {
                m.implementation.clone()
            } else {
                format!("{} (missing)", m.implementation)
            };
            vec![
                m.target_version.to_string(),
                m.id.clone(),
                m.kind.as_str().to_string(),
                implementation,
                m.description.clone(),
            ]
        })
        .collect();
    print_table(
        &["VERSION", "ID", "TYPE", "IMPLEMENTATION", "DESCRIPTION"],
        &rows,
    );
    Ok(())
}
