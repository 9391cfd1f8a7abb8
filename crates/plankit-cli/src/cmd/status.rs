use crate::output::{print_fields, print_json};
use anyhow::Context;
use plankit_core::paths;
use plankit_core::registry::VersionLookup;
use plankit_core::source::{validate_source_tree, UpgradeSource};
use plankit_core::upgrade::UpgradeOrchestrator;
use std::path::Path;

/// `plankit status`: installed version, newest available, and the gap.
///
/// Only metadata is queried; nothing is downloaded. When the registry does not
/// answer, the first valid local candidate is reported instead.
pub fn run(root: &Path, registry: Option<String>, json: bool) -> anyhow::Result<()> {
    let orchestrator = UpgradeOrchestrator::from_settings(root, registry);
    let resolver = orchestrator.resolver();
    let install_dir = paths::install_dir(root);
    let current = resolver
        .current_version(&install_dir)
        .context("failed to read installed version")?;

    let mut source = format!("registry:{}", resolver.package());
    let mut lookup = resolver.latest_registry_version();
    if let VersionLookup::Unavailable(reason) = &lookup {
        tracing::info!(%reason, "registry unavailable; probing local candidates");
        let local = orchestrator
            .candidates()
            .iter()
            .find(|candidate| validate_source_tree(candidate).is_ok());
        if let Some(path) = local {
            let candidate = UpgradeSource::Local { path: path.clone() };
            lookup = resolver.latest_version(&candidate);
            source = candidate.to_string();
        }
    }

    let latest = lookup.version().cloned();
    let diff = latest.as_ref().map(|l| resolver.diff(&current, l));

    if json {
        print_json(&serde_json::json!({
            "installed": current.to_string(),
            "latest": latest.as_ref().map(|v| v.to_string()),
            "source": latest.as_ref().map(|_| source.clone()),
            "update_available": diff.map(|d| d.has_update).unwrap_or(false),
            "update_kind": diff.map(|d| d.kind.to_string()),
            "unavailable_reason": match &lookup {
                VersionLookup::Unavailable(reason) => Some(reason.clone()),
                VersionLookup::Available(_) => None,
            },
        }))?;
        return Ok(());
    }

    let latest_line = match (&latest, &lookup) {
        (Some(v), _) => format!("{v} ({source})"),
        (None, VersionLookup::Unavailable(reason)) => format!("unavailable ({reason})"),
        (None, VersionLookup::Available(_)) => "unavailable".to_string(),
    };
    let update_line = match diff {
        Some(d) if d.has_update => format!("{} update available", d.kind),
        Some(_) => "up to date".to_string(),
        None => "unknown".to_string(),
    };
    print_fields(&[
        ("installed", current.to_string()),
        ("latest", latest_line),
        ("status", update_line),
    ]);
    Ok(())
}
