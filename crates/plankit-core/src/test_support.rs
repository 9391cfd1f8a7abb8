use crate::manifest::ToolkitManifest;
use crate::version::parse_version;
use std::path::Path;

/// Lay out a minimal but complete toolkit tree at `dir`.
pub fn write_toolkit_tree(dir: &Path, version: &str) {
    std::fs::create_dir_all(dir).unwrap();
    ToolkitManifest::new(parse_version(version).unwrap())
        .save(dir)
        .unwrap();
    for sub in ["templates", "guidelines", "scripts"] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    std::fs::write(
        dir.join("templates/plan.md"),
        format!("# Plan template v{version}\n"),
    )
    .unwrap();
    std::fs::write(
        dir.join("guidelines/stages.md"),
        format!("# Stage guidelines v{version}\n"),
    )
    .unwrap();
    std::fs::write(dir.join("scripts/check.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::write(
        dir.join("config.yaml"),
        format!("version: {version}\ntheme: light\n"),
    )
    .unwrap();
}
