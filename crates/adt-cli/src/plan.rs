//! The test plan: which source trees to test and their declared tests.

use std::fs;
use std::path::Path;

use adt_testbed::Package;
use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanFile {
    Packages(Vec<Package>),
    Wrapped { packages: Vec<Package> },
}

/// Read a plan. Relative tree paths are taken relative to the plan file.
pub fn load(path: &Path) -> Result<Vec<Package>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let mut packages = match serde_json::from_str::<PlanFile>(&text)
        .with_context(|| format!("parse plan {}", path.display()))?
    {
        PlanFile::Packages(packages) | PlanFile::Wrapped { packages } => packages,
    };
    let base = path.parent().unwrap_or(Path::new("."));
    for package in &mut packages {
        if package.name.is_empty() {
            bail!("plan {}: package without a name", path.display());
        }
        if package.tree.is_relative() {
            package.tree = base.join(&package.tree);
        }
    }
    Ok(packages)
}
