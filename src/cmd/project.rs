//! Project scaffolding — `foreman new`.

use anyhow::Result;
use console::style;
use std::path::Path;

use foreman::manifest;

pub fn cmd_new(root: &Path, project: &str, name: &str) -> Result<()> {
    let path = manifest::scaffold(root, project, name)?;
    println!(
        "{} created {}",
        style("✓").green().bold(),
        path.display()
    );
    println!("Edit the component list, then run: foreman run --spec {name}");
    Ok(())
}
