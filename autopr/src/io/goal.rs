//! Goal resolution: preset modes, goal files, and the project `NORTHSTAR.md`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::modes::{NORTHSTAR_MODE, resolve_modes};
use crate::core::types::Goal;
use crate::io::config::write_atomic;

pub const NORTHSTAR_FILE: &str = "NORTHSTAR.md";

const NORTHSTAR_TEMPLATE: &str = include_str!("prompts/northstar.md");

/// How the user asked for a goal. At most one source is expected to be set.
#[derive(Debug, Clone, Default)]
pub struct GoalSelection {
    pub modes: Vec<String>,
    pub goal_file: Option<PathBuf>,
    pub prompt: Option<String>,
}

impl GoalSelection {
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty() && self.goal_file.is_none() && self.prompt.is_none()
    }
}

/// Turn a selection into a concrete goal.
pub fn resolve_goal(selection: &GoalSelection, project_dir: &Path) -> Result<Goal> {
    if let Some(prompt) = &selection.prompt {
        if prompt.trim().is_empty() {
            bail!("--prompt must not be empty");
        }
        return Ok(Goal::from_text("custom", prompt));
    }

    if let Some(path) = &selection.goal_file {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("goal file not found: {}", path.display()))?;
        if contents.trim().is_empty() {
            bail!("goal file is empty: {}", path.display());
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "goal".to_string());
        return Ok(Goal::from_text(&stem, &contents));
    }

    if selection.modes.iter().any(|m| m == NORTHSTAR_MODE) {
        if selection.modes.len() > 1 {
            bail!("mode '{NORTHSTAR_MODE}' cannot be combined with other modes");
        }
        return load_northstar(project_dir);
    }

    if !selection.modes.is_empty() {
        let modes = resolve_modes(&selection.modes)?;
        return Ok(Goal::from_modes(&modes));
    }

    Err(anyhow!("no goal defined: pass --mode, --goal-file or --prompt"))
}

/// Goal built from `<project>/NORTHSTAR.md`.
pub fn load_northstar(project_dir: &Path) -> Result<Goal> {
    let path = project_dir.join(NORTHSTAR_FILE);
    if !path.is_file() {
        bail!(
            "{NORTHSTAR_FILE} not found in {} (create one with `autopr init-northstar`)",
            project_dir.display()
        );
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    if contents.trim().is_empty() {
        bail!("{NORTHSTAR_FILE} is empty: {}", path.display());
    }
    debug!(path = %path.display(), "loaded north star");
    let prompt = format!(
        "Work toward the goals described in the project's {NORTHSTAR_FILE}. Pick the most \
         valuable unfinished item, implement it completely, and keep changes focused.\n\n\
         {}\n",
        contents.trim()
    );
    Ok(Goal {
        title: "North Star".to_string(),
        slug: "northstar".to_string(),
        prompt,
    })
}

/// Write the default `NORTHSTAR.md` template. Refuses to overwrite unless `force`.
pub fn create_default_northstar(project_dir: &Path, force: bool) -> Result<PathBuf> {
    let path = project_dir.join(NORTHSTAR_FILE);
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_atomic(&path, NORTHSTAR_TEMPLATE)?;
    Ok(path)
}
