// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Character file loading
//!
//! Each `--character` path is parsed independently. Bad files are reported
//! and skipped; loading fails only when paths were given and none loaded.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use warden_core::domain::agent::Character;

/// Outcome of loading a batch of character files.
#[derive(Debug, Default)]
pub struct LoadedCharacters {
    pub characters: Vec<Character>,
    pub errors: Vec<(PathBuf, String)>,
}

pub fn load_character_file(path: &Path) -> Result<Character> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read character file {}", path.display()))?;
    let character: Character = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse character file {}", path.display()))?;
    Ok(character)
}

/// Load every path, collecting per-file errors.
pub fn load_all(paths: &[PathBuf]) -> LoadedCharacters {
    let mut loaded = LoadedCharacters::default();
    for path in paths.iter().filter(|p| !p.as_os_str().is_empty()) {
        match load_character_file(path) {
            Ok(character) => {
                info!("Loaded character '{}' from {}", character.name, path.display());
                loaded.characters.push(character);
            }
            Err(e) => {
                warn!("Skipping {}: {:#}", path.display(), e);
                loaded.errors.push((path.clone(), format!("{e:#}")));
            }
        }
    }
    loaded
}

/// Characters to start: the loaded files, or the default agent when no
/// paths were given.
pub fn resolve_characters(paths: &[PathBuf]) -> Result<Vec<Character>> {
    if paths.iter().all(|p| p.as_os_str().is_empty()) {
        info!("No character files given, starting the default agent");
        return Ok(vec![Character::default_agent()]);
    }

    let loaded = load_all(paths);
    for (path, error) in &loaded.errors {
        eprintln!("{} {}: {}", "✗".red(), path.display(), error);
    }
    if loaded.characters.is_empty() {
        anyhow::bail!(
            "None of the {} character file(s) could be loaded",
            loaded.errors.len()
        );
    }
    Ok(loaded.characters)
}
