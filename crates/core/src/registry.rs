//! Append-only JSON registry of tracked leverage tokens.

use crate::position::Position;
use alloy::primitives::Address;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registry backed by a JSON array file.
///
/// Entries are only ever added; the file is rewritten atomically
/// (temp file + rename) on append.
#[derive(Debug)]
pub struct PositionRegistry {
    path: PathBuf,
    positions: RwLock<Vec<Position>>,
}

impl PositionRegistry {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let positions = read_file(&path)?;
        info!(path = %path.display(), count = positions.len(), "Position registry loaded");
        Ok(Self {
            path,
            positions: RwLock::new(positions),
        })
    }

    /// Re-read the file, picking up entries appended by other tools.
    pub fn reload(&self) -> Result<usize> {
        let positions = read_file(&self.path)?;
        let count = positions.len();
        *self.positions.write() = positions;
        Ok(count)
    }

    pub fn list(&self) -> Vec<Position> {
        self.positions.read().clone()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    pub fn contains(&self, token: &Address) -> bool {
        self.positions.read().iter().any(|p| p.token == *token)
    }

    /// Append positions not already present (by token). Returns how many were added.
    pub fn append(&self, new: impl IntoIterator<Item = Position>) -> Result<usize> {
        let mut positions = self.positions.write();
        let mut seen: HashSet<Address> = positions.iter().map(|p| p.token).collect();

        let before = positions.len();
        for position in new {
            if seen.insert(position.token) {
                debug!(token = %position.token, "Registering leverage token");
                positions.push(position);
            }
        }
        let added = positions.len() - before;

        if added > 0 {
            if let Err(e) = write_file(&self.path, &positions) {
                positions.truncate(before);
                return Err(e);
            }
            info!(added, total = positions.len(), "Position registry updated");
        }
        Ok(added)
    }
}

fn read_file(path: &Path) -> Result<Vec<Position>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading registry {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).with_context(|| format!("parsing registry {}", path.display()))
}

fn write_file(path: &Path, positions: &[Position]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(positions)?;
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
