// src/persistence.rs - Coordinate table and tool dock persistence ports

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gcode::modal::CoordIndex;
use crate::{Position, N_AXIS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tool {0} has no configured dock")]
    UnknownTool(u8),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Persistent G54-G59 work systems plus the G28/G30 home positions.
/// Reads never fail; an unwritten slot is all zeros.
pub trait CoordStore: Send {
    fn get(&self, index: CoordIndex) -> Position;
    fn set(&mut self, index: CoordIndex, value: Position);
}

#[derive(Debug, Default)]
pub struct MemoryCoordStore {
    slots: [Position; CoordIndex::STORED],
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        MemoryCoordStore::default()
    }
}

impl CoordStore for MemoryCoordStore {
    fn get(&self, index: CoordIndex) -> Position {
        match index.slot() {
            Some(slot) => self.slots[slot],
            None => [0.0; N_AXIS],
        }
    }

    fn set(&mut self, index: CoordIndex, value: Position) {
        if let Some(slot) = index.slot() {
            self.slots[slot] = value;
        }
    }
}

/// One pen dock: machine-frame seat position and whether a pen sits in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDock {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub occupied: bool,
}

impl ToolDock {
    pub fn position(&self) -> Position {
        [self.x, self.y, self.z]
    }
}

/// Dock lookup and occupancy used by the tool-change sequence.
pub trait ToolTable: Send {
    fn dock_position(&self, tool: u8) -> Result<Position, StoreError>;
    fn set_occupied(&mut self, tool: u8, occupied: bool);
    fn is_occupied(&self, tool: u8) -> bool;
}

#[derive(Debug, Deserialize)]
struct ToolFile {
    #[serde(default)]
    tools: HashMap<String, ToolDock>,
}

/// Tool rack, optionally loaded from a `tools.toml` file with one
/// `[tools.N]` table per dock.
#[derive(Debug, Default)]
pub struct ToolRack {
    docks: HashMap<u8, ToolDock>,
    path: Option<PathBuf>,
}

impl ToolRack {
    pub fn new() -> Self {
        ToolRack::default()
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let file: ToolFile = toml::from_str(&text)?;
        let mut docks = HashMap::new();
        for (key, dock) in file.tools {
            match key.parse::<u8>() {
                Ok(tool) if tool > 0 => {
                    docks.insert(tool, dock);
                }
                _ => tracing::warn!(key = %key, "ignoring tool entry with non-numeric id"),
            }
        }
        Ok(ToolRack {
            docks,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn insert(&mut self, tool: u8, dock: ToolDock) {
        self.docks.insert(tool, dock);
    }

    pub fn len(&self) -> usize {
        self.docks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docks.is_empty()
    }

    pub fn source(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ToolTable for ToolRack {
    fn dock_position(&self, tool: u8) -> Result<Position, StoreError> {
        self.docks
            .get(&tool)
            .map(ToolDock::position)
            .ok_or(StoreError::UnknownTool(tool))
    }

    fn set_occupied(&mut self, tool: u8, occupied: bool) {
        if let Some(dock) = self.docks.get_mut(&tool) {
            dock.occupied = occupied;
        }
    }

    fn is_occupied(&self, tool: u8) -> bool {
        self.docks.get(&tool).map(|d| d.occupied).unwrap_or(false)
    }
}
