// src/config/mod.rs - Machine configuration (TOML)

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_machine_name")]
    pub machine_name: String,
    /// Maximum chord deviation for arc subdivision, mm.
    #[serde(default = "default_arc_tolerance")]
    pub arc_tolerance: f32,
    /// Segments between exact arc position corrections.
    #[serde(default = "default_arc_correction")]
    pub arc_correction: u32,
    #[serde(default)]
    pub enable_parking_override: bool,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub tool_change: ToolChangeConfig,
    #[serde(default)]
    pub work_area: Option<WorkAreaConfig>,
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: MachineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arc_tolerance <= 0.0 {
            return Err(ConfigError::Invalid("arc_tolerance must be positive".into()));
        }
        for axis in 0..crate::N_AXIS {
            let cfg = self.axes.axis(axis);
            if cfg.max_travel < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} axis max_travel must be non-negative",
                    crate::AXIS_NAMES[axis]
                )));
            }
            if cfg.max_rate <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} axis max_rate must be positive",
                    crate::AXIS_NAMES[axis]
                )));
            }
        }
        if let Some(area) = &self.work_area {
            if area.min_x > area.max_x || area.min_y > area.max_y {
                return Err(ConfigError::Invalid("work_area bounds are inverted".into()));
            }
        }
        Ok(())
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            machine_name: default_machine_name(),
            arc_tolerance: default_arc_tolerance(),
            arc_correction: default_arc_correction(),
            enable_parking_override: false,
            axes: AxesConfig::default(),
            probe: ProbeConfig::default(),
            tool_change: ToolChangeConfig::default(),
            work_area: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AxesConfig {
    #[serde(default)]
    pub x: AxisConfig,
    #[serde(default)]
    pub y: AxisConfig,
    #[serde(default)]
    pub z: AxisConfig,
}

impl AxesConfig {
    pub fn axis(&self, index: usize) -> &AxisConfig {
        match index {
            crate::X_AXIS => &self.x,
            crate::Y_AXIS => &self.y,
            _ => &self.z,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Usable travel in mm, measured from the homed position.
    #[serde(default = "default_max_travel")]
    pub max_travel: f32,
    /// Machine position after homing.
    #[serde(default)]
    pub home_mpos: f32,
    /// True when homing seeks toward the positive end of travel.
    #[serde(default = "default_true")]
    pub positive_direction: bool,
    /// mm/min.
    #[serde(default = "default_max_rate")]
    pub max_rate: f32,
    /// Travel span used in place of `max_travel` while a tool change runs.
    #[serde(default = "default_tool_change_travel")]
    pub tool_change_travel: f32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        AxisConfig {
            max_travel: default_max_travel(),
            home_mpos: 0.0,
            positive_direction: true,
            max_rate: default_max_rate(),
            tool_change_travel: default_tool_change_travel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub configured: bool,
    /// Check the pin before a cycle starts and alarm if already tripped.
    #[serde(default = "default_true")]
    pub check_mode_start: bool,
    /// Use the oscillating descent cycle instead of a straight probing move.
    #[serde(default)]
    pub oscillate: bool,
    /// Sideways swing of the oscillating cycle, mm.
    #[serde(default = "default_oscillation_amplitude")]
    pub oscillation_amplitude: f32,
    #[serde(default = "default_oscillation_feed")]
    pub oscillation_feed: f32,
    /// Number of Z steps the oscillating descent is divided into.
    #[serde(default = "default_oscillation_steps")]
    pub oscillation_steps: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            configured: false,
            check_mode_start: true,
            oscillate: false,
            oscillation_amplitude: default_oscillation_amplitude(),
            oscillation_feed: default_oscillation_feed(),
            oscillation_steps: default_oscillation_steps(),
        }
    }
}

/// Pen dock geometry and the three-tier feed rates of the change sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChangeConfig {
    #[serde(default = "default_max_tools")]
    pub max_tools: u8,
    /// Z height that clears everything on the table.
    #[serde(default)]
    pub safe_z: f32,
    /// Z height for traversal along the dock row.
    #[serde(default = "default_raised_z")]
    pub raised_z: f32,
    /// X where the dock channel is entered before fine positioning.
    #[serde(default = "default_entry_x")]
    pub entry_x: f32,
    /// X where the holder seats against the dock.
    #[serde(default = "default_seat_x")]
    pub seat_x: f32,
    #[serde(default = "default_approach_feed")]
    pub approach_feed: f32,
    #[serde(default = "default_precise_feed")]
    pub precise_feed: f32,
    #[serde(default = "default_change_feed")]
    pub default_feed: f32,
}

impl Default for ToolChangeConfig {
    fn default() -> Self {
        ToolChangeConfig {
            max_tools: default_max_tools(),
            safe_z: 0.0,
            raised_z: default_raised_z(),
            entry_x: default_entry_x(),
            seat_x: default_seat_x(),
            approach_feed: default_approach_feed(),
            precise_feed: default_precise_feed(),
            default_feed: default_change_feed(),
        }
    }
}

/// Secondary X/Y envelope toggled at runtime by M160/M161.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkAreaConfig {
    #[serde(default)]
    pub enabled: bool,
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

fn default_machine_name() -> String {
    "plotter".to_string()
}

fn default_arc_tolerance() -> f32 {
    0.002
}

fn default_arc_correction() -> u32 {
    12
}

fn default_max_travel() -> f32 {
    300.0
}

fn default_true() -> bool {
    true
}

fn default_max_rate() -> f32 {
    5000.0
}

fn default_tool_change_travel() -> f32 {
    200.0
}

fn default_oscillation_amplitude() -> f32 {
    2.0
}

fn default_oscillation_feed() -> f32 {
    200.0
}

fn default_oscillation_steps() -> u32 {
    100
}

fn default_max_tools() -> u8 {
    6
}

fn default_raised_z() -> f32 {
    -1.0
}

fn default_entry_x() -> f32 {
    -440.0
}

fn default_seat_x() -> f32 {
    -480.0
}

fn default_approach_feed() -> f32 {
    8000.0
}

fn default_precise_feed() -> f32 {
    2000.0
}

fn default_change_feed() -> f32 {
    10000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: MachineConfig = toml::from_str("").unwrap();
        assert_eq!(config.arc_tolerance, 0.002);
        assert_eq!(config.arc_correction, 12);
        assert_eq!(config.axes.x.max_travel, 300.0);
        assert!(config.axes.x.positive_direction);
        assert_eq!(config.tool_change.max_tools, 6);
        assert_eq!(config.tool_change.entry_x, -440.0);
        assert_eq!(config.tool_change.seat_x, -480.0);
        assert!(config.work_area.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_axis_override() {
        let config: MachineConfig = toml::from_str(
            r#"
            [axes.z]
            max_travel = 80.0
            positive_direction = false
            "#,
        )
        .unwrap();
        assert_eq!(config.axes.z.max_travel, 80.0);
        assert!(!config.axes.z.positive_direction);
        assert_eq!(config.axes.x.max_travel, 300.0);
    }

    #[test]
    fn work_area_section_parses() {
        let config: MachineConfig = toml::from_str(
            r#"
            [work_area]
            enabled = true
            min_x = -400.0
            max_x = 0.0
            min_y = -300.0
            max_y = 0.0
            "#,
        )
        .unwrap();
        let area = config.work_area.unwrap();
        assert!(area.enabled);
        assert_eq!(area.min_x, -400.0);
    }

    #[test]
    fn inverted_work_area_rejected() {
        let config = MachineConfig {
            work_area: Some(WorkAreaConfig {
                enabled: true,
                min_x: 10.0,
                max_x: 0.0,
                min_y: 0.0,
                max_y: 0.0,
            }),
            ..MachineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
