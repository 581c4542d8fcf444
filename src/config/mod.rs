// src/config/mod.rs - Machine and planner configuration
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use thiserror::Error;

use crate::motion::{AXES, MOTORS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unknown axis name '{0}' (expected one of x, y, z, a)")]
    UnknownAxis(String),
}

/// Top-level configuration. Axes are keyed by name ("x", "y", "z", "a");
/// any axis not present in the file falls back to [`AxisConfig::default`].
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub axes: HashMap<String, AxisConfig>,
}

/// Per-axis kinematic limits and scaling.
///
/// Units follow the planner: millimeters and minutes, so velocities are
/// mm/min and jerk is mm/min^3.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisConfig {
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: f64,

    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,

    #[serde(default = "default_max_jerk")]
    pub max_jerk: f64,

    #[serde(default = "default_junction_deviation")]
    pub junction_deviation: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            steps_per_unit: default_steps_per_unit(),
            max_velocity: default_max_velocity(),
            max_jerk: default_max_jerk(),
            junction_deviation: default_junction_deviation(),
        }
    }
}

/// Global planner tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Centripetal acceleration budget for cornering (mm/min^2).
    #[serde(default = "default_junction_acceleration")]
    pub junction_acceleration: f64,

    /// Number of slots in the look-ahead block ring.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Target duration of one runtime segment in microseconds.
    #[serde(default = "default_estd_segment_usec")]
    pub estd_segment_usec: f64,

    /// Sections shorter than this are absorbed into their neighbors (mm).
    #[serde(default = "default_min_line_length")]
    pub min_line_length: f64,

    /// Length epsilon below which a move is considered zero (mm).
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Velocities closer than this are treated as equal (mm/min).
    #[serde(default = "default_velocity_tolerance")]
    pub velocity_tolerance: f64,

    /// Slack allowed before a line is declared too short for its
    /// entry/exit velocities (mm).
    #[serde(default = "default_length_tolerance")]
    pub length_tolerance: f64,

    /// Multiplier on the minimum transition length that selects the
    /// two-section (accel+body / body+decel) fit.
    #[serde(default = "default_length_factor")]
    pub length_factor: f64,

    /// Iteration cap for the asymmetric head/tail fit.
    #[serde(default = "default_iteration_max")]
    pub iteration_max: u32,

    /// Relative convergence bound for the asymmetric head/tail fit.
    #[serde(default = "default_iteration_error_percent")]
    pub iteration_error_percent: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            junction_acceleration: default_junction_acceleration(),
            buffer_size: default_buffer_size(),
            estd_segment_usec: default_estd_segment_usec(),
            min_line_length: default_min_line_length(),
            epsilon: default_epsilon(),
            velocity_tolerance: default_velocity_tolerance(),
            length_tolerance: default_length_tolerance(),
            length_factor: default_length_factor(),
            iteration_max: default_iteration_max(),
            iteration_error_percent: default_iteration_error_percent(),
        }
    }
}

pub const AXIS_NAMES: [&str; AXES] = ["x", "y", "z", "a"];

impl Config {
    /// Resolves the axis map into fixed per-axis arrays, filling defaults
    /// for axes not present in the file.
    pub fn axis_table(&self) -> [AxisConfig; AXES] {
        let mut table: [AxisConfig; AXES] = std::array::from_fn(|_| AxisConfig::default());
        for (i, name) in AXIS_NAMES.iter().enumerate() {
            if let Some(axis) = self.axes.get(*name) {
                table[i] = axis.clone();
            }
        }
        table
    }

    pub fn steps_per_unit(&self) -> [f64; MOTORS] {
        let table = self.axis_table();
        std::array::from_fn(|i| table[i].steps_per_unit)
    }

    /// Rejects axis keys that do not name a configurable axis. Typos in a
    /// config file would otherwise silently fall back to defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for key in self.axes.keys() {
            if !AXIS_NAMES.contains(&key.as_str()) {
                return Err(ConfigError::UnknownAxis(key.clone()));
            }
        }
        Ok(())
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    tracing::info!(
        "Loaded configuration: {} axes configured, buffer size {}",
        config.axes.len(),
        config.planner.buffer_size
    );
    Ok(config)
}

fn default_steps_per_unit() -> f64 { 80.0 }
fn default_max_velocity() -> f64 { 16_000.0 }
fn default_max_jerk() -> f64 { 50_000_000.0 }
fn default_junction_deviation() -> f64 { 0.05 }
fn default_junction_acceleration() -> f64 { 200_000.0 }
fn default_buffer_size() -> usize { 28 }
fn default_estd_segment_usec() -> f64 { 5_000.0 }
fn default_min_line_length() -> f64 { 0.03 }
fn default_epsilon() -> f64 { 0.0001 }
fn default_velocity_tolerance() -> f64 { 1.0 }
fn default_length_tolerance() -> f64 { 0.05 }
fn default_length_factor() -> f64 { 1.1 }
fn default_iteration_max() -> u32 { 20 }
fn default_iteration_error_percent() -> f64 { 0.01 }
