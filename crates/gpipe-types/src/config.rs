// Global configuration structs for the GPipe wrapper and the node binary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::GPipeError;

// ── Checkpoint mode ──────────────────────────────────────────────────────────

/// Which micro-batches run under activation checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Every micro-batch is checkpointed.
    Always,
    /// Every micro-batch except the last one is checkpointed.
    #[default]
    ExceptLast,
    /// No checkpointing.
    Never,
}

impl CheckpointMode {
    /// Number of leading micro-batches (out of `chunks`) to checkpoint.
    pub fn checkpoint_stop(&self, chunks: usize) -> usize {
        match self {
            Self::Always     => chunks,
            Self::ExceptLast => chunks.saturating_sub(1),
            Self::Never      => 0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always"      => Some(Self::Always),
            "except_last" => Some(Self::ExceptLast),
            "never"       => Some(Self::Never),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always     => write!(f, "always"),
            Self::ExceptLast => write!(f, "except_last"),
            Self::Never      => write!(f, "never"),
        }
    }
}

// ── GPipe config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GPipeConfig {
    /// Number of micro-batches each mini-batch is split into.
    /// Default: 1.
    pub chunks: usize,

    /// Checkpointing policy applied while training.
    /// Default: `except_last`.
    pub checkpoint: CheckpointMode,

    /// Device per partition. `None` pins every partition to the CPU.
    pub devices: Option<Vec<Device>>,

    /// Prefix for worker thread names; worker `i` is named `{prefix}-{i}`.
    pub worker_name_prefix: String,
}

impl Default for GPipeConfig {
    fn default() -> Self {
        Self {
            chunks: 1,
            checkpoint: CheckpointMode::default(),
            devices: None,
            worker_name_prefix: "gpipe-worker".into(),
        }
    }
}

impl GPipeConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, GPipeError> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| GPipeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), GPipeError> {
        if self.chunks == 0 {
            return Err(GPipeError::Config("chunks must be at least 1".into()));
        }
        if self.worker_name_prefix.is_empty() {
            return Err(GPipeError::Config("worker_name_prefix must not be empty".into()));
        }
        if let Some(devices) = &self.devices {
            if devices.is_empty() {
                return Err(GPipeError::Config("devices must not be empty when given".into()));
            }
        }
        Ok(())
    }

    /// Devices for `num_partitions` partitions, defaulting to the CPU.
    pub fn devices_for(&self, num_partitions: usize) -> Result<Vec<Device>, GPipeError> {
        match &self.devices {
            Some(d) if d.len() == num_partitions => Ok(d.clone()),
            Some(d) => Err(GPipeError::Config(format!(
                "{} devices configured for {num_partitions} partitions",
                d.len()
            ))),
            None => Ok(vec![Device::Cpu; num_partitions]),
        }
    }
}
