// Device and stream identities shared by the scheduler, its backends and the
// command-line driver.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Device ───────────────────────────────────────────────────────────────────

/// A compute device a partition is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Host CPU. The default when no devices are given.
    #[default]
    Cpu,
    /// Accelerator with the given ordinal.
    Accelerator(u32),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Parse `"cpu"` or `"accel:N"`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(Self::Cpu),
            _ => s
                .strip_prefix("accel:")
                .and_then(|n| n.parse().ok())
                .map(Self::Accelerator),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu            => write!(f, "cpu"),
            Self::Accelerator(n) => write!(f, "accel:{n}"),
        }
    }
}

// ── Stream ───────────────────────────────────────────────────────────────────

/// An ordered execution queue on one device.
///
/// `id == 0` is the device's default stream. Backends hand out other ids
/// from [`Stream::new`] when asked for a fresh stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub device: Device,
    pub id: u32,
}

impl Stream {
    pub const DEFAULT_ID: u32 = 0;

    pub fn new(device: Device, id: u32) -> Self {
        Self { device, id }
    }

    /// The default stream of `device`.
    pub fn default_for(device: Device) -> Self {
        Self::new(device, Self::DEFAULT_ID)
    }

    pub fn is_default(&self) -> bool {
        self.id == Self::DEFAULT_ID
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s{}", self.device, self.id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
