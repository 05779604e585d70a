//! Configuration for the gradient automation pipeline.
//!
//! [`DaqConfig`] carries every tuning knob: ramp pacing, cryo recovery limits,
//! and the per-family low-level-RF parameters.  All fields have defaults that
//! match CEBAF operational practice, so an empty TOML file is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

/// Top-level configuration.
///
/// # Environment Variable Overrides
///
/// | Variable                  | Field                     | Default |
/// |---------------------------|---------------------------|---------|
/// | `FEDAQ_SETTLE_TIME`       | `ramp.settle_time_s`      | `6.0`   |
/// | `FEDAQ_RAMP_TIMEOUT`      | `ramp.ramp_timeout_s`     | `20.0`  |
/// | `FEDAQ_RECOVERY_TIMEOUT`  | `recovery.timeout_s`      | `60.0`  |
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Gradient ramp pacing and watch windows.
    pub ramp: RampConfig,
    /// Cryo recovery wait behavior.
    pub recovery: RecoveryConfig,
    /// Per-zone safety limits.
    pub zone: ZoneLimits,
    /// Per-linac safety limits.
    pub linac: LinacLimits,
    /// Per-family low-level-RF parameters.
    pub family: FamilyTable,
}

impl DaqConfig {
    /// Parse from TOML text.  Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> DaqResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DaqError::InvalidConfig {
            field: "<toml>".into(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> DaqResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load overrides from environment variables.
    ///
    /// Only overrides fields for which variables are set; invalid values are
    /// silently ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FEDAQ_SETTLE_TIME")
            && let Ok(s) = val.parse::<f64>()
            && s >= 0.0
        {
            self.ramp.settle_time_s = s;
        }
        if let Ok(val) = std::env::var("FEDAQ_RAMP_TIMEOUT")
            && let Ok(s) = val.parse::<f64>()
            && s > 0.0
        {
            self.ramp.ramp_timeout_s = s;
        }
        if let Ok(val) = std::env::var("FEDAQ_RECOVERY_TIMEOUT")
            && let Ok(s) = val.parse::<f64>()
            && s > 0.0
        {
            self.recovery.timeout_s = s;
        }
        self
    }

    /// Reject configs that could drive the machine somewhere unsafe.
    pub fn validate(&self) -> DaqResult<()> {
        if self.linac.pressure_min >= self.linac.pressure_max {
            return Err(DaqError::InvalidConfig {
                field: "linac.pressure_min".into(),
                value: self.linac.pressure_min.to_string(),
                reason: format!(
                    "pressure band is empty (max = {})",
                    self.linac.pressure_max
                ),
            });
        }
        if self.zone.jt_recovery_margin < 0.0 {
            return Err(DaqError::InvalidConfig {
                field: "zone.jt_recovery_margin".into(),
                value: self.zone.jt_recovery_margin.to_string(),
                reason: "margin must be non-negative".into(),
            });
        }
        for (name, family) in [
            ("family.llrf1", &self.family.llrf1),
            ("family.llrf2", &self.family.llrf2),
            ("family.llrf3", &self.family.llrf3),
        ] {
            if family.step_size <= 0.0 {
                return Err(DaqError::InvalidConfig {
                    field: format!("{name}.step_size"),
                    value: family.step_size.to_string(),
                    reason: "step size must be positive".into(),
                });
            }
            if family.min_stable_gradient <= 0.0 {
                return Err(DaqError::InvalidConfig {
                    field: format!("{name}.min_stable_gradient"),
                    value: family.min_stable_gradient.to_string(),
                    reason: "minimum stable gradient must be positive".into(),
                });
            }
        }
        Ok(())
    }
}

/// Ramp pacing and watch windows shared by every cavity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// How long to let cryo adjust after the final step of a gradient change.
    pub settle_time_s: f64,
    /// How long a started hardware ramp may run before consulting the operator.
    pub ramp_timeout_s: f64,
    /// GSET-to-GMES difference treated as readback noise.  A cavity this close
    /// to target is assumed not to ramp.
    pub gradient_epsilon: f64,
    /// How long to watch for a hardware ramp to begin.  Ramp status updates on
    /// a 1 Hz cycle, so the watch must cover slightly more than a second.
    pub ramp_watch_s: f64,
    /// Wait before retrying a setpoint readback that returned no value.
    pub read_retry_wait_s: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            settle_time_s: 6.0,
            ramp_timeout_s: 20.0,
            gradient_epsilon: 0.05,
            ramp_watch_s: 1.01,
            read_retry_wait_s: 15.0,
        }
    }
}

impl RampConfig {
    #[must_use]
    pub fn settle_time(&self) -> Duration {
        Duration::from_secs_f64(self.settle_time_s)
    }

    #[must_use]
    pub fn ramp_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ramp_timeout_s)
    }
}

/// How long to wait for cryo systems (JT valve, linac pressure, heater
/// capacity margin) to come back into spec before failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Poll interval while waiting, in milliseconds.
    pub poll_ms: u64,
    /// Give up after this long, in seconds.
    pub timeout_s: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_ms: 10,
            timeout_s: 60.0,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

/// Zone-level cryo limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneLimits {
    /// JT valve stroke above which no gradient changes are allowed.
    pub jt_stroke_max: f64,
    /// Recovery hysteresis: after a violation, wait until the stroke is back
    /// under `jt_stroke_max - jt_recovery_margin`.
    pub jt_recovery_margin: f64,
}

impl Default for ZoneLimits {
    fn default() -> Self {
        Self {
            jt_stroke_max: 82.0,
            jt_recovery_margin: 2.0,
        }
    }
}

/// Linac-level cryo limits.  Nominal linac pressure is 0.0385 atm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinacLimits {
    /// Lower edge of the acceptable pressure band.
    pub pressure_min: f64,
    /// Upper edge of the acceptable pressure band.
    pub pressure_max: f64,
    /// Recovery hysteresis applied to both band edges.
    pub pressure_recovery_margin: f64,
    /// Minimum spare heater capacity required for gradient changes.
    pub heater_margin_min: f64,
    /// Recovery hysteresis: wait until the margin is back above
    /// `heater_margin_min + heater_recovery_margin`.
    pub heater_recovery_margin: f64,
}

impl Default for LinacLimits {
    fn default() -> Self {
        Self {
            pressure_min: 0.035,
            pressure_max: 0.042,
            pressure_recovery_margin: 0.0002,
            heater_margin_min: 1.0,
            heater_recovery_margin: 3.0,
        }
    }
}

/// Parameters for one low-level-RF hardware family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyParams {
    /// Lowest gradient at which a cavity of this family runs stably.
    /// Requests strictly between zero and this value are rejected.
    pub min_stable_gradient: f64,
    /// Step size in MV/m for software-paced ramps.
    pub step_size: f64,
    /// Pause between software ramp steps, in seconds.
    pub step_interval_s: f64,
    /// GMES-vs-GSET difference that indicates ramping, for families with no
    /// ramp status bit.
    pub gmes_ramp_tolerance: f64,
    /// Status-word bit (counting from zero) that reports an active hardware
    /// ramp.  `None` means the family reports no ramp status.
    pub ramp_status_bit: Option<u8>,
    /// Firmware versions strictly greater than this ramp in software on the
    /// IOC side, so this tool must not wait for an external ramp.
    pub self_ramp_firmware_above: Option<f64>,
    /// Detune hysteresis: tuning is required while |detune| exceeds
    /// `limit - tuner_recovery_margin`.
    pub tuner_recovery_margin: f64,
    /// How long to wait for the tuner before consulting the operator.
    pub tuner_timeout_s: f64,
    /// Fault-status channel value meaning "no fault", by firmware era.
    /// `None` when the family has no single fault summary channel.
    pub fsd_ok: Option<FsdOk>,
}

/// Acceptable fault-summary readings for the two firmware eras of a family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsdOk {
    /// Firmware versions at or above this use `modern_ok`.
    pub modern_firmware: f64,
    /// "No fault" value for modern firmware.
    pub modern_ok: f64,
    /// "No fault" value for older firmware.
    pub legacy_ok: f64,
}

impl Default for FamilyParams {
    fn default() -> Self {
        Self {
            min_stable_gradient: 5.0,
            step_size: 0.1,
            step_interval_s: 1.0,
            gmes_ramp_tolerance: 0.3,
            ramp_status_bit: None,
            self_ramp_firmware_above: None,
            tuner_recovery_margin: 1.0,
            tuner_timeout_s: 300.0,
            fsd_ok: None,
        }
    }
}

impl FamilyParams {
    #[must_use]
    pub fn step_interval(&self) -> Duration {
        Duration::from_secs_f64(self.step_interval_s)
    }

    #[must_use]
    pub fn tuner_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tuner_timeout_s)
    }
}

/// Per-family parameter table with hardware-accurate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyTable {
    /// LLRF 1.0 (C25/C50 era analog controls).
    pub llrf1: FamilyParams,
    /// LLRF 2.0 (C100 digital controls).
    pub llrf2: FamilyParams,
    /// LLRF 3.0 (C75 digital controls).
    pub llrf3: FamilyParams,
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self {
            // No ramp status; detect ramping by GMES distance from GSET.
            llrf1: FamilyParams {
                min_stable_gradient: 3.0,
                gmes_ramp_tolerance: 0.3,
                ..FamilyParams::default()
            },
            // Status bit 11 reports ramping; newer firmware ramps IOC-side.
            llrf2: FamilyParams {
                min_stable_gradient: 5.0,
                gmes_ramp_tolerance: 0.2,
                ramp_status_bit: Some(11),
                self_ramp_firmware_above: Some(2019.0),
                fsd_ok: Some(FsdOk {
                    modern_firmware: 2021.0,
                    modern_ok: 768.0,
                    legacy_ok: 972.0,
                }),
                ..FamilyParams::default()
            },
            // Status bit 15 reports ramping.
            llrf3: FamilyParams {
                min_stable_gradient: 5.0,
                gmes_ramp_tolerance: 0.3,
                ramp_status_bit: Some(15),
                ..FamilyParams::default()
            },
        }
    }
}
