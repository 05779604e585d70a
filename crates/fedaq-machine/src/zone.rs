//! Cryomodule zones and their safety budget.
//!
//! A zone is one cryomodule: exactly eight cavities sharing a helium bath
//! whose JT valve stroke tells us how hard cryo is working.  Gradient changes
//! are gated on the valve position and on the aggregate heat change the new
//! gradients would impose.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use fedaq_core::config::{RecoveryConfig, ZoneLimits};
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::signal::SignalLink;

use crate::cavity::Cavity;
use crate::family::Family;

/// Cavities per cryomodule.  The heat budget is defined over a full module.
pub const CAVITIES_PER_ZONE: usize = 8;

/// The cryo guard for one zone, shared by the zone's cavities.
pub struct ZoneGuard {
    zone: String,
    jt_stroke: Arc<dyn SignalLink>,
    limits: ZoneLimits,
    recovery: RecoveryConfig,
}

impl ZoneGuard {
    #[must_use]
    pub fn new(
        zone: impl Into<String>,
        jt_stroke: Arc<dyn SignalLink>,
        limits: ZoneLimits,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            zone: zone.into(),
            jt_stroke,
            limits,
            recovery,
        }
    }

    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    #[must_use]
    pub fn jt_channel(&self) -> &Arc<dyn SignalLink> {
        &self.jt_stroke
    }

    #[must_use]
    pub fn jt_stroke_max(&self) -> f64 {
        self.limits.jt_stroke_max
    }

    /// Is the JT valve open beyond `threshold` (default: the configured max)?
    /// Returns the verdict and the observed stroke.
    pub fn check_jt_valve(&self, threshold: Option<f64>) -> DaqResult<(bool, f64)> {
        let maximum = threshold.unwrap_or(self.limits.jt_stroke_max);
        let value = self.jt_stroke.read()?;
        Ok((value >= maximum, value))
    }

    /// If the valve is too open, wait for it to recover below the hysteresis
    /// point (`max - margin`).  Fails with a timeout after the configured
    /// recovery window.
    pub fn wait_for_recovery(&self) -> DaqResult<()> {
        let (mut too_open, mut stroke) = self.check_jt_valve(None)?;
        if !too_open {
            return Ok(());
        }
        let recovery_point = self.limits.jt_stroke_max - self.limits.jt_recovery_margin;
        warn!(
            target: "fedaq",
            zone = %self.zone,
            stroke,
            recovery_point,
            "JT valve too open, waiting for recovery"
        );
        let start = Instant::now();
        while too_open {
            if start.elapsed() >= self.recovery.timeout() {
                warn!(target: "fedaq", zone = %self.zone, stroke, "JT valve unrecovered");
                return Err(DaqError::timeout("JT valve recovery", start.elapsed()));
            }
            std::thread::sleep(self.recovery.poll());
            (too_open, stroke) = self.check_jt_valve(Some(recovery_point))?;
        }
        info!(target: "fedaq", zone = %self.zone, stroke, "JT valve recovered");
        Ok(())
    }
}

/// Signed relative heat change a proposed gradient set would impose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatChange {
    /// Relative change, percent.
    pub percent: f64,
    /// Aggregate heat at the proposed gradients, watts.
    pub new_w: f64,
    /// Aggregate heat at the current gradients, watts.
    pub old_w: f64,
}

/// One cryomodule: a name, a controls family, a cryo guard, and its eight
/// cavities in position order.
pub struct Zone {
    name: String,
    family: Family,
    guard: Arc<ZoneGuard>,
    cavities: Vec<Arc<Cavity>>,
}

impl Zone {
    /// Assemble a zone.  Requires exactly [`CAVITIES_PER_ZONE`] cavities; they
    /// are kept sorted by cavity number so heat proposals index by position.
    pub fn new(
        name: impl Into<String>,
        family: Family,
        guard: Arc<ZoneGuard>,
        mut cavities: Vec<Arc<Cavity>>,
    ) -> DaqResult<Self> {
        let name = name.into();
        if cavities.len() != CAVITIES_PER_ZONE {
            return Err(DaqError::Inventory {
                detail: format!(
                    "zone {name} has {} cavities, expected {CAVITIES_PER_ZONE}",
                    cavities.len()
                ),
            });
        }
        cavities.sort_by_key(|c| c.cavity_number());
        for (idx, cavity) in cavities.iter().enumerate() {
            let expected = idx as u8 + 1;
            if cavity.cavity_number() != expected {
                return Err(DaqError::Inventory {
                    detail: format!(
                        "zone {name}: cavity {} holds position {expected}",
                        cavity.name()
                    ),
                });
            }
        }
        Ok(Self {
            name,
            family,
            guard,
            cavities,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn family(&self) -> Family {
        self.family
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<ZoneGuard> {
        &self.guard
    }

    /// The zone's cavities, sorted by cavity number (positions 1..=8).
    #[must_use]
    pub fn cavities(&self) -> &[Arc<Cavity>] {
        &self.cavities
    }

    /// Gate a proposed gradient set against the zone's heat budget.
    ///
    /// `proposed` holds one entry per cavity position; `None` means unchanged.
    /// The change is rejected when its magnitude exceeds `max_percent` in
    /// either direction: a large reduction stresses cryo as much as a large
    /// increase.
    pub fn check_heat_change(
        &self,
        proposed: &[Option<f64>],
        max_percent: f64,
    ) -> DaqResult<HeatChange> {
        if proposed.len() != CAVITIES_PER_ZONE {
            return Err(DaqError::Inventory {
                detail: format!(
                    "heat proposal for {} has {} entries, expected {CAVITIES_PER_ZONE}",
                    self.name,
                    proposed.len()
                ),
            });
        }
        let mut old_w = 0.0;
        let mut new_w = 0.0;
        for (cavity, gradient) in self.cavities.iter().zip(proposed) {
            old_w += cavity.calculate_heat(None)?;
            new_w += cavity.calculate_heat(*gradient)?;
        }
        // A dead-quiet zone has no baseline to take a percentage of.  Staying
        // quiet is trivially fine; adding any heat at all is not.
        let percent = if old_w == 0.0 {
            if new_w > 0.0 {
                return Err(DaqError::HeatBudget {
                    zone: self.name.clone(),
                    percent: f64::INFINITY,
                    limit: max_percent,
                    old_w,
                    new_w,
                });
            }
            0.0
        } else {
            (new_w - old_w) / old_w * 100.0
        };
        let change = HeatChange {
            percent,
            new_w,
            old_w,
        };
        if percent.abs() > max_percent {
            return Err(DaqError::HeatBudget {
                zone: self.name.clone(),
                percent,
                limit: max_percent,
                old_w,
                new_w,
            });
        }
        Ok(change)
    }
}
