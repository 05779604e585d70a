//! Linac-level cryo plant guard and the linac aggregate.
//!
//! One linac shares a cryo plant: a liquid-helium pressure reading, a heater
//! capacity margin, and an autoheat mode flag.  Gradient work is gated on all
//! three, and the linac owns the zone and cavity inventory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use fedaq_core::config::{LinacLimits, RecoveryConfig};
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::signal::SignalLink;

use crate::cavity::Cavity;
use crate::zone::Zone;

/// The cryo plant guard for one linac, shared by every cavity in it.
pub struct LinacGuard {
    linac: String,
    pressure: Arc<dyn SignalLink>,
    heater_margin: Arc<dyn SignalLink>,
    autoheat: Arc<dyn SignalLink>,
    limits: LinacLimits,
    recovery: RecoveryConfig,
}

impl LinacGuard {
    #[must_use]
    pub fn new(
        linac: impl Into<String>,
        pressure: Arc<dyn SignalLink>,
        heater_margin: Arc<dyn SignalLink>,
        autoheat: Arc<dyn SignalLink>,
        limits: LinacLimits,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            linac: linac.into(),
            pressure,
            heater_margin,
            autoheat,
            limits,
            recovery,
        }
    }

    #[must_use]
    pub fn linac(&self) -> &str {
        &self.linac
    }

    #[must_use]
    pub fn pressure_channel(&self) -> &Arc<dyn SignalLink> {
        &self.pressure
    }

    #[must_use]
    pub fn heater_margin_channel(&self) -> &Arc<dyn SignalLink> {
        &self.heater_margin
    }

    #[must_use]
    pub fn autoheat_channel(&self) -> &Arc<dyn SignalLink> {
        &self.autoheat
    }

    /// The heater controller must be in automatic mode (value 1) before any
    /// gradient change.  Manual mode means an operator owns the heaters.
    pub fn autoheat_enabled(&self) -> DaqResult<bool> {
        Ok(self.autoheat.read()? == 1.0)
    }

    /// Is the LHe pressure outside `[min, max]` (defaults from config)?
    /// Returns the verdict and the observed pressure.
    pub fn check_pressure(&self, min: Option<f64>, max: Option<f64>) -> DaqResult<(bool, f64)> {
        let min = min.unwrap_or(self.limits.pressure_min);
        let max = max.unwrap_or(self.limits.pressure_max);
        let value = self.pressure.read()?;
        Ok((value > max || value < min, value))
    }

    /// Is the heater capacity margin at or below `threshold` (default from
    /// config)?  Returns the verdict and the observed margin.
    pub fn check_heater_margin(&self, threshold: Option<f64>) -> DaqResult<(bool, f64)> {
        let min = threshold.unwrap_or(self.limits.heater_margin_min);
        let value = self.heater_margin.read()?;
        Ok((value <= min, value))
    }

    /// Wait for pressure to come back inside a narrowed band
    /// (`[min + margin, max - margin]`) so a reading at the edge does not
    /// immediately re-trip.  Times out after the recovery window.
    pub fn wait_for_pressure_recovery(&self) -> DaqResult<()> {
        let (mut out_of_spec, mut pressure) = self.check_pressure(None, None)?;
        if !out_of_spec {
            return Ok(());
        }
        let low = self.limits.pressure_min + self.limits.pressure_recovery_margin;
        let high = self.limits.pressure_max - self.limits.pressure_recovery_margin;
        warn!(
            target: "fedaq",
            linac = %self.linac,
            pressure,
            low,
            high,
            "LHe pressure out of spec, waiting for recovery"
        );
        let start = Instant::now();
        while out_of_spec {
            if start.elapsed() >= self.recovery.timeout() {
                warn!(target: "fedaq", linac = %self.linac, pressure, "LHe pressure unrecovered");
                return Err(DaqError::timeout("LHe pressure recovery", start.elapsed()));
            }
            std::thread::sleep(self.recovery.poll());
            (out_of_spec, pressure) = self.check_pressure(Some(low), Some(high))?;
        }
        info!(target: "fedaq", linac = %self.linac, pressure, "LHe pressure recovered");
        Ok(())
    }

    /// Wait for the heater margin to rebuild above the recovery point
    /// (`min + recovery_margin`).  Times out after the recovery window.
    pub fn wait_for_heater_recovery(&self) -> DaqResult<()> {
        let (mut too_low, mut margin) = self.check_heater_margin(None)?;
        if !too_low {
            return Ok(());
        }
        let recovery_point = self.limits.heater_margin_min + self.limits.heater_recovery_margin;
        warn!(
            target: "fedaq",
            linac = %self.linac,
            margin,
            recovery_point,
            "heater capacity margin too low, waiting for recovery"
        );
        let start = Instant::now();
        while too_low {
            if start.elapsed() >= self.recovery.timeout() {
                warn!(target: "fedaq", linac = %self.linac, margin, "heater margin unrecovered");
                return Err(DaqError::timeout("heater margin recovery", start.elapsed()));
            }
            std::thread::sleep(self.recovery.poll());
            (too_low, margin) = self.check_heater_margin(Some(recovery_point))?;
        }
        info!(target: "fedaq", linac = %self.linac, margin, "heater margin recovered");
        Ok(())
    }
}

/// One linac: its cryo guard, its zones, and a flat cavity index.
pub struct Linac {
    name: String,
    guard: Arc<LinacGuard>,
    zones: BTreeMap<String, Arc<Zone>>,
    cavities: BTreeMap<String, Arc<Cavity>>,
}

impl Linac {
    #[must_use]
    pub fn new(name: impl Into<String>, guard: Arc<LinacGuard>, zones: Vec<Arc<Zone>>) -> Self {
        let mut zone_map = BTreeMap::new();
        let mut cavities = BTreeMap::new();
        for zone in zones {
            for cavity in zone.cavities() {
                cavities.insert(cavity.name().to_owned(), Arc::clone(cavity));
            }
            zone_map.insert(zone.name().to_owned(), zone);
        }
        Self {
            name: name.into(),
            guard,
            zones: zone_map,
            cavities,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<LinacGuard> {
        &self.guard
    }

    #[must_use]
    pub fn zones(&self) -> &BTreeMap<String, Arc<Zone>> {
        &self.zones
    }

    #[must_use]
    pub fn zone(&self, name: &str) -> Option<&Arc<Zone>> {
        self.zones.get(name)
    }

    #[must_use]
    pub fn cavities(&self) -> &BTreeMap<String, Arc<Cavity>> {
        &self.cavities
    }

    #[must_use]
    pub fn cavity(&self, name: &str) -> Option<&Arc<Cavity>> {
        self.cavities.get(name)
    }

    /// Cavities that can actually take a gradient: not bypassed and with a
    /// usable ceiling.
    #[must_use]
    pub fn usable_cavities(&self) -> Vec<Arc<Cavity>> {
        self.cavities
            .values()
            .filter(|c| !c.is_bypassed())
            .cloned()
            .collect()
    }

    /// Restore every cavity's phase setpoint to the value latched at startup.
    /// Best effort: failures are logged and the sweep continues, but the first
    /// error is reported so the caller knows the restore was incomplete.
    pub fn restore_psets(&self) -> DaqResult<()> {
        let mut first_error = None;
        for cavity in self.cavities.values() {
            if let Err(err) = cavity.restore_pset() {
                warn!(
                    target: "fedaq",
                    cavity = %cavity.name(),
                    error = %err,
                    "failed to restore phase setpoint"
                );
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedaq_core::config::DaqConfig;
    use fedaq_core::signal::SimChannel;

    fn guard_with(pressure: f64, margin: f64, autoheat: f64) -> LinacGuard {
        let config = DaqConfig::default();
        LinacGuard::new(
            "NorthLinac",
            SimChannel::online("CPI4107B", pressure),
            SimChannel::online("CAPHTRMGN", margin),
            SimChannel::online("CAPBON", autoheat),
            config.linac.clone(),
            config.recovery.clone(),
        )
    }

    #[test]
    fn pressure_band_is_inclusive_of_the_edges() {
        let guard = guard_with(0.038, 5.0, 1.0);
        let (out, _) = guard.check_pressure(None, None).unwrap();
        assert!(!out);

        let guard = guard_with(0.042, 5.0, 1.0);
        let (out, _) = guard.check_pressure(None, None).unwrap();
        assert!(!out, "pressure exactly at the max is in spec");

        let guard = guard_with(0.0421, 5.0, 1.0);
        let (out, value) = guard.check_pressure(None, None).unwrap();
        assert!(out);
        assert!((value - 0.0421).abs() < 1e-9);
    }

    #[test]
    fn heater_margin_at_the_floor_is_too_low() {
        let guard = guard_with(0.038, 1.0, 1.0);
        let (too_low, _) = guard.check_heater_margin(None).unwrap();
        assert!(too_low);

        let guard = guard_with(0.038, 1.5, 1.0);
        let (too_low, _) = guard.check_heater_margin(None).unwrap();
        assert!(!too_low);
    }

    #[test]
    fn autoheat_must_read_exactly_one() {
        assert!(guard_with(0.038, 5.0, 1.0).autoheat_enabled().unwrap());
        assert!(!guard_with(0.038, 5.0, 0.0).autoheat_enabled().unwrap());
        assert!(!guard_with(0.038, 5.0, 2.0).autoheat_enabled().unwrap());
    }

    #[test]
    fn heater_recovery_requires_the_rebuilt_margin() {
        let mut config = DaqConfig::default();
        config.recovery.timeout_s = 0.5;
        config.recovery.poll_ms = 2;
        let margin = SimChannel::online("CAPHTRMGN", 0.5);
        let guard = LinacGuard::new(
            "NorthLinac",
            SimChannel::online("CPI4107B", 0.038),
            margin.clone(),
            SimChannel::online("CAPBON", 1.0),
            config.linac.clone(),
            config.recovery.clone(),
        );

        let handle = {
            let margin = margin.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                // above min but below min + recovery_margin: still waiting
                margin.set_value(2.0);
                std::thread::sleep(std::time::Duration::from_millis(10));
                margin.set_value(6.0);
            })
        };
        guard.wait_for_heater_recovery().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pressure_recovery_times_out() {
        let mut config = DaqConfig::default();
        config.recovery.timeout_s = 0.03;
        config.recovery.poll_ms = 5;
        let guard = LinacGuard::new(
            "NorthLinac",
            SimChannel::online("CPI4107B", 0.050),
            SimChannel::online("CAPHTRMGN", 5.0),
            SimChannel::online("CAPBON", 1.0),
            config.linac.clone(),
            config.recovery.clone(),
        );
        let err = guard.wait_for_pressure_recovery().unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
    }
}
