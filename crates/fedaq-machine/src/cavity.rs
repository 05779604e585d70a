//! A single SRF cavity and its gradient-change state machine.
//!
//! Every gradient move here is deliberately slow.  Requests are validated
//! against the cavity's operational envelope, then walked toward the target in
//! small steps, and each step is gated on the tuner, the zone's JT valve, the
//! linac pressure, and the heater capacity margin.  The interlock aggregator
//! is consulted during every settle so a fault discovered mid-move stops the
//! move.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use fedaq_core::config::{DaqConfig, FamilyParams, RampConfig};
use fedaq_core::decision::DecisionPort;
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::outcome::WaitDecision;
use fedaq_core::signal::{SignalLink, wait_for_all};

use fedaq_interlock::InterlockAggregator;

use crate::family::Family;
use crate::linac::LinacGuard;
use crate::zone::ZoneGuard;

/// Largest move a single set may make without `force`, MV/m.  Slightly above
/// 1.0 so a nominal one-unit step survives floating point noise.
pub const MAX_SINGLE_STEP: f64 = 1.001;

/// Slack used when a request lands just above the ceiling from accumulated
/// rounding.  Anything within this of the ceiling is treated as the ceiling.
const CEILING_SLACK: f64 = 0.0001;

const RAMP_START_POLL: Duration = Duration::from_millis(50);
const RAMP_POLL: Duration = Duration::from_millis(100);
const TUNER_POLL: Duration = Duration::from_millis(50);

/// The control channels backing one cavity.
///
/// `drvh` is the EPICS drive-high limit on the setpoint; controllers without a
/// readable one fall back to the operational ceiling alone.  `stat1` carries
/// the ramp status bit on families that report one.  `watchers` are channels
/// monitored purely through interlock hooks (FSD inputs, tuner mode).
pub struct CavityChannels {
    pub gset: Arc<dyn SignalLink>,
    pub gmes: Arc<dyn SignalLink>,
    pub pset: Arc<dyn SignalLink>,
    pub odvh: Arc<dyn SignalLink>,
    pub drvh: Option<Arc<dyn SignalLink>>,
    pub rf_on: Arc<dyn SignalLink>,
    pub stat1: Option<Arc<dyn SignalLink>>,
    pub detune: Arc<dyn SignalLink>,
    pub detune_limit: Arc<dyn SignalLink>,
    pub watchers: Vec<Arc<dyn SignalLink>>,
}

impl CavityChannels {
    /// Every channel this cavity talks to, for connection waits.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn SignalLink>> {
        let mut list = vec![
            Arc::clone(&self.gset),
            Arc::clone(&self.gmes),
            Arc::clone(&self.pset),
            Arc::clone(&self.odvh),
            Arc::clone(&self.rf_on),
            Arc::clone(&self.detune),
            Arc::clone(&self.detune_limit),
        ];
        if let Some(drvh) = &self.drvh {
            list.push(Arc::clone(drvh));
        }
        if let Some(stat1) = &self.stat1 {
            list.push(Arc::clone(stat1));
        }
        list.extend(self.watchers.iter().cloned());
        list
    }
}

/// Static description of a cavity, from the inventory.
#[derive(Debug, Clone)]
pub struct CavitySpec {
    /// Control-system name, e.g. `1L22-3`.  The digit after the dash is the
    /// cavity's position in its cryomodule.
    pub name: String,
    /// EPICS channel prefix, e.g. `R1M3`.
    pub epics_name: String,
    pub zone: String,
    /// Cryomodule style, e.g. `C100`.  Decides the shunt impedance.
    pub cavity_type: String,
    /// Active length, meters.
    pub length: f64,
    pub q0: f64,
    pub bypassed: bool,
    pub tuner_bad: bool,
    /// Operator-requested ceiling, clamped to the drive high limit.
    pub gset_max_requested: Option<f64>,
    /// Controller firmware year, where the family reports one.
    pub firmware: Option<f64>,
}

/// Knobs for one gradient move.
#[derive(Debug, Clone)]
pub struct RampOptions {
    /// Cryo settle wait after the move completes.
    pub settle_time: Duration,
    /// Watch for controller-driven ramping after each step.
    pub wait_for_ramp: bool,
    /// How long a controller ramp may run before consulting the operator.
    pub ramp_timeout: Duration,
    /// Permit moves larger than [`MAX_SINGLE_STEP`].
    pub force: bool,
    /// GSET/GMES differences below this are measurement noise.
    pub gradient_epsilon: f64,
}

impl RampOptions {
    #[must_use]
    pub fn from_config(ramp: &RampConfig) -> Self {
        Self {
            settle_time: ramp.settle_time(),
            wait_for_ramp: true,
            ramp_timeout: ramp.ramp_timeout(),
            force: false,
            gradient_epsilon: ramp.gradient_epsilon,
        }
    }
}

/// One cavity: identity, latched startup state, channels, and the guards it
/// must satisfy before changing gradient.
pub struct Cavity {
    spec: CavitySpec,
    family: Family,
    params: FamilyParams,
    ramp: RampConfig,
    channels: CavityChannels,
    zone_guard: Arc<ZoneGuard>,
    linac_guard: Arc<LinacGuard>,
    interlocks: Arc<InterlockAggregator>,
    cavity_number: u8,
    shunt_impedance: f64,
    gset_min: f64,
    // Latched by initialize() once channels are connected.
    gset_init: f64,
    pset_init: f64,
    odvh_value: f64,
    bypassed_eff: bool,
    gset_max: f64,
}

impl Cavity {
    pub fn new(
        spec: CavitySpec,
        family: Family,
        channels: CavityChannels,
        config: &DaqConfig,
        zone_guard: Arc<ZoneGuard>,
        linac_guard: Arc<LinacGuard>,
        interlocks: Arc<InterlockAggregator>,
    ) -> DaqResult<Self> {
        let cavity_number = cavity_number_from_name(&spec.name)?;
        let params = family.params(&config.family).clone();
        let shunt_impedance = shunt_impedance_for(&spec.cavity_type, &spec.name);
        let gset_min = params.min_stable_gradient;
        Ok(Self {
            spec,
            family,
            params,
            ramp: config.ramp.clone(),
            channels,
            zone_guard,
            linac_guard,
            interlocks,
            cavity_number,
            shunt_impedance,
            gset_min,
            gset_init: 0.0,
            pset_init: 0.0,
            odvh_value: 0.0,
            bypassed_eff: true,
            gset_max: 0.0,
        })
    }

    /// Wait for every channel to connect, then latch the startup state the
    /// rest of the object depends on.  Must run before the cavity is shared.
    pub fn initialize(&mut self, timeout: Duration) -> DaqResult<()> {
        wait_for_all(&self.channels.all(), timeout)?;

        self.gset_init = self.channels.gset.read()?;
        self.pset_init = self.channels.pset.read()?;
        self.odvh_value = self.channels.odvh.read()?;

        // A zero setpoint or a zero drive limit means the cavity is off no
        // matter what the inventory says.
        self.bypassed_eff = self.spec.bypassed || self.gset_init == 0.0 || self.odvh_value == 0.0;
        if self.bypassed_eff && !self.spec.bypassed {
            info!(
                target: "fedaq",
                cavity = %self.spec.name,
                gset_init = self.gset_init,
                odvh = self.odvh_value,
                "treating cavity as bypassed"
            );
        }

        self.update_gset_max(self.spec.gset_max_requested)?;
        Ok(())
    }

    /// Resolve the operational ceiling from a request, the drive high limit,
    /// and ODVH.  `None` means "as high as ODVH allows".
    pub fn update_gset_max(&mut self, requested: Option<f64>) -> DaqResult<f64> {
        let drvh = match &self.channels.drvh {
            Some(ch) => Some(ch.read()?),
            None => None,
        };
        self.gset_max = match requested {
            None => self.odvh_value,
            Some(req) => match drvh {
                Some(limit) if req > limit => {
                    warn!(
                        target: "fedaq",
                        cavity = %self.spec.name,
                        requested = req,
                        drvh = limit,
                        "requested ceiling above drive high limit, clamping"
                    );
                    limit
                }
                _ => req,
            },
        };
        Ok(self.gset_max)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn epics_name(&self) -> &str {
        &self.spec.epics_name
    }

    #[must_use]
    pub fn zone_name(&self) -> &str {
        &self.spec.zone
    }

    #[must_use]
    pub fn family(&self) -> Family {
        self.family
    }

    #[must_use]
    pub fn cavity_number(&self) -> u8 {
        self.cavity_number
    }

    #[must_use]
    pub fn is_bypassed(&self) -> bool {
        self.bypassed_eff
    }

    #[must_use]
    pub fn tuner_bad(&self) -> bool {
        self.spec.tuner_bad
    }

    #[must_use]
    pub fn firmware(&self) -> Option<f64> {
        self.spec.firmware
    }

    #[must_use]
    pub fn gset_init(&self) -> f64 {
        self.gset_init
    }

    #[must_use]
    pub fn pset_init(&self) -> f64 {
        self.pset_init
    }

    #[must_use]
    pub fn gset_min(&self) -> f64 {
        self.gset_min
    }

    #[must_use]
    pub fn gset_max(&self) -> f64 {
        self.gset_max
    }

    #[must_use]
    pub fn channels(&self) -> &CavityChannels {
        &self.channels
    }

    #[must_use]
    pub fn interlocks(&self) -> &Arc<InterlockAggregator> {
        &self.interlocks
    }

    pub fn is_rf_on(&self) -> DaqResult<bool> {
        Ok(self.channels.rf_on.read()? == 1.0)
    }

    /// Is the controller actively ramping the gradient?  Families with a
    /// status word report it on a bit; the rest infer it from GMES lagging
    /// GSET by more than the family tolerance.  Errors if RF is off, since
    /// neither reading means anything then.
    pub fn is_gradient_ramping(&self) -> DaqResult<bool> {
        if !self.is_rf_on()? {
            return Err(DaqError::RfOff {
                cavity: self.spec.name.clone(),
            });
        }
        if let Some(bit) = self.params.ramp_status_bit
            && let Some(stat1) = &self.channels.stat1
        {
            let word = stat1.read()? as u64;
            return Ok(word & (1 << bit) != 0);
        }
        let gmes = self.channels.gmes.read()?;
        let gset = self.channels.gset.read()?;
        Ok((gmes - gset).abs() > self.params.gmes_ramp_tolerance)
    }

    /// Has the detune passed the point where the tuner must run?  The tuners
    /// engage at the limit and run the detune down further, so the recovery
    /// check uses the family margin while the engagement check uses zero.
    pub fn is_tuning_required(&self, margin: Option<f64>) -> DaqResult<bool> {
        let margin = margin.unwrap_or(self.params.tuner_recovery_margin);
        let detune = self.channels.detune.read()?;
        let limit = self.channels.detune_limit.read()?;
        Ok(detune.abs() > limit - margin)
    }

    /// Wait for the tuner to bring the cavity back inside its detune band.
    /// On timeout the port is consulted; KeepWaiting restarts the clock.
    pub fn wait_for_tuning(&self, port: Option<&dyn DecisionPort>) -> DaqResult<()> {
        if !self.is_tuning_required(Some(0.0))? {
            return Ok(());
        }
        let timeout = self.params.tuner_timeout();
        info!(
            target: "fedaq",
            cavity = %self.spec.name,
            timeout_s = timeout.as_secs_f64(),
            "waiting for tuner"
        );
        let mut start = Instant::now();
        while self.is_tuning_required(None)? {
            std::thread::sleep(TUNER_POLL);
            if start.elapsed() > timeout {
                warn!(target: "fedaq", cavity = %self.spec.name, "tuner is taking a long time");
                let prompt = format!(
                    "waited {}s for {} to tune, keep waiting?",
                    timeout.as_secs_f64(),
                    self.spec.name
                );
                match port {
                    Some(port) if port.on_wait_expired(&prompt) == WaitDecision::KeepWaiting => {
                        info!(target: "fedaq", cavity = %self.spec.name, "continuing tuner wait");
                        start = Instant::now();
                    }
                    Some(_) => {
                        return Err(DaqError::Aborted {
                            phase: "tuner wait".into(),
                            reason: format!("operator stopped waiting on {}", self.spec.name),
                        });
                    }
                    None => {
                        return Err(DaqError::timeout(
                            format!("tuner on {}", self.spec.name),
                            start.elapsed(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Dissipated heat at `gradient` (or the current setpoint), watts.
    pub fn calculate_heat(&self, gradient: Option<f64>) -> DaqResult<f64> {
        let g = match gradient {
            Some(g) => g,
            None => self.channels.gset.read()?,
        };
        // gradient is MV/m and the formula wants V/m, hence 1e12 on g^2
        Ok(g * g * self.spec.length * 1e12 / (self.shunt_impedance * self.spec.q0))
    }

    /// Set the gradient, walking there in family-sized steps with safety
    /// checks between steps.  Requests a hair above the ceiling are snapped
    /// to it, everything else out of envelope is rejected.
    pub fn set_gradient(
        &self,
        gset: f64,
        opts: &RampOptions,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        // The current setpoint is only for the log line; a transient read
        // failure must not sink the move before the retrying reads run.
        let from = self.channels.gset.read().unwrap_or(f64::NAN);
        info!(target: "fedaq", cavity = %self.spec.name, from, gset, "setting gradient");

        let mut gset = gset;
        if gset > self.gset_max && (gset - CEILING_SLACK) < self.gset_max {
            info!(
                target: "fedaq",
                cavity = %self.spec.name,
                gset_max = self.gset_max,
                "snapping request to ceiling, likely rounding error"
            );
            gset = self.gset_max;
        }

        self.validate_request(gset, opts.force)?;

        let wait_for_ramp =
            self.family
                .waits_for_external_ramp(&self.params, self.spec.firmware, opts.wait_for_ramp);
        self.do_ramping(gset, wait_for_ramp, opts, port)
    }

    /// Move to `gset` in `step_size` chunks (default 1 MV/m), calling
    /// [`Self::set_gradient`] for each chunk so every chunk is validated and
    /// itself ramped gently.
    pub fn walk_gradient(
        &self,
        gset: f64,
        step_size: Option<f64>,
        wait_interval: Option<Duration>,
        opts: &RampOptions,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        let step_size = step_size.unwrap_or(1.0);
        let wait_interval = wait_interval.unwrap_or(Duration::ZERO);

        let (step_dir, mut actual) = self.step_direction(gset)?;

        if gset > self.gset_max {
            return Err(DaqError::Validation {
                cavity: self.spec.name.clone(),
                reason: format!(
                    "requested gradient {gset} above the operational ceiling {}",
                    self.gset_max
                ),
            });
        }

        info!(
            target: "fedaq",
            cavity = %self.spec.name,
            from = actual,
            to = gset,
            step_size,
            "walking gradient"
        );

        while (gset - actual).abs() > step_size {
            let next = actual + step_dir * step_size;
            self.set_gradient(next, opts, port)?;
            if !wait_interval.is_zero() {
                std::thread::sleep(wait_interval);
            }
            actual = self.channels.gset.read_fresh()?;
        }
        self.set_gradient(gset, opts, port)
    }

    /// Walk back to the startup gradient, if we are not already there.
    pub fn restore_gset(
        &self,
        opts: &RampOptions,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        if self.channels.gset.read()? != self.gset_init {
            self.walk_gradient(self.gset_init, None, None, opts, port)?;
        }
        Ok(())
    }

    /// Put the phase setpoint back to its startup value.
    pub fn restore_pset(&self) -> DaqResult<()> {
        self.channels.pset.write_and_wait(self.pset_init)
    }

    fn validate_request(&self, gset: f64, force: bool) -> DaqResult<()> {
        let reject = |reason: String| {
            Err(DaqError::Validation {
                cavity: self.spec.name.clone(),
                reason,
            })
        };
        if !self.linac_guard.autoheat_enabled()? {
            return reject("cannot change gradients while autoheat is disabled".into());
        }
        if self.spec.tuner_bad {
            return reject("cavity has a bad tuner".into());
        }
        if gset != 0.0 && self.bypassed_eff {
            return reject(format!(
                "cannot turn on a bypassed cavity (gset_init={}, bypassed={})",
                self.gset_init, self.spec.bypassed
            ));
        }
        if gset != 0.0 && gset < self.gset_min {
            return reject(format!(
                "requested gradient {gset} below the stable minimum {}",
                self.gset_min
            ));
        }
        if gset > self.gset_max {
            return reject(format!(
                "requested gradient {gset} above the operational ceiling {}",
                self.gset_max
            ));
        }
        let current = self.channels.gset.read_fresh()?;
        if !force && (gset - current).abs() > MAX_SINGLE_STEP {
            return reject(format!(
                "cannot move more than 1 MV/m at a time (requested {gset}, current {current})"
            ));
        }
        Ok(())
    }

    /// Which way the move goes, and the current setpoint.  Transient read
    /// failures on the setpoint resolve themselves given a little time, so
    /// this waits under interlock supervision and retries rather than failing.
    fn step_direction(&self, gset: f64) -> DaqResult<(f64, f64)> {
        loop {
            match self.channels.gset.read_fresh() {
                Ok(actual) => {
                    let dir = if gset >= actual { 1.0 } else { -1.0 };
                    return Ok((dir, actual));
                }
                Err(err) => {
                    warn!(
                        target: "fedaq",
                        cavity = %self.spec.name,
                        error = %err,
                        wait_s = self.ramp.read_retry_wait_s,
                        "setpoint read failed, waiting before retry"
                    );
                    self.interlocks
                        .monitor(Duration::from_secs_f64(self.ramp.read_retry_wait_s), None)?;
                }
            }
        }
    }

    fn ramp_checks(&self, port: Option<&dyn DecisionPort>) -> DaqResult<()> {
        self.wait_for_tuning(port)?;
        self.zone_guard.wait_for_recovery()?;
        self.linac_guard.wait_for_pressure_recovery()?;
        self.linac_guard.wait_for_heater_recovery()
    }

    /// Walk toward `gset` in family step sizes, pausing between steps when
    /// the tuner or the cryo plant needs time.  Holds the full settle only
    /// after the final step.
    fn do_ramping(
        &self,
        gset: f64,
        wait_for_ramp: bool,
        opts: &RampOptions,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        let (step_dir, mut actual) = self.step_direction(gset)?;

        while (gset - actual).abs() > self.params.step_size {
            self.ramp_checks(port)?;
            let next = actual + step_dir * self.params.step_size;
            self.apply_step(next, Duration::ZERO, wait_for_ramp, opts, port)?;
            actual = self.channels.gset.read_fresh()?;
            let pause = self.params.step_interval();
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }

        self.ramp_checks(port)?;
        self.apply_step(gset, opts.settle_time, wait_for_ramp, opts, port)
    }

    /// Write one setpoint, optionally watch the controller's own ramp run to
    /// completion, then hold the settle under interlock supervision.
    fn apply_step(
        &self,
        gset: f64,
        settle: Duration,
        wait_for_ramp: bool,
        opts: &RampOptions,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        self.channels.gset.write(gset)?;

        if wait_for_ramp {
            // The ramp status updates on a 1 Hz cycle, so give it just over a
            // second to show up.
            let mut ramp_started = false;
            let watch = Duration::from_secs_f64(self.ramp.ramp_watch_s);
            let start_watch = Instant::now();
            while start_watch.elapsed() <= watch {
                ramp_started = self.is_gradient_ramping()?;
                if ramp_started {
                    info!(target: "fedaq", cavity = %self.spec.name, "gradient is ramping");
                    break;
                }
                // Already at the target within noise means no ramp is coming.
                if (gset - self.channels.gmes.read()?).abs() < opts.gradient_epsilon {
                    break;
                }
                std::thread::sleep(RAMP_START_POLL);
            }

            if ramp_started {
                let mut start_ramp = Instant::now();
                while self.is_gradient_ramping()? {
                    std::thread::sleep(RAMP_POLL);
                    if start_ramp.elapsed() > opts.ramp_timeout {
                        warn!(target: "fedaq", cavity = %self.spec.name, "gradient ramp timed out");
                        let prompt = format!(
                            "waited {}s for {} to ramp, continue?",
                            opts.ramp_timeout.as_secs_f64(),
                            self.spec.name
                        );
                        match port {
                            Some(port)
                                if port.on_wait_expired(&prompt) == WaitDecision::KeepWaiting =>
                            {
                                start_ramp = Instant::now();
                            }
                            Some(_) => {
                                return Err(DaqError::Aborted {
                                    phase: "gradient ramp".into(),
                                    reason: format!(
                                        "operator stopped waiting on {}",
                                        self.spec.name
                                    ),
                                });
                            }
                            None => {
                                return Err(DaqError::timeout(
                                    format!("gradient ramp on {}", self.spec.name),
                                    start_ramp.elapsed(),
                                ));
                            }
                        }
                    }
                }
            }
        }

        if !settle.is_zero() {
            info!(
                target: "fedaq",
                cavity = %self.spec.name,
                settle_s = settle.as_secs_f64(),
                "waiting for cryo to adjust"
            );
        }
        self.interlocks.monitor(settle, None)
    }
}

/// Shunt impedance by cryomodule style, ohms.  Unknown styles get the
/// conservative legacy value.
#[must_use]
pub fn shunt_impedance_for(cavity_type: &str, name: &str) -> f64 {
    match cavity_type {
        "C100" => 1241.3,
        "C75" => 1049.0,
        "C25" | "C50" | "P1R" => 960.0,
        other => {
            warn!(
                target: "fedaq",
                cavity = %name,
                cavity_type = %other,
                "unknown cavity type, assuming legacy shunt impedance"
            );
            960.0
        }
    }
}

/// Cavity position within its cryomodule, from the `zone-number` name.
fn cavity_number_from_name(name: &str) -> DaqResult<u8> {
    let digits = name.rsplit('-').next().unwrap_or_default();
    digits
        .parse::<u8>()
        .ok()
        .filter(|n| (1..=8).contains(n))
        .ok_or_else(|| DaqError::Inventory {
            detail: format!("cavity name {name} does not end in a position 1-8"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedaq_core::config::DaqConfig;
    use fedaq_core::decision::Scripted;
    use fedaq_core::signal::SimChannel;

    struct Harness {
        cavity: Cavity,
        gset: Arc<SimChannel>,
        gmes: Arc<SimChannel>,
        pset: Arc<SimChannel>,
        detune: Arc<SimChannel>,
    }

    fn harness(gset_init: f64, odvh: f64) -> Harness {
        harness_with(gset_init, odvh, |_| {})
    }

    fn harness_with(gset_init: f64, odvh: f64, tweak: impl FnOnce(&mut CavitySpec)) -> Harness {
        let mut config = DaqConfig::default();
        // Fast-moving test values; the production defaults wait far too long.
        config.ramp.settle_time_s = 0.0;
        config.ramp.read_retry_wait_s = 0.01;
        config.recovery.timeout_s = 0.2;
        config.recovery.poll_ms = 2;
        for params in [
            &mut config.family.llrf1,
            &mut config.family.llrf2,
            &mut config.family.llrf3,
        ] {
            params.step_interval_s = 0.0;
        }

        let gset = SimChannel::online("R1M3GSET", gset_init);
        let gmes = SimChannel::online("R1M3GMES", gset_init);
        let pset = SimChannel::online("R1M3PSET", 14.5);
        let odvh_ch = SimChannel::online("R1M3ODVH", odvh);
        let drvh = SimChannel::online("R1M3GSET.DRVH", 25.0);
        let rf_on = SimChannel::online("R1M3RFONr", 1.0);
        let stat1 = SimChannel::online("R1M3STAT1", 0.0);
        let detune = SimChannel::online("R1M3CFQE", 0.0);
        let detune_limit = SimChannel::online("R1M3DETAHZHI", 25.0);

        let zone_guard = Arc::new(ZoneGuard::new(
            "1L22",
            SimChannel::online("R1XXJT.ORBV", 70.0),
            config.zone.clone(),
            config.recovery.clone(),
        ));
        let linac_guard = Arc::new(LinacGuard::new(
            "NorthLinac",
            SimChannel::online("CPI4107B", 0.038),
            SimChannel::online("CAPHTRMGN", 10.0),
            SimChannel::online("CAPBON", 1.0),
            config.linac.clone(),
            config.recovery.clone(),
        ));
        let interlocks = Arc::new(InterlockAggregator::new());

        let mut spec = CavitySpec {
            name: "1L22-3".into(),
            epics_name: "R1M3".into(),
            zone: "1L22".into(),
            cavity_type: "C100".into(),
            length: 0.7,
            q0: 6.0e9,
            bypassed: false,
            tuner_bad: false,
            gset_max_requested: None,
            firmware: Some(2022.0),
        };
        tweak(&mut spec);

        let channels = CavityChannels {
            gset: gset.clone(),
            gmes: gmes.clone(),
            pset: pset.clone(),
            odvh: odvh_ch,
            drvh: Some(drvh),
            rf_on,
            stat1: Some(stat1),
            detune: detune.clone(),
            detune_limit,
            watchers: Vec::new(),
        };

        let mut cavity = Cavity::new(
            spec,
            Family::Llrf2,
            channels,
            &config,
            zone_guard,
            linac_guard,
            interlocks,
        )
        .unwrap();
        cavity.initialize(Duration::from_millis(100)).unwrap();

        Harness {
            cavity,
            gset,
            gmes,
            pset,
            detune,
        }
    }

    fn quick_opts() -> RampOptions {
        RampOptions {
            settle_time: Duration::ZERO,
            wait_for_ramp: false,
            ramp_timeout: Duration::from_millis(50),
            force: false,
            gradient_epsilon: 0.05,
        }
    }

    #[test]
    fn ceiling_comes_from_odvh_when_nothing_requested() {
        let h = harness(8.0, 10.0);
        assert!((h.cavity.gset_max() - 10.0).abs() < f64::EPSILON);

        let err = h.cavity.set_gradient(11.0, &quick_opts(), None).unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
        assert!(h.gset.written_values().is_empty());
    }

    #[test]
    fn requested_ceiling_clamps_to_drive_high_limit() {
        let h = harness_with(8.0, 20.0, |spec| spec.gset_max_requested = Some(30.0));
        assert!((h.cavity.gset_max() - 25.0).abs() < f64::EPSILON);

        let h = harness_with(8.0, 20.0, |spec| spec.gset_max_requested = Some(12.0));
        assert!((h.cavity.gset_max() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn request_a_hair_above_the_ceiling_snaps_to_it() {
        let h = harness(9.5, 10.0);
        h.gmes.set_value(10.0);
        h.cavity
            .set_gradient(10.00005, &quick_opts(), None)
            .unwrap();
        let writes = h.gset.written_values();
        assert!((writes.last().copied().unwrap() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_step_limit_sits_just_above_one() {
        let h = harness(8.0, 20.0);
        h.gmes.set_value(9.0);
        h.cavity.set_gradient(9.0, &quick_opts(), None).unwrap();

        // The limit itself is still legal; anything past it is not.
        let h = harness(8.0, 20.0);
        h.gmes.set_value(8.0 + MAX_SINGLE_STEP);
        h.cavity
            .set_gradient(8.0 + MAX_SINGLE_STEP, &quick_opts(), None)
            .unwrap();

        let h = harness(8.0, 20.0);
        let err = h
            .cavity
            .set_gradient(9.0015, &quick_opts(), None)
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));

        let mut opts = quick_opts();
        opts.force = true;
        h.gmes.set_value(9.0015);
        h.cavity.set_gradient(9.0015, &opts, None).unwrap();
    }

    #[test]
    fn bypassed_cavity_rejects_nonzero_gradients() {
        let h = harness(0.0, 10.0);
        assert!(h.cavity.is_bypassed(), "zero startup gset bypasses");
        let err = h.cavity.set_gradient(6.0, &quick_opts(), None).unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
    }

    #[test]
    fn below_stable_minimum_is_rejected() {
        let h = harness(8.0, 10.0);
        let err = h.cavity.set_gradient(4.0, &quick_opts(), None).unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
    }

    #[test]
    fn ramping_steps_in_family_increments_and_lands_on_target() {
        let h = harness(8.0, 20.0);
        h.gmes.set_value(9.0);
        h.cavity.set_gradient(9.0, &quick_opts(), None).unwrap();
        let writes = h.gset.written_values();
        // 0.1 MV/m family steps from 8.0, final write exactly on target
        assert!(writes.len() >= 10);
        assert!((writes.last().copied().unwrap() - 9.0).abs() < f64::EPSILON);
        for pair in writes.windows(2) {
            assert!(pair[1] - pair[0] < 0.1 + 1e-9);
        }
    }

    #[test]
    fn walk_rejects_targets_above_the_ceiling_before_moving() {
        let h = harness(8.0, 10.0);
        let err = h
            .cavity
            .walk_gradient(12.0, None, None, &quick_opts(), None)
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
        assert!(h.gset.written_values().is_empty());
    }

    #[test]
    fn walk_and_restore_round_trip() {
        let mut opts = quick_opts();
        opts.force = true;
        let h = harness(8.0, 20.0);
        h.gmes.set_value(10.5);
        h.cavity
            .walk_gradient(10.5, Some(1.0), None, &opts, None)
            .unwrap();
        assert!((h.gset.written_values().last().copied().unwrap() - 10.5).abs() < f64::EPSILON);

        h.gmes.set_value(8.0);
        h.cavity.restore_gset(&opts, None).unwrap();
        assert!((h.gset.written_values().last().copied().unwrap() - 8.0).abs() < f64::EPSILON);

        // Already at the startup value: restore must not touch the channel.
        let before = h.gset.written_values().len();
        h.cavity.restore_gset(&opts, None).unwrap();
        assert_eq!(h.gset.written_values().len(), before);
    }

    #[test]
    fn restore_pset_is_idempotent() {
        let h = harness(8.0, 10.0);
        h.pset.set_value(20.0);
        h.cavity.restore_pset().unwrap();
        h.cavity.restore_pset().unwrap();
        assert_eq!(h.pset.written_values(), vec![14.5, 14.5]);
    }

    #[test]
    fn transient_setpoint_read_failures_resolve_with_a_retry() {
        let h = harness(8.0, 20.0);
        h.gmes.set_value(8.5);
        h.gset.fail_next_reads(1);
        h.cavity
            .walk_gradient(8.5, Some(1.0), None, &quick_opts(), None)
            .unwrap();
        assert!((h.gset.written_values().last().copied().unwrap() - 8.5).abs() < f64::EPSILON);
    }

    #[test]
    fn tuner_wait_honors_the_keep_waiting_decision() {
        // Without a decision port the wait times out.
        let mut bare = harness(8.0, 20.0);
        bare.detune.set_value(30.0);
        bare.cavity.params.tuner_timeout_s = 0.02;
        let err = bare.cavity.wait_for_tuning(None).unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));

        // A port that declines turns the timeout into an abort.
        let mut short = harness(8.0, 20.0);
        short.detune.set_value(30.0);
        short.cavity.params.tuner_timeout_s = 0.02;
        let port = Scripted::new();
        let err = short.cavity.wait_for_tuning(Some(&port)).unwrap_err();
        assert!(err.is_abort());

        // KeepWaiting restarts the clock; a background fix lets it finish.
        let mut keep = harness(8.0, 20.0);
        keep.detune.set_value(30.0);
        keep.cavity.params.tuner_timeout_s = 0.05;
        let port = Scripted::new();
        for _ in 0..10 {
            port.push_wait(WaitDecision::KeepWaiting);
        }
        let detune = keep.detune.clone();
        let fixer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            detune.set_value(0.0);
        });
        keep.cavity.wait_for_tuning(Some(&port)).unwrap();
        fixer.join().unwrap();
    }

    #[test]
    fn heat_follows_the_square_of_the_gradient() {
        let h = harness(8.0, 20.0);
        let at_8 = h.cavity.calculate_heat(None).unwrap();
        let at_16 = h.cavity.calculate_heat(Some(16.0)).unwrap();
        assert!((at_16 / at_8 - 4.0).abs() < 1e-9);

        // C100 at 8 MV/m over 0.7 m with Q0 6e9: 64 * 0.7e12 / (1241.3 * 6e9)
        let expected = 64.0 * 0.7e12 / (1241.3 * 6.0e9);
        assert!((at_8 - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_cavity_type_falls_back_to_legacy_impedance() {
        assert!((shunt_impedance_for("C999", "1L22-3") - 960.0).abs() < f64::EPSILON);
        assert!((shunt_impedance_for("C100", "1L22-3") - 1241.3).abs() < f64::EPSILON);
    }

    #[test]
    fn cavity_numbers_parse_from_the_name() {
        assert_eq!(cavity_number_from_name("1L22-3").unwrap(), 3);
        assert_eq!(cavity_number_from_name("2L07-8").unwrap(), 8);
        assert!(cavity_number_from_name("1L22").is_err());
        assert!(cavity_number_from_name("1L22-9").is_err());
    }
}
