//! Scan procedures built on the batch machinery.
//!
//! The workhorse is the random-sample random-offset scan: each round
//! perturbs a random subset of cavities by small random offsets, holds still
//! for the archiver, and rolls back.  Rounds whose proposal would swing a
//! cryomodule's heat load too far are skipped outright.  The simple scan and
//! the levelized walk move one cavity at a time instead.
//!
//! Every procedure restores the linac's phase setpoints on the way out, no
//! matter how the run ended.

use std::path::Path;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tracing::{error, info, warn};

use fedaq_core::config::DaqConfig;
use fedaq_core::decision::DecisionPort;
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_interlock::InterlockAggregator;
use fedaq_machine::{CAVITIES_PER_ZONE, Cavity, Linac, RampOptions};

use crate::datalog::{DataLog, SampleWindow};
use crate::saga::{SamplePlan, collect_with_rollback};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Hold still for the cryo settle window, then the averaging window, under
/// interlock supervision.  Returns the window timestamps for the data log.
/// A zero settle collapses to a single safety check.
pub fn settle_and_average(
    interlocks: &InterlockAggregator,
    settle_s: f64,
    avg_s: f64,
    port: Option<&dyn DecisionPort>,
) -> DaqResult<SampleWindow> {
    let (settle_start, settle_end);
    if settle_s > 0.0 {
        info!(target: "fedaq", settle_s, "waiting for cryo to settle");
        settle_start = Local::now();
        interlocks.monitor(Duration::from_secs_f64(settle_s), port)?;
        settle_end = Local::now();
    } else {
        interlocks.assert_safe(port)?;
        settle_start = Local::now();
        settle_end = settle_start;
    }

    info!(target: "fedaq", avg_s, "waiting for the archiver to collect data");
    let avg_start = settle_end;
    interlocks.monitor(Duration::from_secs_f64(avg_s), port)?;
    let avg_end = Local::now();

    Ok(SampleWindow {
        settle_start,
        settle_end,
        avg_start,
        avg_end,
        settle_s,
        avg_s,
    })
}

/// Knobs for [`run_random_sample_scan`].
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub n_samples: usize,
    /// Cavities perturbed per round.
    pub n_cavities: usize,
    pub settle_s: f64,
    pub avg_s: f64,
    /// Per-zone heat change budget, percent, either direction.
    pub max_zone_heat_percent: f64,
    /// Candidate gradient offsets, MV/m.  `None` uses the stock ±0.5..1.5 set.
    pub offsets: Option<Vec<f64>>,
}

impl ScanOptions {
    #[must_use]
    pub fn new(n_samples: usize, n_cavities: usize, avg_s: f64) -> Self {
        Self {
            n_samples,
            n_cavities,
            settle_s: 6.0,
            avg_s,
            max_zone_heat_percent: 10.0,
            offsets: None,
        }
    }
}

/// One sample's randomized gradient changes plus its per-zone heat proposals.
pub struct SampleDraw {
    pub plan: SamplePlan,
    /// Zone name to proposed per-position gradients (`None` = unchanged).
    pub zone_proposals: BTreeMap<String, Vec<Option<f64>>>,
}

/// Offsets of magnitude 0.5 to 1.5 MV/m in tenths.  Smaller steps disappear
/// into gradient noise, so they are excluded.
#[must_use]
pub fn default_offsets() -> Vec<f64> {
    let mut offsets: Vec<f64> = (-15..=-5).map(|i| f64::from(i) / 10.0).collect();
    offsets.extend((5..=15).map(|i| f64::from(i) / 10.0));
    offsets
}

/// Pick `n_cavities` at random and a random in-envelope offset for each.
/// A cavity with no valid offset stays where it is rather than shrinking the
/// sample.
pub fn choose_random_gradient_changes(
    population: &[Arc<Cavity>],
    n_cavities: usize,
    offsets: &[f64],
    rng: &mut impl Rng,
) -> DaqResult<SampleDraw> {
    if population.len() < n_cavities {
        return Err(DaqError::Inventory {
            detail: format!(
                "fewer cavities available ({}) than requested sample size ({n_cavities})",
                population.len()
            ),
        });
    }

    let picked = rand::seq::index::sample(rng, population.len(), n_cavities);
    let mut cavities: Vec<Arc<Cavity>> = picked
        .iter()
        .map(|i| Arc::clone(&population[i]))
        .collect();
    cavities.sort_by(|a, b| a.name().cmp(b.name()));

    let mut new_gsets = BTreeMap::new();
    let mut old_gsets = BTreeMap::new();
    let mut zone_proposals: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
    for cavity in &cavities {
        let current = cavity.channels().gset.read()?;
        let valid: Vec<f64> = offsets
            .iter()
            .copied()
            .filter(|off| {
                current + off > cavity.gset_min() && current + off < cavity.gset_max()
            })
            .collect();
        let offset = match valid.choose(rng) {
            Some(off) => *off,
            None => {
                info!(
                    target: "fedaq",
                    cavity = %cavity.name(),
                    current,
                    gset_min = cavity.gset_min(),
                    gset_max = cavity.gset_max(),
                    "no valid offsets, cavity unchanged"
                );
                0.0
            }
        };
        new_gsets.insert(cavity.name().to_string(), current + offset);
        old_gsets.insert(cavity.name().to_string(), current);

        let proposal = zone_proposals
            .entry(cavity.zone_name().to_string())
            .or_insert_with(|| vec![None; CAVITIES_PER_ZONE]);
        proposal[usize::from(cavity.cavity_number()) - 1] = Some(current + offset);
    }

    info!(
        target: "fedaq",
        cavities = %cavities.iter().map(|c| c.name()).collect::<Vec<_>>().join(","),
        "sample chosen"
    );

    Ok(SampleDraw {
        plan: SamplePlan {
            cavities,
            new_gsets,
            old_gsets,
        },
        zone_proposals,
    })
}

/// Put every phase setpoint back where startup found it.  Failures are
/// logged, never raised: this runs on the way out of a scan and must not
/// mask the scan's own result.
fn restore_psets_best_effort(linac: &Linac) {
    info!(target: "fedaq", linac = %linac.name(), "restoring phase setpoints");
    if let Err(err) = linac.restore_psets() {
        warn!(target: "fedaq", error = %err, "phase setpoint restore incomplete");
    }
}

/// Synthesize the settle window for a move whose settle already happened
/// inside the gradient set, then hold the averaging window.
fn post_ramp_window(
    settle_s: f64,
    avg_s: f64,
    interlocks: &InterlockAggregator,
    port: Option<&dyn DecisionPort>,
) -> DaqResult<SampleWindow> {
    let settle_end = Local::now();
    let settle_start = settle_end - TimeDelta::milliseconds((settle_s * 1000.0) as i64);

    info!(target: "fedaq", avg_s, "waiting for the archiver to collect data");
    let avg_start = Local::now();
    interlocks.monitor(Duration::from_secs_f64(avg_s), port)?;
    let avg_end = Local::now();

    Ok(SampleWindow {
        settle_start,
        settle_end,
        avg_start,
        avg_end,
        settle_s,
        avg_s,
    })
}

/// The random-sample random-offset gradient scan.
///
/// Each round draws a sample, gates it through every affected zone's heat
/// budget (over-budget rounds are skipped, not fatal), then runs the
/// apply/collect/rollback saga and appends the sample's window to the index.
/// Phase setpoints are restored however the run ends.
pub fn run_random_sample_scan(
    linac: &Linac,
    config: &DaqConfig,
    scan: &ScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
    rng: &mut impl Rng,
) -> DaqResult<()> {
    let result = sample_rounds(linac, config, scan, interlocks, port, data_file, rng);
    restore_psets_best_effort(linac);
    result
}

fn sample_rounds(
    linac: &Linac,
    config: &DaqConfig,
    scan: &ScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
    rng: &mut impl Rng,
) -> DaqResult<()> {
    info!(target: "fedaq", linac = %linac.name(), "starting random sample gradient scan");

    let population = linac.usable_cavities();
    let bypassed: Vec<String> = linac
        .cavities()
        .values()
        .filter(|c| c.is_bypassed())
        .map(|c| c.name().to_string())
        .collect();
    if population.len() < scan.n_cavities {
        return Err(DaqError::Inventory {
            detail: format!(
                "fewer cavities available ({}) than requested sample size ({})",
                population.len(),
                scan.n_cavities
            ),
        });
    }

    let offsets = scan.offsets.clone().unwrap_or_else(default_offsets);

    // Batch workers apply no settle of their own; the saga holds one common
    // settle after the whole batch lands.
    let mut opts = RampOptions::from_config(&config.ramp);
    opts.settle_time = Duration::ZERO;
    opts.force = true;

    let mut log = DataLog::append(data_file)?;
    let zone_names: Vec<&str> = linac.zones().keys().map(String::as_str).collect();
    log.write_header(&[
        ("type", "random_sample_gradient_scan".to_string()),
        ("active_zones", zone_names.join(",")),
        ("bypassed_cavities", bypassed.join(",")),
        (
            "gradient_delta_range",
            offsets
                .iter()
                .map(|o| format!("{o:.1}"))
                .collect::<Vec<_>>()
                .join(","),
        ),
    ])?;

    for round in 1..=scan.n_samples {
        info!(target: "fedaq", round, n_samples = scan.n_samples, "starting sample round");
        let draw = choose_random_gradient_changes(&population, scan.n_cavities, &offsets, rng)?;

        let mut skip = false;
        for (zone_name, proposal) in &draw.zone_proposals {
            let zone = linac.zone(zone_name).ok_or_else(|| DaqError::Inventory {
                detail: format!("sample references unknown zone {zone_name}"),
            })?;
            match zone.check_heat_change(proposal, scan.max_zone_heat_percent) {
                Ok(change) => {
                    info!(
                        target: "fedaq",
                        zone = %zone_name,
                        old_w = change.old_w,
                        new_w = change.new_w,
                        percent = change.percent,
                        "expected heat change ok"
                    );
                }
                Err(err) => {
                    error!(target: "fedaq", error = %err, "heat budget check failed");
                    skip = true;
                    break;
                }
            }
        }
        if skip {
            info!(target: "fedaq", round, "skipping sample round, heat change too large");
            continue;
        }

        match collect_with_rollback(
            &draw.plan,
            &opts,
            scan.settle_s,
            scan.avg_s,
            interlocks,
            port,
            &mut log,
        ) {
            Ok(_) => {}
            Err(err) if err.is_abort() => return Err(err),
            Err(err) => {
                error!(target: "fedaq", round, error = %err, "sample round failed");
                if port.confirm("restore cavities to their startup values?") {
                    let mut restore_opts = opts.clone();
                    restore_opts.settle_time = Duration::from_secs(1);
                    for cavity in &draw.plan.cavities {
                        info!(target: "fedaq", cavity = %cavity.name(), "restoring");
                        if let Err(err) = cavity.restore_pset() {
                            warn!(target: "fedaq", cavity = %cavity.name(), error = %err,
                                  "phase restore failed");
                        }
                        if let Err(err) = cavity.restore_gset(&restore_opts, Some(port)) {
                            warn!(target: "fedaq", cavity = %cavity.name(), error = %err,
                                  "gradient restore failed");
                        }
                    }
                }
                if !port.confirm("continue with the next sample round?") {
                    return Err(DaqError::Aborted {
                        phase: "scan".into(),
                        reason: format!("operator stopped the scan after: {err}"),
                    });
                }
            }
        }
    }

    info!(target: "fedaq", "scan complete");
    Ok(())
}

/// Knobs for [`run_simple_gradient_scan`].
#[derive(Debug, Clone)]
pub struct SimpleScanOptions {
    pub avg_s: f64,
    pub settle_s: f64,
    /// Step size in MV/m, applied both above and below the starting point.
    pub step_size: f64,
    /// Steps taken in each direction before the cavity goes home.
    pub max_cavity_steps: usize,
}

impl SimpleScanOptions {
    #[must_use]
    pub fn new(avg_s: f64) -> Self {
        Self {
            avg_s,
            settle_s: 6.0,
            step_size: 1.0,
            max_cavity_steps: 2,
        }
    }
}

/// One cavity at a time: step up from the starting gradient, come home,
/// step down, come home, move on.  A step that would cross the cavity's
/// envelope is clipped to the envelope edge and ends that direction.
/// Phase setpoints are restored however the run ends.
pub fn run_simple_gradient_scan(
    linac: &Linac,
    config: &DaqConfig,
    scan: &SimpleScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
) -> DaqResult<()> {
    let result = simple_scan_rounds(linac, config, scan, interlocks, port, data_file);
    restore_psets_best_effort(linac);
    result
}

fn simple_scan_rounds(
    linac: &Linac,
    config: &DaqConfig,
    scan: &SimpleScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
) -> DaqResult<()> {
    if scan.step_size == 0.0 {
        return Err(DaqError::InvalidConfig {
            field: "scan.step_size".into(),
            value: scan.step_size.to_string(),
            reason: "step size must be non-zero".into(),
        });
    }
    if scan.max_cavity_steps == 0 {
        return Err(DaqError::InvalidConfig {
            field: "scan.max_cavity_steps".into(),
            value: scan.max_cavity_steps.to_string(),
            reason: "at least one step per direction is required".into(),
        });
    }

    info!(target: "fedaq", linac = %linac.name(), "starting simple gradient scan");

    // Steps here may exceed the one-unit limit, matching operator practice
    // for this scan.
    let mut opts = RampOptions::from_config(&config.ramp);
    opts.settle_time = Duration::from_secs_f64(scan.settle_s);
    opts.wait_for_ramp = true;
    opts.force = true;
    // Going home walks gently; never longer than the scan's own settle.
    let mut restore_opts = opts.clone();
    restore_opts.settle_time = Duration::from_secs_f64(scan.settle_s.min(1.0));

    let mut log = DataLog::append(data_file)?;
    let zone_names: Vec<&str> = linac.zones().keys().map(String::as_str).collect();
    log.write_header(&[
        ("type", "simple_gradient_scan".to_string()),
        ("active_zones", zone_names.join(",")),
        ("step_size", scan.step_size.to_string()),
    ])?;

    for cavity in linac.cavities().values() {
        if cavity.is_bypassed() {
            info!(target: "fedaq", cavity = %cavity.name(), "effectively bypassed, skipping");
            continue;
        }
        let start = cavity.channels().gset.read()?;
        info!(
            target: "fedaq",
            cavity = %cavity.name(),
            start,
            gset_min = cavity.gset_min(),
            gset_max = cavity.gset_max(),
            "scanning cavity"
        );

        // The upward pass samples the starting point first; the downward pass
        // starts fresh from home, so it does not.
        let mut up = vec![start];
        for i in 1..=scan.max_cavity_steps {
            let gradient = start + scan.step_size * i as f64;
            if gradient >= cavity.gset_max() {
                up.push(cavity.gset_max());
                break;
            }
            up.push(gradient);
        }
        let mut down = Vec::new();
        for i in 1..=scan.max_cavity_steps {
            let gradient = start - scan.step_size * i as f64;
            if gradient <= cavity.gset_min() {
                down.push(cavity.gset_min());
                break;
            }
            down.push(gradient);
        }

        for direction in [up, down] {
            for target in direction {
                if let Err(err) =
                    sample_at(cavity, target, &opts, scan.settle_s, scan.avg_s, interlocks, port, &mut log)
                {
                    if err.is_abort() {
                        return Err(err);
                    }
                    error!(target: "fedaq", cavity = %cavity.name(), error = %err, "scan step failed");
                    if !port.confirm("continue with the scan?") {
                        info!(target: "fedaq", cavity = %cavity.name(), "restoring gradient");
                        if let Err(err) = cavity.restore_gset(&restore_opts, Some(port)) {
                            warn!(target: "fedaq", cavity = %cavity.name(), error = %err,
                                  "gradient restore failed");
                        }
                        return Err(err);
                    }
                }
            }
            info!(target: "fedaq", cavity = %cavity.name(), "returning to the starting gradient");
            cavity.restore_gset(&restore_opts, Some(port))?;
        }
    }

    info!(target: "fedaq", "scan complete");
    Ok(())
}

/// Move one cavity, wait out the archiver, and log the sample.
fn sample_at(
    cavity: &Cavity,
    target: f64,
    opts: &RampOptions,
    settle_s: f64,
    avg_s: f64,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    log: &mut DataLog,
) -> DaqResult<()> {
    interlocks.assert_safe(Some(port))?;
    info!(target: "fedaq", cavity = %cavity.name(), gset = target, "stepping gradient");
    cavity.set_gradient(target, opts, Some(port))?;
    let window = post_ramp_window(settle_s, avg_s, interlocks, Some(port))?;
    log.write_row(
        &window,
        &[cavity.name().to_string()],
        &[cavity.epics_name().to_string()],
    )
}

/// Cryo needs this long to track a one-unit move, so the levelized walk will
/// not run with less.
pub const MIN_WALK_SETTLE_S: f64 = 6.0;

/// Knobs for [`run_levelized_walk_scan`].
#[derive(Debug, Clone)]
pub struct WalkScanOptions {
    /// Rounds of the walk.
    pub num_steps: usize,
    pub avg_s: f64,
    /// At least [`MIN_WALK_SETTLE_S`].
    pub settle_s: f64,
    /// Downward step per move, MV/m, at most 1.0.
    pub step_size: f64,
    /// Cavities stepped per round.  `None` steps them all.
    pub n_cavities: Option<usize>,
    /// Steps a single cavity may take over the whole walk.  `None` is
    /// unlimited.
    pub max_cavity_steps: Option<usize>,
}

impl WalkScanOptions {
    #[must_use]
    pub fn new(num_steps: usize, avg_s: f64) -> Self {
        Self {
            num_steps,
            avg_s,
            settle_s: MIN_WALK_SETTLE_S,
            step_size: 1.0,
            n_cavities: None,
            max_cavity_steps: None,
        }
    }
}

/// Pick this round's cavities in random order and charge each one a step.
/// Cavities that reach their step allowance leave the pool.
fn plan_walk_round(
    allowable: &mut Vec<String>,
    steps_taken: &mut BTreeMap<String, usize>,
    n_cavities: Option<usize>,
    max_cavity_steps: Option<usize>,
    rng: &mut impl Rng,
) -> Vec<String> {
    let mut order = allowable.clone();
    order.shuffle(rng);
    if let Some(n) = n_cavities {
        order.truncate(n.min(order.len()));
    }
    for name in &order {
        let count = steps_taken.entry(name.clone()).or_insert(0);
        *count += 1;
        if let Some(max) = max_cavity_steps
            && *count >= max
        {
            info!(target: "fedaq", cavity = %name, max, "taking its last allowed step");
            allowable.retain(|other| other != name);
        }
    }
    order
}

/// Walk a group of cavities down, one cavity at a time in a random order,
/// for `num_steps` rounds.  Gradients stay where the walk leaves them; only
/// phase setpoints are restored, however the run ends.
pub fn run_levelized_walk_scan(
    linac: &Linac,
    config: &DaqConfig,
    scan: &WalkScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
    rng: &mut impl Rng,
) -> DaqResult<()> {
    let result = walk_rounds(linac, config, scan, interlocks, port, data_file, rng);
    restore_psets_best_effort(linac);
    result
}

fn walk_rounds(
    linac: &Linac,
    config: &DaqConfig,
    scan: &WalkScanOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    data_file: &Path,
    rng: &mut impl Rng,
) -> DaqResult<()> {
    if scan.num_steps == 0 {
        return Err(DaqError::InvalidConfig {
            field: "scan.num_steps".into(),
            value: scan.num_steps.to_string(),
            reason: "at least one round is required".into(),
        });
    }
    if scan.step_size <= 0.0 || scan.step_size > 1.0 {
        return Err(DaqError::InvalidConfig {
            field: "scan.step_size".into(),
            value: scan.step_size.to_string(),
            reason: "only downward steps up to 1 MV/m are supported".into(),
        });
    }
    if scan.settle_s < MIN_WALK_SETTLE_S {
        return Err(DaqError::InvalidConfig {
            field: "scan.settle_s".into(),
            value: scan.settle_s.to_string(),
            reason: format!("cryo needs at least {MIN_WALK_SETTLE_S}s to track each step"),
        });
    }

    info!(target: "fedaq", linac = %linac.name(), "starting levelized walk gradient scan");

    let mut opts = RampOptions::from_config(&config.ramp);
    opts.settle_time = Duration::from_secs_f64(scan.settle_s);

    let mut log = DataLog::append(data_file)?;
    let zone_names: Vec<&str> = linac.zones().keys().map(String::as_str).collect();

    let mut allowable: Vec<String> = linac
        .usable_cavities()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let mut steps_taken = BTreeMap::new();

    for round in 1..=scan.num_steps {
        if allowable.is_empty() {
            info!(target: "fedaq", "every cavity has taken its allowed steps, stopping");
            return Ok(());
        }
        info!(target: "fedaq", round, num_steps = scan.num_steps, "starting walk round");
        log.write_header(&[
            ("type", "levelized_walk_gradient_scan".to_string()),
            ("active_zones", zone_names.join(",")),
            ("step_size", scan.step_size.to_string()),
        ])?;

        let chosen = plan_walk_round(
            &mut allowable,
            &mut steps_taken,
            scan.n_cavities,
            scan.max_cavity_steps,
            rng,
        );
        for name in &chosen {
            let cavity = linac.cavity(name).ok_or_else(|| DaqError::Inventory {
                detail: format!("walk references unknown cavity {name}"),
            })?;
            let current = cavity.channels().gset.read()?;
            let target = current - scan.step_size;
            info!(target: "fedaq", cavity = %name, current, gset = target, "stepping down");
            if let Err(err) =
                sample_at(cavity, target, &opts, scan.settle_s, scan.avg_s, interlocks, port, &mut log)
            {
                if err.is_abort() {
                    return Err(err);
                }
                error!(target: "fedaq", cavity = %name, error = %err, "walk step failed");
                if !port.confirm("continue with the walk?") {
                    return Err(err);
                }
            }
        }
    }

    info!(target: "fedaq", "walk complete");
    Ok(())
}
