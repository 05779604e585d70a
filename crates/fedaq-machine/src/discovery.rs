//! Building a [`Linac`] from inventory records.
//!
//! The inventory arrives already deserialized (CED-style static attributes);
//! this module turns it into live objects.  Channel creation goes through a
//! caller-supplied factory so tests inject simulators, and interlock hooks
//! are attached only after each cavity has latched its startup state, since
//! effectively-bypassed cavities are not monitored.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use fedaq_core::config::DaqConfig;
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::signal::SignalLink;

use fedaq_interlock::{InterlockAggregator, connection_hook, rf_on_hook, threshold_hook};

use crate::cavity::{Cavity, CavityChannels, CavitySpec};
use crate::family::Family;
use crate::linac::{Linac, LinacGuard};
use crate::zone::{Zone, ZoneGuard};

/// Produces a live channel for a name.  Tests hand in simulator factories.
pub type LinkFactory = dyn Fn(&str) -> Arc<dyn SignalLink> + Send + Sync;

#[derive(Debug, Clone, Deserialize)]
pub struct LinacRecord {
    pub name: String,
    pub pressure_channel: String,
    pub heater_margin_channel: String,
    pub autoheat_channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    /// Controls family, e.g. `"2.0"`.
    pub controls_type: String,
    pub jt_stroke_channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CavityRecord {
    pub name: String,
    pub epics_name: String,
    pub zone: String,
    pub cavity_type: Option<String>,
    pub length: Option<f64>,
    pub q0: Option<f64>,
    #[serde(default)]
    pub bypassed: bool,
    #[serde(default)]
    pub tuner_bad: bool,
    pub gset_max: Option<f64>,
    pub firmware: Option<f64>,
}

/// The full static description of one linac.
#[derive(Debug, Clone, Deserialize)]
pub struct Inventory {
    pub linac: LinacRecord,
    pub zones: Vec<ZoneRecord>,
    pub cavities: Vec<CavityRecord>,
}

impl Inventory {
    pub fn from_json_str(text: &str) -> DaqResult<Self> {
        serde_json::from_str(text).map_err(|err| DaqError::Inventory {
            detail: format!("malformed inventory: {err}"),
        })
    }

    pub fn load(path: &Path) -> DaqResult<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

/// Assembles guards, cavities, and zones into a [`Linac`].
pub struct LinacBuilder<'a> {
    config: &'a DaqConfig,
    interlocks: Arc<InterlockAggregator>,
    connect_timeout: Duration,
}

impl<'a> LinacBuilder<'a> {
    #[must_use]
    pub fn new(
        config: &'a DaqConfig,
        interlocks: Arc<InterlockAggregator>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            config,
            interlocks,
            connect_timeout,
        }
    }

    pub fn build(&self, inventory: &Inventory, links: &LinkFactory) -> DaqResult<Linac> {
        let linac_guard = self.build_linac_guard(&inventory.linac, links);

        let mut zone_families = BTreeMap::new();
        let mut zone_guards = BTreeMap::new();
        for record in &inventory.zones {
            let family = Family::from_controls_type(&record.controls_type)?;
            let guard = Arc::new(ZoneGuard::new(
                record.name.clone(),
                links(&record.jt_stroke_channel),
                self.config.zone.clone(),
                self.config.recovery.clone(),
            ));
            zone_families.insert(record.name.clone(), family);
            zone_guards.insert(record.name.clone(), guard);
        }

        let mut members: BTreeMap<String, Vec<Arc<Cavity>>> = BTreeMap::new();
        for record in &inventory.cavities {
            let Some(spec) = complete_record(record) else {
                warn!(
                    target: "fedaq",
                    cavity = %record.name,
                    "inventory record incomplete, skipping cavity"
                );
                continue;
            };
            let Some(family) = zone_families.get(&record.zone).copied() else {
                return Err(DaqError::Inventory {
                    detail: format!("cavity {} references unknown zone {}", record.name, record.zone),
                });
            };
            let zone_guard = Arc::clone(&zone_guards[&record.zone]);
            let cavity =
                self.build_cavity(spec, family, links, zone_guard, Arc::clone(&linac_guard))?;
            members.entry(record.zone.clone()).or_default().push(cavity);
        }

        let mut zones = Vec::new();
        for record in &inventory.zones {
            let cavities = members.remove(&record.name).unwrap_or_default();
            let zone = Zone::new(
                record.name.clone(),
                zone_families[&record.name],
                Arc::clone(&zone_guards[&record.name]),
                cavities,
            )?;
            zones.push(Arc::new(zone));
        }

        info!(
            target: "fedaq",
            linac = %inventory.linac.name,
            zones = zones.len(),
            "linac assembled"
        );
        Ok(Linac::new(inventory.linac.name.clone(), linac_guard, zones))
    }

    fn build_linac_guard(&self, record: &LinacRecord, links: &LinkFactory) -> Arc<LinacGuard> {
        let pressure = links(&record.pressure_channel);
        let heater_margin = links(&record.heater_margin_channel);
        let autoheat = links(&record.autoheat_channel);

        for channel in [&pressure, &heater_margin, &autoheat] {
            channel.add_connection_hook(connection_hook(Arc::clone(&self.interlocks)));
        }
        heater_margin.add_value_hook(threshold_hook(
            Arc::clone(&self.interlocks),
            Some(self.config.linac.heater_margin_min),
            None,
        ));
        // Autoheat must stay in automatic mode for the whole run.
        autoheat.add_value_hook(threshold_hook(
            Arc::clone(&self.interlocks),
            Some(1.0),
            Some(1.0),
        ));
        for channel in [&pressure, &heater_margin, &autoheat] {
            channel.fire_hooks();
        }

        Arc::new(LinacGuard::new(
            record.name.clone(),
            pressure,
            heater_margin,
            autoheat,
            self.config.linac.clone(),
            self.config.recovery.clone(),
        ))
    }

    fn build_cavity(
        &self,
        spec: CavitySpec,
        family: Family,
        links: &LinkFactory,
        zone_guard: Arc<ZoneGuard>,
        linac_guard: Arc<LinacGuard>,
    ) -> DaqResult<Arc<Cavity>> {
        let prefix = spec.epics_name.clone();
        let channel = |suffix: &str| links(&format!("{prefix}{suffix}"));

        let tuner_mode;
        let mut fsds: Vec<Arc<dyn SignalLink>> = Vec::new();
        let channels = match family {
            Family::Llrf1 => {
                tuner_mode = channel("TMODI");
                fsds.push(channel("STAT.B3"));
                fsds.push(channel("STAT.B4"));
                CavityChannels {
                    gset: channel("GSET"),
                    gmes: channel("GMES"),
                    pset: channel("PSET"),
                    odvh: channel("ODVH"),
                    drvh: Some(channel("GSET.DRVH")),
                    rf_on: channel("ACK1.B6"),
                    stat1: None,
                    detune: channel("TDETA"),
                    detune_limit: channel("TDETA.N"),
                    watchers: {
                        let mut w = fsds.clone();
                        w.push(Arc::clone(&tuner_mode));
                        w
                    },
                }
            }
            Family::Llrf2 => {
                tuner_mode = channel("TCMDbits.B7");
                fsds.push(channel("FBRIO"));
                CavityChannels {
                    gset: channel("GSET"),
                    gmes: channel("GMES"),
                    pset: channel("PSET"),
                    odvh: channel("ODVH"),
                    drvh: Some(channel("GSET.DRVH")),
                    rf_on: channel("RFONr"),
                    stat1: Some(channel("STAT1")),
                    detune: channel("CFQE"),
                    detune_limit: channel("DETAHZHI"),
                    watchers: {
                        let mut w = fsds.clone();
                        w.push(Arc::clone(&tuner_mode));
                        w
                    },
                }
            }
            Family::Llrf3 => {
                tuner_mode = channel("TCMDbits.B7");
                for bit in 0..8 {
                    fsds.push(channel(&format!("KFLTT.B{bit}")));
                }
                CavityChannels {
                    gset: channel("GSET"),
                    gmes: channel("GMES"),
                    pset: channel("PSET"),
                    odvh: channel("ODVH"),
                    drvh: Some(channel("GSET.DRVH")),
                    rf_on: channel("RFONr"),
                    stat1: Some(channel("STAT1")),
                    detune: channel("CFQE"),
                    detune_limit: channel("DETAHZHI"),
                    watchers: {
                        let mut w = fsds.clone();
                        w.push(Arc::clone(&tuner_mode));
                        w
                    },
                }
            }
        };

        let rf_on = Arc::clone(&channels.rf_on);
        let all = channels.all();

        let mut cavity = Cavity::new(
            spec,
            family,
            channels,
            self.config,
            zone_guard,
            linac_guard,
            Arc::clone(&self.interlocks),
        )?;
        cavity.initialize(self.connect_timeout)?;

        for link in &all {
            link.add_connection_hook(connection_hook(Arc::clone(&self.interlocks)));
        }
        // Faults on an effectively bypassed cavity are not our problem.
        if !cavity.is_bypassed() {
            rf_on.add_value_hook(rf_on_hook(Arc::clone(&self.interlocks), cavity.name()));
            let params = family.params(&self.config.family);
            let fsd_ok = family.fsd_ok_value(params, cavity.firmware());
            for fsd in &fsds {
                let pin = match family {
                    Family::Llrf2 => fsd_ok,
                    _ => Some(0.0),
                };
                if let Some(pin) = pin {
                    fsd.add_value_hook(threshold_hook(
                        Arc::clone(&self.interlocks),
                        Some(pin),
                        Some(pin),
                    ));
                }
            }
            if !cavity.tuner_bad() {
                // Tuner must be in auto mode (1) on monitored cavities.
                tuner_mode.add_value_hook(threshold_hook(
                    Arc::clone(&self.interlocks),
                    Some(1.0),
                    Some(1.0),
                ));
            }
        }
        for link in &all {
            link.fire_hooks();
        }

        Ok(Arc::new(cavity))
    }
}

fn complete_record(record: &CavityRecord) -> Option<CavitySpec> {
    Some(CavitySpec {
        name: record.name.clone(),
        epics_name: record.epics_name.clone(),
        zone: record.zone.clone(),
        cavity_type: record.cavity_type.clone()?,
        length: record.length?,
        q0: record.q0?,
        bypassed: record.bypassed,
        tuner_bad: record.tuner_bad,
        gset_max_requested: record.gset_max,
        firmware: record.firmware,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedaq_core::signal::SimChannel;

    /// Plausible startup value per channel suffix.
    fn sim_value(name: &str) -> f64 {
        if name.ends_with("GSET.DRVH") {
            25.0
        } else if name.ends_with("GSET") || name.ends_with("GMES") {
            8.0
        } else if name.ends_with("PSET") {
            14.5
        } else if name.ends_with("ODVH") {
            20.0
        } else if name.ends_with("RFONr") || name.ends_with("ACK1.B6") {
            1.0
        } else if name.ends_with("DETAHZHI") {
            25.0
        } else if name.ends_with("TCMDbits.B7") || name.ends_with("TMODI") {
            1.0
        } else if name.ends_with("FBRIO") {
            768.0
        } else if name.ends_with("JT.ORBV") {
            70.0
        } else if name.ends_with("CAPHTRMGN") {
            10.0
        } else if name.ends_with("CAPBON") {
            1.0
        } else if name.ends_with("CPI4107B") {
            0.038
        } else {
            0.0
        }
    }

    fn sim_factory() -> Box<dyn Fn(&str) -> Arc<dyn SignalLink> + Send + Sync> {
        Box::new(|name: &str| SimChannel::online(name, sim_value(name)))
    }

    fn inventory_json(zone_cavities: usize) -> String {
        let mut cavities = Vec::new();
        for n in 1..=zone_cavities {
            cavities.push(format!(
                r#"{{"name": "1L22-{n}", "epics_name": "R1M{n}", "zone": "1L22",
                     "cavity_type": "C100", "length": 0.7, "q0": 6.0e9,
                     "firmware": 2022.0}}"#
            ));
        }
        format!(
            r#"{{
              "linac": {{"name": "NorthLinac", "pressure_channel": "CPI4107B",
                         "heater_margin_channel": "CAPHTRMGN",
                         "autoheat_channel": "CAPBON"}},
              "zones": [{{"name": "1L22", "controls_type": "2.0",
                          "jt_stroke_channel": "CEV1L22JT.ORBV"}}],
              "cavities": [{}]
            }}"#,
            cavities.join(",")
        )
    }

    fn builder_parts() -> (DaqConfig, Arc<InterlockAggregator>) {
        (DaqConfig::default(), Arc::new(InterlockAggregator::new()))
    }

    #[test]
    fn builds_a_full_zone_and_seeds_the_aggregator_clean() {
        let inventory = Inventory::from_json_str(&inventory_json(8)).unwrap();
        let (config, interlocks) = builder_parts();
        let builder =
            LinacBuilder::new(&config, Arc::clone(&interlocks), Duration::from_millis(100));
        let linac = builder.build(&inventory, &sim_factory()).unwrap();

        assert_eq!(linac.cavities().len(), 8);
        let zone = linac.zone("1L22").unwrap();
        assert_eq!(zone.cavities().len(), 8);
        assert_eq!(zone.cavities()[0].name(), "1L22-1");
        assert_eq!(zone.cavities()[7].cavity_number(), 8);
        assert!(interlocks.is_safe(), "{}", interlocks.snapshot());
        assert_eq!(linac.usable_cavities().len(), 8);
    }

    #[test]
    fn short_zone_is_a_construction_error() {
        let inventory = Inventory::from_json_str(&inventory_json(7)).unwrap();
        let (config, interlocks) = builder_parts();
        let builder = LinacBuilder::new(&config, interlocks, Duration::from_millis(100));
        let err = builder.build(&inventory, &sim_factory()).map(|_| ()).unwrap_err();
        assert!(matches!(err, DaqError::Inventory { .. }));
    }

    #[test]
    fn incomplete_cavity_records_are_skipped() {
        let mut inventory = Inventory::from_json_str(&inventory_json(8)).unwrap();
        inventory.cavities[2].q0 = None;
        let (config, interlocks) = builder_parts();
        let builder = LinacBuilder::new(&config, interlocks, Duration::from_millis(100));
        // The skip itself is non-fatal; the resulting 7-cavity zone is not.
        let err = builder.build(&inventory, &sim_factory()).map(|_| ()).unwrap_err();
        assert!(matches!(err, DaqError::Inventory { .. }));
        assert!(err.to_string().contains("1L22"));
    }

    #[test]
    fn unknown_zone_reference_is_an_error() {
        let mut inventory = Inventory::from_json_str(&inventory_json(8)).unwrap();
        inventory.cavities[0].zone = "9L99".into();
        let (config, interlocks) = builder_parts();
        let builder = LinacBuilder::new(&config, interlocks, Duration::from_millis(100));
        let err = builder.build(&inventory, &sim_factory()).map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("9L99"));
    }

    #[test]
    fn unconnected_channels_fail_the_build() {
        let inventory = Inventory::from_json_str(&inventory_json(8)).unwrap();
        let (config, interlocks) = builder_parts();
        let builder = LinacBuilder::new(&config, interlocks, Duration::from_millis(20));
        let offline: Box<dyn Fn(&str) -> Arc<dyn SignalLink> + Send + Sync> =
            Box::new(|name: &str| Arc::new(SimChannel::new(name)));
        let err = builder.build(&inventory, &offline).map(|_| ()).unwrap_err();
        assert!(matches!(err, DaqError::Disconnected { .. }));
    }

    #[test]
    fn rf_drop_after_build_trips_the_aggregator() {
        let inventory = Inventory::from_json_str(&inventory_json(8)).unwrap();
        let (config, interlocks) = builder_parts();

        let channels: Arc<std::sync::Mutex<Vec<Arc<SimChannel>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&channels);
        let factory: Box<dyn Fn(&str) -> Arc<dyn SignalLink> + Send + Sync> =
            Box::new(move |name: &str| {
                let sim = SimChannel::online(name, sim_value(name));
                recorded.lock().unwrap().push(sim.clone());
                sim
            });
        let builder =
            LinacBuilder::new(&config, Arc::clone(&interlocks), Duration::from_millis(100));
        builder.build(&inventory, &factory).unwrap();
        assert!(interlocks.is_safe());

        let rf = channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name().ends_with("RFONr"))
            .cloned()
            .unwrap();
        rf.set_value(0.0);
        assert!(!interlocks.is_safe());
        rf.set_value(1.0);
        assert!(interlocks.is_safe());
    }
}
