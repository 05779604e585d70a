//! Zone heat-budget gating over a fully built linac.

use std::sync::Arc;
use std::time::Duration;

use fedaq_core::config::DaqConfig;
use fedaq_core::error::DaqError;
use fedaq_core::signal::{SignalLink, SimChannel};
use fedaq_interlock::InterlockAggregator;
use fedaq_machine::{Inventory, LinacBuilder};

fn sim_factory_at(gset: f64) -> Box<dyn Fn(&str) -> Arc<dyn SignalLink> + Send + Sync> {
    Box::new(move |name: &str| {
        let value = if name.ends_with("GSET.DRVH") {
            25.0
        } else if name.ends_with("GSET") || name.ends_with("GMES") {
            gset
        } else if name.ends_with("PSET") {
            14.5
        } else if name.ends_with("ODVH") {
            20.0
        } else if name.ends_with("RFONr") {
            1.0
        } else if name.ends_with("DETAHZHI") {
            25.0
        } else if name.ends_with("TCMDbits.B7") {
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
        };
        SimChannel::online(name, value)
    })
}

fn build_linac_at(gset: f64) -> fedaq_machine::Linac {
    let mut cavities = Vec::new();
    for n in 1..=8 {
        cavities.push(format!(
            r#"{{"name": "1L22-{n}", "epics_name": "R1M{n}", "zone": "1L22",
                 "cavity_type": "C100", "length": 0.7, "q0": 6.0e9,
                 "firmware": 2022.0}}"#
        ));
    }
    let json = format!(
        r#"{{
          "linac": {{"name": "NorthLinac", "pressure_channel": "CPI4107B",
                     "heater_margin_channel": "CAPHTRMGN",
                     "autoheat_channel": "CAPBON"}},
          "zones": [{{"name": "1L22", "controls_type": "2.0",
                      "jt_stroke_channel": "CEV1L22JT.ORBV"}}],
          "cavities": [{}]
        }}"#,
        cavities.join(",")
    );
    let inventory = Inventory::from_json_str(&json).unwrap();
    let config = DaqConfig::default();
    let interlocks = Arc::new(InterlockAggregator::new());
    LinacBuilder::new(&config, interlocks, Duration::from_millis(100))
        .build(&inventory, &sim_factory_at(gset))
        .unwrap()
}

fn build_linac() -> fedaq_machine::Linac {
    build_linac_at(8.0)
}

#[test]
fn heat_change_inside_the_budget_passes_with_the_signed_percentage() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();

    // Everyone at 8.0 now; raising all to 8.4 is (8.4/8)^2 - 1 = +10.25%.
    let proposal = vec![Some(8.4); 8];
    let change = zone.check_heat_change(&proposal, 11.0).unwrap();
    assert!((change.percent - 10.25).abs() < 1e-9);
    assert!(change.new_w > change.old_w);
}

#[test]
fn heat_change_over_the_budget_is_rejected() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();

    let proposal = vec![Some(8.4); 8];
    let err = zone.check_heat_change(&proposal, 10.0).unwrap_err();
    match err {
        DaqError::HeatBudget { zone, percent, limit, .. } => {
            assert_eq!(zone, "1L22");
            assert!((percent - 10.25).abs() < 1e-9);
            assert!((limit - 10.0).abs() < f64::EPSILON);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn large_heat_reductions_are_rejected_too() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();

    // Dropping to 7.5 is (7.5/8)^2 - 1 = -12.1%, over a 10% budget by
    // magnitude even though the plant would be shedding heat.
    let proposal = vec![Some(7.5); 8];
    let err = zone.check_heat_change(&proposal, 10.0).unwrap_err();
    assert!(matches!(err, DaqError::HeatBudget { .. }));
}

#[test]
fn full_shutdown_is_a_hundred_percent_reduction() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();

    // Taking every cavity to zero removes all RF heat.
    let proposal = vec![Some(0.0); 8];
    let err = zone.check_heat_change(&proposal, 99.0).unwrap_err();
    match err {
        DaqError::HeatBudget { percent, .. } => assert!((percent + 100.0).abs() < 1e-9),
        other => panic!("unexpected error: {other}"),
    }

    let change = zone.check_heat_change(&proposal, 101.0).unwrap();
    assert!((change.percent + 100.0).abs() < 1e-9);
    assert!(change.new_w.abs() < 1e-9);
}

#[test]
fn none_entries_leave_cavities_at_their_current_heat() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();

    let mut proposal = vec![None; 8];
    proposal[0] = Some(8.4);
    // One cavity of eight moving +10.25% is about +1.28% for the zone.
    let change = zone.check_heat_change(&proposal, 2.0).unwrap();
    assert!((change.percent - 10.25 / 8.0).abs() < 1e-9);
}

#[test]
fn quiet_zone_rejects_any_new_heat_but_allows_staying_quiet() {
    let linac = build_linac_at(0.0);
    let zone = linac.zone("1L22").unwrap();

    let change = zone.check_heat_change(&[None; 8], 10.0).unwrap();
    assert!((change.percent - 0.0).abs() < f64::EPSILON);
    assert!(change.old_w.abs() < 1e-9);

    let mut proposal = [None; 8];
    proposal[3] = Some(5.0);
    let err = zone.check_heat_change(&proposal, 10.0).unwrap_err();
    match err {
        DaqError::HeatBudget { percent, old_w, .. } => {
            assert!(percent.is_infinite());
            assert!(old_w.abs() < 1e-9);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn proposal_must_cover_every_cavity_position() {
    let linac = build_linac();
    let zone = linac.zone("1L22").unwrap();
    let err = zone.check_heat_change(&[None; 3], 10.0).unwrap_err();
    assert!(matches!(err, DaqError::Inventory { .. }));
}
