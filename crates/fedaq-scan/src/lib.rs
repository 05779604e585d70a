//! Scan procedures: parallel gradient updates, the apply/collect/rollback
//! saga, and the data-log index that ties collected windows to the archiver.

pub mod datalog;
pub mod orchestrator;
pub mod procedures;
pub mod saga;

pub use datalog::{DataLog, SampleWindow};
pub use orchestrator::{BatchResult, apply_batch};
pub use procedures::{
    MIN_WALK_SETTLE_S, ScanOptions, SimpleScanOptions, WalkScanOptions,
    choose_random_gradient_changes, default_offsets, run_levelized_walk_scan,
    run_random_sample_scan, run_simple_gradient_scan, settle_and_average,
};
pub use saga::{SamplePlan, collect_with_rollback};
