//! The accelerator model: cavities, zones, linacs, and how to build them.
//!
//! [`Cavity`] owns the gradient-change state machine and its validation
//! envelope.  [`Zone`] and [`Linac`] carry the shared cryo guards every
//! gradient move must satisfy.  [`discovery`] turns inventory records plus a
//! channel factory into a wired, interlock-monitored [`Linac`].

pub mod cavity;
pub mod discovery;
pub mod family;
pub mod linac;
pub mod zone;

pub use cavity::{Cavity, CavityChannels, CavitySpec, MAX_SINGLE_STEP, RampOptions};
pub use discovery::{CavityRecord, Inventory, LinacBuilder, LinacRecord, LinkFactory, ZoneRecord};
pub use family::Family;
pub use linac::{Linac, LinacGuard};
pub use zone::{CAVITIES_PER_ZONE, HeatChange, Zone, ZoneGuard};
