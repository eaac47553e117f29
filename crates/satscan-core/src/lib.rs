//! Satscan Core - DVB-S/S2 blind spectrum scanning
//!
//! This library discovers unknown carriers on a satellite by driving a
//! frontend through a driver-level spectrum interface, characterising each
//! detected carrier (modulation, FEC, symbol rate, multistream identifiers,
//! scrambling codes) and materialising the results as tuning records in a
//! host network database.
//!
//! The pipeline, leaf first:
//! - [`dvb::frontend`] - property transactions, SEC sequencing and the
//!   readiness wait over the frontend device
//! - [`scan::spectrum`] - direct-LNB and Unicable-sliced spectrum acquisition
//! - [`scan::peaks`] - software peak detection over an acquired spectrum
//! - [`scan::prescan`] - blind tuning of a single candidate carrier
//! - [`scan::manager`] - per-scan sessions, worker threads and the public
//!   operation surface
//! - [`scan::mux`] - deduplication against and creation of persistent muxes

pub mod dvb;
pub mod registry;
pub mod scan;

pub use dvb::{Band, Polarisation};
pub use registry::DeviceRegistry;
pub use scan::manager::ScanManager;
pub use scan::mux::{MemoryMuxStore, MuxStore};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
