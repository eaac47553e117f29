//! satscan server binary
//!
//! Wires a device registry, an in-memory mux store and the scan manager to
//! the control surface. A real DVB frontend is used when one is present;
//! otherwise a simulated frontend with a handful of carriers keeps the
//! whole surface exercisable.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use satscan_core::dvb::frontend::{FrontendAdapter, FrontendIo, LinuxFrontend};
use satscan_core::dvb::satconf::SatConf;
use satscan_core::dvb::sim::{SimCarrier, SimFrontend};
use satscan_core::dvb::Polarisation;
use satscan_core::registry::{FrontendEntry, SatconfEntry};
use satscan_core::scan::mux::MuxStore;
use satscan_core::{DeviceRegistry, MemoryMuxStore, ScanManager};
use satscan_server::ws::BroadcastNotifier;
use satscan_server::{AppState, ServerConfig};

const DEMO_NETWORK: &str = "default";

fn demo_carriers() -> Vec<SimCarrier> {
    let mut wide = SimCarrier::new(11_012_000, 22_000_000, Polarisation::Horizontal);
    wide.level_cdb = -3800;

    let mut multistream = SimCarrier::new(11_623_000, 30_000_000, Polarisation::Vertical);
    multistream.stream_ids = vec![0, 1, 2];

    let mut high_band = SimCarrier::new(12_188_000, 27_500_000, Polarisation::Horizontal);
    high_band.level_cdb = -4300;

    vec![wide, multistream, high_band]
}

fn open_frontend() -> Box<dyn FrontendIo> {
    match LinuxFrontend::open(0, 0) {
        Ok(fe) => Box::new(fe),
        Err(e) => {
            tracing::warn!("no DVB frontend available ({e}), using simulated carriers");
            Box::new(SimFrontend::new(demo_carriers()))
        }
    }
}

fn build_registry() -> Arc<DeviceRegistry> {
    let registry = Arc::new(DeviceRegistry::new());
    registry.register_frontend(FrontendEntry {
        uuid: "frontend0".into(),
        name: "DVB-S/S2 frontend 0".into(),
        enabled: true,
        adapter: Arc::new(Mutex::new(FrontendAdapter::new(open_frontend()))),
        satconfs: vec![Arc::new(SatconfEntry {
            uuid: "satconf0".into(),
            enabled: true,
            satconf: SatConf::universal("Universal dish"),
            networks: vec![DEMO_NETWORK.into()],
        })],
    });
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let devices = build_registry();
    let muxes: Arc<dyn MuxStore> = Arc::new(MemoryMuxStore::new(vec![DEMO_NETWORK.into()]));

    // terminal scan transitions fan out to WebSocket clients
    let (ws_tx, _) = tokio::sync::broadcast::channel(256);
    let notifier = Arc::new(BroadcastNotifier::new(ws_tx.clone()));
    let manager = Arc::new(ScanManager::new(devices, muxes).with_notifier(notifier));

    let state = AppState {
        manager,
        ws_tx,
        config: ServerConfig::default(),
    };

    satscan_server::start_server(state).await
}
