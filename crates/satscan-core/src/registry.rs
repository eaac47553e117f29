//! Device registry: frontends, their satellite configurations, and the
//! networks each configuration feeds
//!
//! Sessions refer to frontends and satconf elements by opaque uuid and
//! resolve them through this registry at the moment of use, never holding
//! owning pointers. A frontend removed between `start` and worker exit is
//! detected as a failed lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::dvb::frontend::FrontendAdapter;
use crate::dvb::satconf::SatConf;

/// A satconf element attached to a frontend
pub struct SatconfEntry {
    pub uuid: String,
    pub enabled: bool,
    pub satconf: SatConf,
    /// Networks this configuration is allowed to feed
    pub networks: Vec<String>,
}

/// A registered frontend. The adapter mutex serialises every use of the
/// underlying descriptor: acquisition slots, prescans and SEC traffic.
pub struct FrontendEntry {
    pub uuid: String,
    pub name: String,
    pub enabled: bool,
    pub adapter: Arc<Mutex<FrontendAdapter>>,
    pub satconfs: Vec<Arc<SatconfEntry>>,
}

/// One row of the `list_satconfs` operation
#[derive(Debug, Clone, Serialize)]
pub struct SatconfListing {
    pub frontend_uuid: String,
    pub frontend_name: String,
    pub satconf_uuid: String,
    pub satconf_name: String,
    pub lnb_type: String,
    pub unicable: bool,
    pub unicable_type: String,
    pub scr: u32,
    /// Gateway user-band output frequency, kHz
    pub scr_freq: u32,
    pub display_name: String,
}

#[derive(Default)]
pub struct DeviceRegistry {
    frontends: Mutex<HashMap<String, Arc<FrontendEntry>>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    pub fn register_frontend(&self, entry: FrontendEntry) {
        let mut frontends = self.frontends.lock().unwrap();
        tracing::info!(uuid = %entry.uuid, name = %entry.name, "registered frontend");
        frontends.insert(entry.uuid.clone(), Arc::new(entry));
    }

    pub fn remove_frontend(&self, uuid: &str) -> bool {
        self.frontends.lock().unwrap().remove(uuid).is_some()
    }

    pub fn frontend(&self, uuid: &str) -> Option<Arc<FrontendEntry>> {
        self.frontends.lock().unwrap().get(uuid).cloned()
    }

    /// Resolve a satconf element within a given frontend
    pub fn satconf(&self, frontend_uuid: &str, satconf_uuid: &str) -> Option<Arc<SatconfEntry>> {
        self.frontend(frontend_uuid)?
            .satconfs
            .iter()
            .find(|s| s.uuid == satconf_uuid)
            .cloned()
    }

    /// All enabled (frontend, satconf) pairs feeding a network, shaped for
    /// the control surface
    pub fn list_satconfs(&self, network: &str) -> Vec<SatconfListing> {
        let frontends = self.frontends.lock().unwrap();
        let mut out = Vec::new();

        for fe in frontends.values() {
            if !fe.enabled {
                continue;
            }
            for sc in &fe.satconfs {
                if !sc.enabled || !sc.networks.iter().any(|n| n == network) {
                    continue;
                }

                let lnb_type = sc.satconf.lnb.label().to_string();
                let (unicable, unicable_type, scr, scr_freq, display_name) =
                    match &sc.satconf.unicable {
                        Some(uc) => (
                            true,
                            uc.variant.label().to_string(),
                            uc.scr as u32,
                            uc.scr_freq_khz,
                            format!(
                                "{} - {} (SCR {} @ {} MHz)",
                                sc.satconf.name,
                                uc.variant.label(),
                                uc.scr,
                                uc.scr_freq_khz / 1_000
                            ),
                        ),
                        None => (
                            false,
                            String::new(),
                            0,
                            0,
                            format!("{} - {}", sc.satconf.name, lnb_type),
                        ),
                    };

                out.push(SatconfListing {
                    frontend_uuid: fe.uuid.clone(),
                    frontend_name: fe.name.clone(),
                    satconf_uuid: sc.uuid.clone(),
                    satconf_name: sc.satconf.name.clone(),
                    lnb_type,
                    unicable,
                    unicable_type,
                    scr,
                    scr_freq,
                    display_name,
                });
            }
        }
        out
    }
}
