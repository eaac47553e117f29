//! Mux records, the upstream network-store collaborator, and peak
//! materialisation
//!
//! The scanner never owns muxes. It matches candidates against the store's
//! records, creates new ones through it, and keeps only opaque ids as
//! back-references. Deleting a mux externally must never break a session;
//! reports re-query by id.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::dvb::{
    freq_tolerance_for_sr, DeliverySystem, FecRate, Modulation, Pilot, PlsMode, Polarisation,
    Rolloff,
};
use crate::scan::session::Peak;

/// Opaque identifier of a mux inside the network store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuxId(pub u64);

/// Outcome of the store's last scan of a mux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MuxScanResult {
    /// Never scanned or still queued
    None,
    Ok,
    Failed,
}

/// The tuning key of a mux
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxTuning {
    /// Transponder kHz
    pub frequency: u32,
    pub polarisation: Polarisation,
    /// Symbols per second
    pub symbol_rate: u32,
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub fec: FecRate,
    pub rolloff: Rolloff,
    pub pilot: Pilot,
    /// ISI, -1 for no filter
    pub stream_id: i32,
    pub pls_mode: PlsMode,
    pub pls_code: u32,
}

impl MuxTuning {
    /// Whether two tuning keys identify the same mux: every field matches
    /// exactly except frequency, which matches within `tolerance_khz`.
    pub fn same_key(&self, other: &MuxTuning, tolerance_khz: u32) -> bool {
        self.frequency.abs_diff(other.frequency) <= tolerance_khz
            && self.polarisation == other.polarisation
            && self.symbol_rate == other.symbol_rate
            && self.delivery_system == other.delivery_system
            && self.modulation == other.modulation
            && self.fec == other.fec
            && self.rolloff == other.rolloff
            && self.pilot == other.pilot
            && self.stream_id == other.stream_id
            && self.pls_mode == other.pls_mode
            && self.pls_code == other.pls_code
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MuxRecord {
    pub id: MuxId,
    pub network: String,
    pub tuning: MuxTuning,
    pub scan_result: MuxScanResult,
    pub gse: bool,
}

impl MuxRecord {
    /// Half of the occupied bandwidth in kHz: SR x (1 + rolloff) / 2,
    /// rolloff defaulting to 0.35 when unknown
    pub fn half_bandwidth_khz(&self) -> u32 {
        (self.tuning.symbol_rate / 1_000) * (100 + self.tuning.rolloff.percent()) / 200
    }

    /// Does a candidate at (freq, pol) fall inside this mux's bandwidth
    /// envelope?
    pub fn covers(&self, frequency: u32, pol: Polarisation) -> bool {
        if self.tuning.polarisation != pol {
            return false;
        }
        let half_bw = self.half_bandwidth_khz();
        frequency >= self.tuning.frequency.saturating_sub(half_bw)
            && frequency <= self.tuning.frequency + half_bw
    }

    /// The looser, symbol-rate-indexed tolerance the peaks reporter uses:
    /// max(SR/2000 kHz, 1 MHz)
    pub fn report_tolerance_khz(&self) -> u32 {
        if self.tuning.symbol_rate > 0 {
            (self.tuning.symbol_rate / 2_000).max(1_000)
        } else {
            3_000
        }
    }

    pub fn within_report_tolerance(&self, frequency: u32, pol: Polarisation) -> bool {
        self.tuning.polarisation == pol
            && self.tuning.frequency.abs_diff(frequency) < self.report_tolerance_khz()
    }
}

/// Scan scheduling priority for freshly created muxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPriority {
    /// Operator-initiated: scan ahead of everything idle
    User,
    Auto,
}

/// The upstream network database. The scanner is a client: lookups, creates
/// and scan-queue inserts only.
pub trait MuxStore: Send + Sync {
    fn network_exists(&self, network: &str) -> bool;

    /// Snapshot of all muxes in a network
    fn muxes(&self, network: &str) -> Vec<MuxRecord>;

    /// Find a mux with an exactly matching tuning key. Frequency matches
    /// within the symbol-rate-indexed tolerance; every other tuning field
    /// matches exactly.
    fn find(&self, network: &str, tuning: &MuxTuning) -> Option<MuxId>;

    /// Create a mux; `None` when the network refuses
    fn create(&self, network: &str, tuning: MuxTuning, gse: bool) -> Option<MuxId>;

    fn enqueue_scan(&self, id: MuxId, priority: ScanPriority);

    /// Re-query a back-reference; `None` when the mux was deleted
    fn get(&self, id: MuxId) -> Option<MuxRecord>;
}

/// In-memory store used by tests and the hardware-free demo server
#[derive(Default)]
pub struct MemoryMuxStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: u64,
    muxes: HashMap<u64, MuxRecord>,
    networks: Vec<String>,
    scan_queue: Vec<(MuxId, ScanPriority)>,
}

impl MemoryMuxStore {
    pub fn new(networks: Vec<String>) -> MemoryMuxStore {
        MemoryMuxStore {
            inner: Mutex::new(MemoryStoreInner {
                networks,
                ..Default::default()
            }),
        }
    }

    /// Seed an existing mux, returning its id
    pub fn insert(&self, network: &str, tuning: MuxTuning, scan_result: MuxScanResult) -> MuxId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = MuxId(inner.next_id);
        inner.muxes.insert(
            id.0,
            MuxRecord {
                id,
                network: network.to_string(),
                tuning,
                scan_result,
                gse: false,
            },
        );
        id
    }

    pub fn remove(&self, id: MuxId) -> bool {
        self.inner.lock().unwrap().muxes.remove(&id.0).is_some()
    }

    pub fn set_scan_result(&self, id: MuxId, result: MuxScanResult) {
        if let Some(m) = self.inner.lock().unwrap().muxes.get_mut(&id.0) {
            m.scan_result = result;
        }
    }

    pub fn scan_queue(&self) -> Vec<(MuxId, ScanPriority)> {
        self.inner.lock().unwrap().scan_queue.clone()
    }
}

impl MuxStore for MemoryMuxStore {
    fn network_exists(&self, network: &str) -> bool {
        self.inner.lock().unwrap().networks.iter().any(|n| n == network)
    }

    fn muxes(&self, network: &str) -> Vec<MuxRecord> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .muxes
            .values()
            .filter(|m| m.network == network)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.id.0);
        out
    }

    fn find(&self, network: &str, tuning: &MuxTuning) -> Option<MuxId> {
        let tolerance = freq_tolerance_for_sr(tuning.symbol_rate);
        let inner = self.inner.lock().unwrap();
        inner
            .muxes
            .values()
            .find(|m| m.network == network && m.tuning.same_key(tuning, tolerance))
            .map(|m| m.id)
    }

    fn create(&self, network: &str, tuning: MuxTuning, gse: bool) -> Option<MuxId> {
        if !self.network_exists(network) {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = MuxId(inner.next_id);
        inner.muxes.insert(
            id.0,
            MuxRecord {
                id,
                network: network.to_string(),
                tuning,
                scan_result: MuxScanResult::None,
                gse,
            },
        );
        Some(id)
    }

    fn enqueue_scan(&self, id: MuxId, priority: ScanPriority) {
        self.inner.lock().unwrap().scan_queue.push((id, priority));
    }

    fn get(&self, id: MuxId) -> Option<MuxRecord> {
        self.inner.lock().unwrap().muxes.get(&id.0).cloned()
    }
}

/// A peak selected for materialisation, as submitted over the control API.
/// Anything not supplied falls back to the blind defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectedPeak {
    pub frequency: u32,
    #[serde(default)]
    pub polarisation: Polarisation,
    #[serde(default)]
    pub symbol_rate: u32,
    #[serde(default)]
    pub delsys: DeliverySystem,
    #[serde(default)]
    pub modulation: Modulation,
    #[serde(default)]
    pub fec: FecRate,
    #[serde(default)]
    pub rolloff: Rolloff,
    #[serde(default)]
    pub pilot: Pilot,
    #[serde(default = "default_stream_id")]
    pub stream_id: i32,
    #[serde(default)]
    pub pls_mode: PlsMode,
    #[serde(default = "default_pls_code")]
    pub pls_code: u32,
    #[serde(default)]
    pub is_gse: bool,
}

fn default_stream_id() -> i32 {
    -1
}

fn default_pls_code() -> u32 {
    1
}

impl SelectedPeak {
    fn tuning(&self) -> MuxTuning {
        MuxTuning {
            frequency: self.frequency,
            polarisation: self.polarisation,
            symbol_rate: if self.symbol_rate > 0 {
                self.symbol_rate
            } else {
                27_500_000
            },
            delivery_system: self.delsys,
            modulation: self.modulation,
            fec: self.fec,
            rolloff: self.rolloff,
            pilot: self.pilot,
            stream_id: self.stream_id,
            pls_mode: self.pls_mode,
            pls_code: if self.pls_code < 262_144 {
                self.pls_code
            } else {
                0
            },
        }
    }
}

/// What happened to one selected peak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialiseOutcome {
    Created(MuxId),
    AlreadyExists(MuxId),
    Refused,
}

/// Convert one selected candidate into a persistent mux: dedup against the
/// store, create, and queue the new mux for a user-priority scan.
pub fn materialise(
    store: &dyn MuxStore,
    network: &str,
    selected: &SelectedPeak,
) -> MaterialiseOutcome {
    let tuning = selected.tuning();

    if let Some(existing) = store.find(network, &tuning) {
        tracing::debug!(
            frequency = tuning.frequency,
            pol = %tuning.polarisation.as_char(),
            stream_id = tuning.stream_id,
            "mux already exists"
        );
        return MaterialiseOutcome::AlreadyExists(existing);
    }

    match store.create(network, tuning.clone(), selected.is_gse) {
        Some(id) => {
            tracing::info!(
                frequency = tuning.frequency,
                symbol_rate = tuning.symbol_rate,
                pol = %tuning.polarisation.as_char(),
                stream_id = tuning.stream_id,
                gse = selected.is_gse,
                "created mux"
            );
            store.enqueue_scan(id, ScanPriority::User);
            MaterialiseOutcome::Created(id)
        }
        None => {
            tracing::warn!(
                frequency = tuning.frequency,
                "network refused mux creation"
            );
            MaterialiseOutcome::Refused
        }
    }
}

/// Build a selected-peak record from a session candidate, preferring locked
/// prescan parameters over blind defaults.
pub fn selection_from_peak(peak: &Peak) -> SelectedPeak {
    match &peak.tuning {
        Some(t) => SelectedPeak {
            frequency: peak.frequency,
            polarisation: peak.polarisation,
            symbol_rate: t.symbol_rate,
            delsys: t.delivery_system,
            modulation: t.modulation,
            fec: t.fec,
            rolloff: t.rolloff,
            pilot: t.pilot,
            stream_id: t.stream_id,
            pls_mode: t.pls_mode,
            pls_code: t.pls_code,
            is_gse: t.is_gse,
        },
        None => SelectedPeak {
            frequency: peak.frequency,
            polarisation: peak.polarisation,
            symbol_rate: peak.symbol_rate,
            delsys: DeliverySystem::DvbS2,
            modulation: Modulation::Auto,
            fec: FecRate::Auto,
            rolloff: Rolloff::Auto,
            pilot: Pilot::Auto,
            stream_id: -1,
            pls_mode: PlsMode::Root,
            pls_code: 1,
            is_gse: false,
        },
    }
}
