//! The scan manager: session registry and public operations
//!
//! One manager value owns every session in the process. It is injected into
//! whatever binds the control surface; there is no global state. All
//! operations run on the caller's thread and return quickly - the slow
//! driver work happens on each session's worker thread, and `prescan` is
//! the one deliberate exception, blocking its caller for up to the lock
//! budget while it borrows the frontend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::dvb::{Band, DeliverySystem, FecRate, Modulation, Pilot, PlsMode, Polarisation, Rolloff};
use crate::registry::DeviceRegistry;
use crate::scan::mux::{materialise, MaterialiseOutcome, MuxScanResult, MuxStore, SelectedPeak};
use crate::scan::prescan::{self, PrescanOutcome, DEFAULT_SR_ESTIMATE};
use crate::scan::session::{
    run_worker, Peak, PeakStatus, ScanNotifier, ScanRequest, Session, SessionId, StatusSnapshot,
    VerifiedMux, WorkerContext,
};
use crate::scan::spectrum::SpectrumBuffer;
use crate::scan::ScanError;

/// Candidates within this window of a requested frequency are "the same
/// carrier" for prescan and create bookkeeping
const CANDIDATE_MATCH_KHZ: u32 = 2_000;

/// One row of the `peaks` report
#[derive(Debug, Clone, Serialize)]
pub struct PeakReport {
    pub frequency: u32,
    pub symbol_rate: u32,
    pub level: i32,
    pub snr: i32,
    pub polarisation: Polarisation,
    pub status: &'static str,
    pub existing: bool,
    pub has_failed_mux: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_freq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_sr: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_freq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_sr: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delsys: Option<DeliverySystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modulation: Option<Modulation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec: Option<FecRate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolloff: Option<Rolloff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pilot: Option<Pilot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pls_mode: Option<PlsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pls_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_gse: Option<bool>,
}

impl PeakReport {
    fn from_peak(peak: &Peak, status: &'static str, existing: bool, has_failed_mux: bool) -> Self {
        let t = peak.tuning.as_ref();
        PeakReport {
            frequency: peak.frequency,
            symbol_rate: peak.symbol_rate,
            level: peak.level,
            snr: peak.snr,
            polarisation: peak.polarisation,
            status,
            existing,
            has_failed_mux,
            verified_freq: peak.verified.map(|v| v.frequency),
            verified_sr: peak.verified.map(|v| v.symbol_rate),
            actual_freq: t.map(|t| t.frequency),
            actual_sr: t.map(|t| t.symbol_rate),
            delsys: t.map(|t| t.delivery_system),
            modulation: t.map(|t| t.modulation),
            fec: t.map(|t| t.fec),
            rolloff: t.map(|t| t.rolloff),
            pilot: t.map(|t| t.pilot),
            stream_id: t.map(|t| t.stream_id),
            pls_mode: t.map(|t| t.pls_mode),
            pls_code: t.map(|t| t.pls_code),
            is_gse: t.map(|t| t.is_gse),
        }
    }
}

pub struct ScanManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    devices: Arc<DeviceRegistry>,
    muxes: Arc<dyn MuxStore>,
    notifier: Option<Arc<dyn ScanNotifier>>,
}

impl ScanManager {
    pub fn new(devices: Arc<DeviceRegistry>, muxes: Arc<dyn MuxStore>) -> ScanManager {
        ScanManager {
            sessions: Mutex::new(HashMap::new()),
            devices,
            muxes,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ScanNotifier>) -> ScanManager {
        self.notifier = Some(notifier);
        self
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    fn find(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(uuid).cloned()
    }

    /// Validate the request, register a session and spawn its worker
    pub fn start(&self, mut request: ScanRequest) -> Result<SessionId, ScanError> {
        if request.end_freq < request.start_freq {
            return Err(ScanError::InvalidParam(format!(
                "end_freq {} below start_freq {}",
                request.end_freq, request.start_freq
            )));
        }
        if self.devices.frontend(&request.frontend).is_none() {
            return Err(ScanError::FrontendNotFound);
        }
        if !self.muxes.network_exists(&request.network) {
            return Err(ScanError::NetworkNotFound);
        }
        if let Some(satconf_uuid) = &request.satconf {
            if self.devices.satconf(&request.frontend, satconf_uuid).is_none() {
                // scan without SEC chain rather than refusing outright
                tracing::warn!(satconf = %satconf_uuid, "satconf not found, scanning without it");
                request.satconf = None;
            }
        }

        let session = Session::new(request);
        let id = session.id.clone();

        session
            .running
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let ctx = WorkerContext {
            session: Arc::clone(&session),
            devices: Arc::clone(&self.devices),
            muxes: Arc::clone(&self.muxes),
            notifier: self.notifier.clone(),
        };
        let handle = std::thread::spawn(move || run_worker(ctx));
        *session.worker.lock().unwrap() = Some(handle);

        self.sessions
            .lock()
            .unwrap()
            .insert(id.as_str().to_string(), Arc::clone(&session));

        tracing::info!(uuid = %id, "blindscan session started");
        Ok(id)
    }

    pub fn status(&self, uuid: &str) -> Option<StatusSnapshot> {
        Some(self.find(uuid)?.snapshot())
    }

    /// Spectrum for one (polarisation, band) slot; `None` until acquired
    pub fn spectrum(&self, uuid: &str, pol: Polarisation, band: Band) -> Option<SpectrumBuffer> {
        let buffer = self.find(uuid)?.spectrum(pol, band)?;
        if buffer.points.is_empty() {
            return None;
        }
        Some(buffer)
    }

    /// Report all candidates. Pending candidates that an OK-scanned mux now
    /// covers flip to `existing` here; overlap with only failed muxes is
    /// surfaced as `retry` without changing the stored status.
    pub fn peaks(&self, uuid: &str) -> Option<Vec<PeakReport>> {
        let session = self.find(uuid)?;
        let muxes = self.muxes.muxes(&session.request.network);

        let mut data = session.data.lock().unwrap();
        let mut reports = Vec::with_capacity(data.peaks.len());

        for peak in data.peaks.iter_mut() {
            // a deleted mux leaves a stale back-reference; drop it rather
            // than report through it
            if let Some(id) = peak.mux {
                if self.muxes.get(id).is_none() {
                    peak.mux = None;
                }
            }

            let mut has_failed_mux = false;
            if peak.status == PeakStatus::Pending {
                let mut covering_ok = None;
                for m in &muxes {
                    if m.within_report_tolerance(peak.frequency, peak.polarisation) {
                        if m.scan_result == MuxScanResult::Ok {
                            covering_ok = Some(m);
                            break;
                        }
                        has_failed_mux = true;
                    }
                }
                if let Some(m) = covering_ok {
                    peak.status = PeakStatus::Skipped;
                    peak.verified = Some(VerifiedMux {
                        frequency: m.tuning.frequency,
                        symbol_rate: m.tuning.symbol_rate,
                    });
                    peak.mux = Some(m.id);
                    has_failed_mux = false;
                }
            }

            let status = match peak.status {
                PeakStatus::Pending => {
                    if has_failed_mux {
                        "retry"
                    } else {
                        "pending"
                    }
                }
                PeakStatus::Scanning => "scanning",
                PeakStatus::Locked => "locked",
                PeakStatus::Failed => "failed",
                PeakStatus::Skipped => "existing",
            };
            let existing = peak.status == PeakStatus::Skipped;
            reports.push(PeakReport::from_peak(peak, status, existing, has_failed_mux));
        }
        Some(reports)
    }

    /// Blind-tune one candidate and fold the result back into it.
    ///
    /// Only the matching candidate is touched; a prescan never disturbs its
    /// neighbours.
    pub fn prescan(
        &self,
        uuid: &str,
        frequency: u32,
        pol: Polarisation,
    ) -> Result<PrescanOutcome, ScanError> {
        let session = self.find(uuid).ok_or(ScanError::SessionNotFound)?;
        let frontend = self
            .devices
            .frontend(&session.request.frontend)
            .ok_or(ScanError::FrontendNotFound)?;
        let satconf_entry = session
            .request
            .satconf
            .as_ref()
            .and_then(|sc| self.devices.satconf(&session.request.frontend, sc));

        let est_sr = session
            .peaks_snapshot()
            .iter()
            .find(|p| {
                p.polarisation == pol && p.frequency.abs_diff(frequency) < CANDIDATE_MATCH_KHZ
            })
            .map(|p| p.symbol_rate)
            .filter(|&sr| sr > 0)
            .unwrap_or(DEFAULT_SR_ESTIMATE);

        tracing::info!(uuid, frequency, pol = %pol.as_char(), est_sr, "prescan");

        let outcome = {
            let mut adapter = frontend.adapter.lock().unwrap();
            prescan::prescan(
                &mut adapter,
                satconf_entry.as_ref().map(|e| &e.satconf),
                frequency,
                pol,
                est_sr,
            )?
        };

        let mut data = session.data.lock().unwrap();
        if let Some(peak) = data.peaks.iter_mut().find(|p| {
            p.polarisation == pol && p.frequency.abs_diff(frequency) < CANDIDATE_MATCH_KHZ
        }) {
            match &outcome.tuning {
                Some(t) => {
                    peak.frequency = t.frequency;
                    peak.symbol_rate = t.symbol_rate;
                    peak.tuning = Some(t.clone());
                    peak.status = PeakStatus::Locked;
                }
                None => peak.status = PeakStatus::Failed,
            }
        }

        Ok(outcome)
    }

    /// Materialise the selected candidates as muxes, returning how many
    /// were actually created
    pub fn create_muxes(&self, uuid: &str, selected: &[SelectedPeak]) -> Result<u32, ScanError> {
        let session = self.find(uuid).ok_or(ScanError::SessionNotFound)?;
        let network = &session.request.network;
        if !self.muxes.network_exists(network) {
            return Err(ScanError::NetworkNotFound);
        }

        let mut created = 0u32;
        for sel in selected {
            let outcome = materialise(self.muxes.as_ref(), network, sel);

            let mux_id = match outcome {
                MaterialiseOutcome::Created(id) => {
                    created += 1;
                    Some(id)
                }
                MaterialiseOutcome::AlreadyExists(id) => Some(id),
                MaterialiseOutcome::Refused => None,
            };

            if let Some(id) = mux_id {
                let mut data = session.data.lock().unwrap();
                if let Some(peak) = data.peaks.iter_mut().find(|p| {
                    p.polarisation == sel.polarisation
                        && p.frequency.abs_diff(sel.frequency) < CANDIDATE_MATCH_KHZ
                }) {
                    peak.mux = Some(id);
                    if peak.status == PeakStatus::Pending
                        && matches!(outcome, MaterialiseOutcome::Created(_))
                    {
                        // hand-off: the network scanner owns it from here
                        peak.status = PeakStatus::Scanning;
                    }
                }
            }
        }

        session.data.lock().unwrap().muxes_created += created;
        tracing::info!(uuid, created, "created muxes from selected peaks");
        Ok(created)
    }

    /// Materialise every candidate that is neither skipped nor failed,
    /// using locked prescan parameters where a prescan ran and blind
    /// defaults otherwise
    pub fn create_all_muxes(&self, uuid: &str) -> Result<u32, ScanError> {
        let session = self.find(uuid).ok_or(ScanError::SessionNotFound)?;
        let selected: Vec<SelectedPeak> = session
            .peaks_snapshot()
            .iter()
            .filter(|p| !matches!(p.status, PeakStatus::Skipped | PeakStatus::Failed))
            .map(crate::scan::mux::selection_from_peak)
            .collect();
        self.create_muxes(uuid, &selected)
    }

    /// Ask the session's worker to stop at its next polling boundary
    pub fn cancel(&self, uuid: &str) -> bool {
        match self.find(uuid) {
            Some(session) => {
                tracing::info!(uuid, "cancelling blindscan session");
                session.request_stop();
                true
            }
            None => false,
        }
    }

    /// Remove a session, joining its worker. The frontend descriptor is
    /// borrowed and stays open. Releasing twice is a no-op.
    pub fn release(&self, uuid: &str) -> bool {
        let session = match self.sessions.lock().unwrap().remove(uuid) {
            Some(s) => s,
            None => return false,
        };

        tracing::info!(uuid, "releasing blindscan session");
        session.request_stop();
        let handle = session.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            // bounded by the worst-case driver timeout of the current slot
            let _ = handle.join();
        }
        true
    }

    /// Stop every session and join every worker
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.lock().unwrap();
            map.values().cloned().collect()
        };
        for session in &sessions {
            session.request_stop();
        }
        for session in &sessions {
            let handle = session.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        self.sessions.lock().unwrap().clear();
        tracing::info!("blindscan manager shut down");
    }

    /// Uuids of all live sessions, for diagnostics
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }
}

impl Drop for ScanManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
