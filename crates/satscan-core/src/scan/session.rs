//! Scan sessions and the per-session worker
//!
//! A session owns one scan: its parameters, the worker thread, progress and
//! cancellation flags, the per-(polarisation, band) spectrum buffers and
//! the accumulated candidate list. API entry points run on caller threads
//! and only ever take brief locks on the session data; the worker does the
//! slow driver work.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dvb::{Band, DeliverySystem, FecRate, Modulation, Pilot, PlsMode, Polarisation, Rolloff};
use crate::dvb::LNB_SLOF_KHZ;
use crate::registry::DeviceRegistry;
use crate::scan::mux::{MuxId, MuxScanResult, MuxStore};
use crate::scan::peaks::{detect_peaks, DETECT_THRESHOLD_CDB, MAX_PEAKS};
use crate::scan::spectrum::{acquire_direct, acquire_unicable, AcquireParams, SpectrumBuffer};
use crate::scan::{ScanError, SpectralPeak};

/// Opaque session handle: 16 random bytes, hex rendered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> SessionId {
        let bytes: [u8; 16] = rand::random();
        let mut hex = String::with_capacity(32);
        for b in bytes {
            hex.push_str(&format!("{b:02x}"));
        }
        SessionId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> SessionId {
        SessionId(s.to_string())
    }
}

/// Session lifecycle. Transitions only move forward:
/// idle -> acquiring -> scanning -> {complete, cancelled, error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Acquiring,
    Scanning,
    Complete,
    Cancelled,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Scanning => "scanning",
            SessionState::Complete => "complete",
            SessionState::Cancelled => "cancelled",
            SessionState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Cancelled | SessionState::Error
        )
    }
}

/// Which polarisations the scan covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolSelect {
    Horizontal,
    Vertical,
    Both,
}

impl PolSelect {
    /// 'H' and 'V' select one polarisation; anything else means both
    pub fn from_char(c: char) -> PolSelect {
        match c {
            'H' | 'h' => PolSelect::Horizontal,
            'V' | 'v' => PolSelect::Vertical,
            _ => PolSelect::Both,
        }
    }

    pub fn polarisations(self) -> Vec<Polarisation> {
        match self {
            PolSelect::Horizontal => vec![Polarisation::Horizontal],
            PolSelect::Vertical => vec![Polarisation::Vertical],
            PolSelect::Both => vec![Polarisation::Horizontal, Polarisation::Vertical],
        }
    }
}

/// Candidate peak detection source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakDetectMode {
    /// Hardware candidates, falling back to the software detector when the
    /// driver returns none
    #[default]
    Auto,
    HardwareOnly,
    SoftwareOnly,
}

impl PeakDetectMode {
    pub fn from_code(code: i64) -> PeakDetectMode {
        match code {
            1 => PeakDetectMode::HardwareOnly,
            2 => PeakDetectMode::SoftwareOnly,
            _ => PeakDetectMode::Auto,
        }
    }
}

/// Tunable scan options
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub fft_size: u32,
    /// 0 = driver default
    pub resolution_khz: u32,
    pub peak_detect: PeakDetectMode,
}

impl Default for ScanOptions {
    fn default() -> ScanOptions {
        ScanOptions {
            fft_size: 512,
            resolution_khz: 0,
            peak_detect: PeakDetectMode::Auto,
        }
    }
}

/// Everything needed to start a scan
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Frontend uuid, resolved through the device registry at use
    pub frontend: String,
    /// Optional satconf element uuid on that frontend
    pub satconf: Option<String>,
    /// Target network in the mux store
    pub network: String,
    /// Transponder kHz
    pub start_freq: u32,
    pub end_freq: u32,
    pub polarisation: PolSelect,
    pub options: ScanOptions,
}

/// Candidate status during and after blind tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakStatus {
    Pending,
    Scanning,
    Locked,
    Failed,
    Skipped,
}

/// Full tuning parameters of a successfully blind-tuned carrier
#[derive(Debug, Clone, Serialize)]
pub struct LockedTuning {
    pub frequency: u32,
    pub symbol_rate: u32,
    #[serde(rename = "delsys")]
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub fec: FecRate,
    pub rolloff: Rolloff,
    pub pilot: Pilot,
    pub stream_id: i32,
    pub pls_mode: PlsMode,
    pub pls_code: u32,
    pub is_gse: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub isi_list: Vec<u8>,
}

impl LockedTuning {
    pub fn multistream(&self) -> bool {
        self.isi_list.len() > 1
    }
}

/// Existing-mux data recorded when a candidate was covered at insert time
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerifiedMux {
    pub frequency: u32,
    pub symbol_rate: u32,
}

/// One detected candidate carrier owned by its session. Queries hand out
/// snapshots, never references.
#[derive(Debug, Clone)]
pub struct Peak {
    pub frequency: u32,
    pub symbol_rate: u32,
    pub polarisation: Polarisation,
    pub level: i32,
    pub snr: i32,
    pub status: PeakStatus,
    pub tuning: Option<LockedTuning>,
    pub verified: Option<VerifiedMux>,
    /// One-way back-reference to a materialised mux; re-queried by id
    pub mux: Option<MuxId>,
}

impl Peak {
    fn from_candidate(candidate: &SpectralPeak, pol: Polarisation) -> Peak {
        Peak {
            frequency: candidate.frequency,
            symbol_rate: candidate.symbol_rate,
            polarisation: pol,
            level: candidate.level,
            snr: candidate.snr,
            status: PeakStatus::Pending,
            tuning: None,
            verified: None,
            mux: None,
        }
    }
}

/// Status snapshot returned by the `status` operation
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub progress: u32,
    pub message: String,
    pub peak_count: u32,
    pub muxes_created: u32,
    pub muxes_locked: u32,
    pub duration_ms: i64,
}

/// Terminal notification payload, topic `blindscan`
#[derive(Debug, Clone, Serialize)]
pub struct ScanEvent {
    pub uuid: String,
    pub state: SessionState,
    pub peaks: u32,
    pub duration: i64,
}

/// Sink for terminal scan notifications
pub trait ScanNotifier: Send + Sync {
    fn scan_finished(&self, event: &ScanEvent);
}

pub(crate) struct SessionData {
    pub state: SessionState,
    pub progress: u32,
    pub message: String,
    /// Keyed by (polarisation, band): H/low, H/high, V/low, V/high
    pub spectra: [Option<SpectrumBuffer>; 4],
    pub peaks: Vec<Peak>,
    pub muxes_created: u32,
    pub duration_ms: i64,
}

pub(crate) fn spectrum_slot(pol: Polarisation, band: Band) -> usize {
    (pol.index() * 2 + band.index()) as usize
}

/// One scan, owned by the manager from `start` until `release`
pub struct Session {
    pub id: SessionId,
    pub request: ScanRequest,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub(crate) stop: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) data: Mutex<SessionData>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(request: ScanRequest) -> Arc<Session> {
        Arc::new(Session {
            id: SessionId::random(),
            request,
            started_at: Utc::now(),
            started: Instant::now(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            data: Mutex::new(SessionData {
                // set before the worker spawns so a racing status query
                // never observes idle on a started session
                state: SessionState::Acquiring,
                progress: 0,
                message: String::new(),
                spectra: [None, None, None, None],
                peaks: Vec::new(),
                muxes_created: 0,
                duration_ms: 0,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn set_progress(&self, progress: u32) {
        let mut data = self.data.lock().unwrap();
        // monotone while the scan is active
        data.progress = data.progress.max(progress.min(100));
    }

    pub(crate) fn set_message(&self, message: String) {
        self.data.lock().unwrap().message = message;
    }

    fn finish(&self, state: SessionState, message: Option<String>) {
        let mut data = self.data.lock().unwrap();
        data.state = state;
        if state == SessionState::Complete {
            data.progress = 100;
        }
        if let Some(m) = message {
            data.message = m;
        }
        data.duration_ms = self.started.elapsed().as_millis() as i64;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let data = self.data.lock().unwrap();
        let muxes_locked = data
            .peaks
            .iter()
            .filter(|p| p.status == PeakStatus::Locked)
            .count() as u32;
        let duration_ms = if data.state.is_terminal() {
            data.duration_ms
        } else {
            self.started.elapsed().as_millis() as i64
        };
        StatusSnapshot {
            state: data.state,
            progress: data.progress,
            message: data.message.clone(),
            peak_count: data.peaks.len() as u32,
            muxes_created: data.muxes_created,
            muxes_locked,
            duration_ms,
        }
    }

    pub fn spectrum(&self, pol: Polarisation, band: Band) -> Option<SpectrumBuffer> {
        self.data.lock().unwrap().spectra[spectrum_slot(pol, band)].clone()
    }

    pub fn peaks_snapshot(&self) -> Vec<Peak> {
        self.data.lock().unwrap().peaks.clone()
    }
}

/// Everything the worker thread needs, resolved lazily through opaque
/// handles
pub(crate) struct WorkerContext {
    pub session: Arc<Session>,
    pub devices: Arc<DeviceRegistry>,
    pub muxes: Arc<dyn MuxStore>,
    pub notifier: Option<Arc<dyn ScanNotifier>>,
}

/// Worker entry point. Never panics the session away: every exit path
/// lands in a terminal state, stamps the duration and emits the
/// notification.
pub(crate) fn run_worker(ctx: WorkerContext) {
    let session = Arc::clone(&ctx.session);
    let req = &session.request;

    tracing::info!(
        uuid = %session.id,
        start = req.start_freq,
        end = req.end_freq,
        frontend = %req.frontend,
        "starting blindscan"
    );

    let state = match scan_body(&ctx) {
        Ok(state) => {
            session.finish(state, None);
            state
        }
        Err((state, message)) => {
            tracing::error!(uuid = %session.id, %message, "blindscan failed");
            session.finish(state, Some(message));
            state
        }
    };

    session.running.store(false, Ordering::Relaxed);

    let snapshot = session.snapshot();
    tracing::info!(
        uuid = %session.id,
        state = state.as_str(),
        peaks = snapshot.peak_count,
        duration_ms = snapshot.duration_ms,
        "blindscan finished"
    );

    if let Some(notifier) = &ctx.notifier {
        notifier.scan_finished(&ScanEvent {
            uuid: session.id.to_string(),
            state,
            peaks: snapshot.peak_count,
            duration: snapshot.duration_ms,
        });
    }
}

fn scan_body(ctx: &WorkerContext) -> Result<SessionState, (SessionState, String)> {
    let session = &ctx.session;
    let req = &session.request;

    // Handles are opaque; anything can have disappeared since start
    let frontend = ctx
        .devices
        .frontend(&req.frontend)
        .ok_or((SessionState::Error, "Frontend not available".to_string()))?;
    let satconf_entry = match &req.satconf {
        Some(uuid) => Some(
            ctx.devices
                .satconf(&req.frontend, uuid)
                .ok_or((SessionState::Error, "Satconf not available".to_string()))?,
        ),
        None => None,
    };
    if !ctx.muxes.network_exists(&req.network) {
        return Err((SessionState::Error, "Network not available".to_string()));
    }

    {
        let mut adapter = frontend.adapter.lock().unwrap();
        if !adapter.supports_spectrum() {
            return Err((
                SessionState::Error,
                "Driver does not support spectrum acquisition".to_string(),
            ));
        }
        // force a full DiSEqC sequence for the first slot of every scan
        adapter.invalidate_sec_cache();
    }

    let pols = req.polarisation.polarisations();
    let mut bands = Vec::new();
    if req.start_freq < LNB_SLOF_KHZ {
        bands.push(Band::Low);
    }
    if req.end_freq > LNB_SLOF_KHZ {
        bands.push(Band::High);
    }

    let total_slots = (pols.len() * bands.len()) as u32;
    if total_slots == 0 {
        // empty range: nothing to do, complete immediately
        return Ok(SessionState::Complete);
    }

    let params = AcquireParams {
        start_freq: req.start_freq,
        end_freq: req.end_freq,
        resolution_khz: req.options.resolution_khz,
        fft_size: req.options.fft_size,
    };

    let satconf = satconf_entry.as_ref().map(|e| &e.satconf);
    let unicable = satconf.map(|s| s.unicable.is_some()).unwrap_or(false);
    let mut done_slots = 0u32;

    'slots: for pol in &pols {
        for band in &bands {
            if session.stop_requested() {
                break 'slots;
            }
            let (pol, band) = (*pol, *band);

            session.set_message(format!(
                "Acquiring {} {} band spectrum",
                pol.as_char(),
                band.label()
            ));

            let mut adapter = frontend.adapter.lock().unwrap();
            let result = if unicable {
                let sc = satconf.expect("unicable implies satconf");
                acquire_unicable(
                    &mut adapter,
                    sc,
                    &params,
                    pol,
                    band,
                    &session.stop,
                    &mut |slice, total, center| {
                        session.set_progress(
                            done_slots * 50 / total_slots + (slice + 1) * 50 / total / total_slots,
                        );
                        session.set_message(format!(
                            "{} {}: slice {}/{} ({} MHz)",
                            pol.as_char(),
                            band.label(),
                            slice + 1,
                            total,
                            center / 1_000
                        ));
                    },
                )
            } else {
                acquire_direct(&mut adapter, satconf, &params, pol, band, &session.stop)
            };
            drop(adapter);

            match result {
                Ok((buffer, hw_candidates)) => {
                    let candidates =
                        select_candidates(req.options.peak_detect, hw_candidates, &buffer);
                    insert_candidates(ctx, pol, band, buffer, candidates);
                }
                Err(ScanError::Cancelled) => break 'slots,
                Err(e) => {
                    // a failed slot is abandoned, the scan carries on
                    tracing::warn!(
                        uuid = %session.id,
                        pol = %pol.as_char(),
                        band = band.label(),
                        "slot failed: {e}"
                    );
                }
            }

            done_slots += 1;
            session.set_progress(done_slots * 50 / total_slots);
        }
    }

    if session.stop_requested() {
        return Ok(SessionState::Cancelled);
    }

    // verification stage: re-check what acquisition found against the
    // network's current muxes
    {
        let mut data = session.data.lock().unwrap();
        data.state = SessionState::Scanning;
        let count = data.peaks.len();
        data.message = format!("Verifying {count} candidates against existing muxes");
    }
    session.set_progress(75);
    mark_existing(ctx);

    Ok(SessionState::Complete)
}

/// Pick the candidate source for one slot
fn select_candidates(
    mode: PeakDetectMode,
    hw_candidates: Vec<SpectralPeak>,
    buffer: &SpectrumBuffer,
) -> Vec<SpectralPeak> {
    match mode {
        PeakDetectMode::HardwareOnly => hw_candidates,
        PeakDetectMode::SoftwareOnly => {
            detect_peaks(&buffer.points, MAX_PEAKS, DETECT_THRESHOLD_CDB)
        }
        PeakDetectMode::Auto => {
            if hw_candidates.is_empty() {
                tracing::info!("no hardware candidates, running software peak detection");
                detect_peaks(&buffer.points, MAX_PEAKS, DETECT_THRESHOLD_CDB)
            } else {
                hw_candidates
            }
        }
    }
}

/// Store a slot's spectrum and fold its candidates into the session,
/// auto-skipping those already covered by a successfully scanned mux
fn insert_candidates(
    ctx: &WorkerContext,
    pol: Polarisation,
    band: Band,
    buffer: SpectrumBuffer,
    candidates: Vec<SpectralPeak>,
) {
    let session = &ctx.session;
    let existing = ctx.muxes.muxes(&session.request.network);

    let mut data = session.data.lock().unwrap();
    data.spectra[spectrum_slot(pol, band)] = Some(buffer);

    for candidate in &candidates {
        tracing::info!(
            frequency = candidate.frequency,
            symbol_rate = candidate.symbol_rate,
            level = candidate.level,
            pol = %pol.as_char(),
            "candidate peak"
        );

        let mut peak = Peak::from_candidate(candidate, pol);

        // only a mux that actually scanned OK suppresses a candidate; a
        // failed overlapping mux is surfaced as a retry by the reporter
        if let Some(m) = existing
            .iter()
            .find(|m| m.covers(candidate.frequency, pol) && m.scan_result == MuxScanResult::Ok)
        {
            tracing::debug!(
                frequency = candidate.frequency,
                mux_frequency = m.tuning.frequency,
                "candidate covered by existing mux"
            );
            peak.status = PeakStatus::Skipped;
            peak.verified = Some(VerifiedMux {
                frequency: m.tuning.frequency,
                symbol_rate: m.tuning.symbol_rate,
            });
            peak.mux = Some(m.id);
        }

        data.peaks.push(peak);
    }
}

/// The post-acquisition pass of the worker: apply the same covered-by-OK
/// rule once more, now that the full candidate list exists
fn mark_existing(ctx: &WorkerContext) {
    let session = &ctx.session;
    let existing = ctx.muxes.muxes(&session.request.network);
    let mut data = session.data.lock().unwrap();

    for peak in data.peaks.iter_mut() {
        if peak.status != PeakStatus::Pending {
            continue;
        }
        if let Some(m) = existing
            .iter()
            .find(|m| m.covers(peak.frequency, peak.polarisation) && m.scan_result == MuxScanResult::Ok)
        {
            peak.status = PeakStatus::Skipped;
            peak.verified = Some(VerifiedMux {
                frequency: m.tuning.frequency,
                symbol_rate: m.tuning.symbol_rate,
            });
            peak.mux = Some(m.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_32_hex_chars() {
        let id = SessionId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(SessionId::random(), SessionId::random());
    }

    #[test]
    fn test_pol_select_parsing() {
        assert_eq!(PolSelect::from_char('H'), PolSelect::Horizontal);
        assert_eq!(PolSelect::from_char('v'), PolSelect::Vertical);
        assert_eq!(PolSelect::from_char('B'), PolSelect::Both);
        assert_eq!(PolSelect::from_char('x'), PolSelect::Both);
        assert_eq!(PolSelect::Both.polarisations().len(), 2);
    }

    #[test]
    fn test_peak_detect_mode_codes() {
        assert_eq!(PeakDetectMode::from_code(0), PeakDetectMode::Auto);
        assert_eq!(PeakDetectMode::from_code(1), PeakDetectMode::HardwareOnly);
        assert_eq!(PeakDetectMode::from_code(2), PeakDetectMode::SoftwareOnly);
        assert_eq!(PeakDetectMode::from_code(9), PeakDetectMode::Auto);
    }

    #[test]
    fn test_spectrum_slot_layout() {
        assert_eq!(spectrum_slot(Polarisation::Horizontal, Band::Low), 0);
        assert_eq!(spectrum_slot(Polarisation::Horizontal, Band::High), 1);
        assert_eq!(spectrum_slot(Polarisation::Vertical, Band::Low), 2);
        assert_eq!(spectrum_slot(Polarisation::Vertical, Band::High), 3);
    }

    #[test]
    fn test_progress_is_monotone_and_clamped() {
        let session = Session::new(ScanRequest {
            frontend: "fe".into(),
            satconf: None,
            network: "net".into(),
            start_freq: 10_700_000,
            end_freq: 11_700_000,
            polarisation: PolSelect::Horizontal,
            options: ScanOptions::default(),
        });
        session.set_progress(40);
        session.set_progress(20);
        assert_eq!(session.snapshot().progress, 40);
        session.set_progress(150);
        assert_eq!(session.snapshot().progress, 100);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(SessionState::Acquiring.as_str(), "acquiring");
        assert_eq!(
            serde_json::to_string(&SessionState::Complete).unwrap(),
            "\"complete\""
        );
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Scanning.is_terminal());
    }
}
