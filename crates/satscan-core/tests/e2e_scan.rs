//! E2E tests for the direct-LNB scan pipeline
//!
//! Drives the full session machinery - SEC sequencing, spectrum
//! acquisition, software peak detection, status reporting, cancellation -
//! against the simulated frontend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use satscan_core::dvb::frontend::{
    FrontendAdapter, FrontendError, FrontendIo, RawSpectrum, SecVoltage,
};
use satscan_core::dvb::properties::{DtvProperty, FeStatus};
use satscan_core::dvb::satconf::{DiseqcSwitch, SatConf};
use satscan_core::dvb::sim::{SimCarrier, SimFrontend, SimProbe};
use satscan_core::dvb::{Band, Polarisation};
use satscan_core::registry::{DeviceRegistry, FrontendEntry, SatconfEntry};
use satscan_core::scan::manager::ScanManager;
use satscan_core::scan::mux::MuxStore;
use satscan_core::scan::session::{
    PolSelect, ScanOptions, ScanRequest, SessionState, StatusSnapshot,
};
use satscan_core::MemoryMuxStore;

const NETWORK: &str = "net-1";

fn build_manager(frontend: Box<dyn FrontendIo>, satconf: SatConf) -> ScanManager {
    let devices = Arc::new(DeviceRegistry::new());
    devices.register_frontend(FrontendEntry {
        uuid: "fe-1".into(),
        name: "sim frontend".into(),
        enabled: true,
        adapter: Arc::new(Mutex::new(FrontendAdapter::new(frontend))),
        satconfs: vec![Arc::new(SatconfEntry {
            uuid: "sc-1".into(),
            enabled: true,
            satconf,
            networks: vec![NETWORK.into()],
        })],
    });
    let muxes: Arc<dyn MuxStore> = Arc::new(MemoryMuxStore::new(vec![NETWORK.into()]));
    ScanManager::new(devices, muxes)
}

fn request(start: u32, end: u32, pol: PolSelect) -> ScanRequest {
    ScanRequest {
        frontend: "fe-1".into(),
        satconf: Some("sc-1".into()),
        network: NETWORK.into(),
        start_freq: start,
        end_freq: end,
        polarisation: pol,
        options: ScanOptions::default(),
    }
}

fn wait_terminal(manager: &ScanManager, uuid: &str) -> StatusSnapshot {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = manager.status(uuid).expect("session exists");
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "worker stuck in {:?}",
            snapshot.state
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A 22 Msym/s carrier at 11 012 MHz, H polarisation, low band: one slot,
/// in-range spectrum, one detected peak near the carrier
#[test]
fn test_single_carrier_low_band_scan() {
    let carrier = SimCarrier::new(11_012_000, 22_000_000, Polarisation::Horizontal);
    let manager = build_manager(
        Box::new(SimFrontend::new(vec![carrier])),
        SatConf::universal("dish"),
    );

    let uuid = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Horizontal))
        .unwrap();
    let snapshot = wait_terminal(&manager, uuid.as_str());
    assert_eq!(snapshot.state, SessionState::Complete);
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.duration_ms >= 0);

    // exactly one slot: H low band has data, everything else is absent
    let buffer = manager
        .spectrum(uuid.as_str(), Polarisation::Horizontal, Band::Low)
        .expect("low band spectrum");
    assert!(manager
        .spectrum(uuid.as_str(), Polarisation::Horizontal, Band::High)
        .is_none());
    assert!(manager
        .spectrum(uuid.as_str(), Polarisation::Vertical, Band::Low)
        .is_none());

    // every stored point lies inside the user range
    assert!(buffer.points.len() > 100);
    for p in &buffer.points {
        assert!(
            (10_700_000..=11_700_000).contains(&p.frequency),
            "point at {} outside the scan range",
            p.frequency
        );
    }

    let peaks = manager.peaks(uuid.as_str()).unwrap();
    let hit = peaks
        .iter()
        .find(|p| p.frequency.abs_diff(11_012_000) <= 3_000)
        .expect("the carrier is reported");
    assert!(
        (15_000_000..=29_000_000).contains(&hit.symbol_rate),
        "symbol rate estimate {} too far off",
        hit.symbol_rate
    );
    assert_eq!(hit.polarisation, Polarisation::Horizontal);
    assert_eq!(hit.status, "pending");
}

/// Both polarisations over the full Ku range: four slots, four buffers
#[test]
fn test_full_span_scans_all_four_slots() {
    let carriers = vec![
        SimCarrier::new(11_012_000, 22_000_000, Polarisation::Horizontal),
        SimCarrier::new(12_188_000, 27_500_000, Polarisation::Vertical),
    ];
    let manager = build_manager(
        Box::new(SimFrontend::new(carriers)),
        SatConf::universal("dish"),
    );

    let uuid = manager
        .start(request(10_700_000, 12_750_000, PolSelect::Both))
        .unwrap();
    let snapshot = wait_terminal(&manager, uuid.as_str());
    assert_eq!(snapshot.state, SessionState::Complete);

    for pol in [Polarisation::Horizontal, Polarisation::Vertical] {
        for band in [Band::Low, Band::High] {
            let buffer = manager
                .spectrum(uuid.as_str(), pol, band)
                .unwrap_or_else(|| panic!("missing spectrum for {}/{}", pol.as_char(), band.label()));
            assert!(!buffer.points.is_empty());
        }
    }

    let peaks = manager.peaks(uuid.as_str()).unwrap();
    assert!(peaks.iter().any(|p| p.frequency.abs_diff(11_012_000) <= 3_000
        && p.polarisation == Polarisation::Horizontal));
    assert!(peaks.iter().any(|p| p.frequency.abs_diff(12_188_000) <= 3_000
        && p.polarisation == Polarisation::Vertical));
}

/// Observed session states only ever move forward through the lifecycle
#[test]
fn test_state_transitions_are_forward_only() {
    fn order(state: SessionState) -> u8 {
        match state {
            SessionState::Idle => 0,
            SessionState::Acquiring => 1,
            SessionState::Scanning => 2,
            SessionState::Complete | SessionState::Cancelled | SessionState::Error => 3,
        }
    }

    let manager = build_manager(
        Box::new(SimFrontend::new(vec![SimCarrier::new(
            11_012_000,
            22_000_000,
            Polarisation::Horizontal,
        )])),
        SatConf::universal("dish"),
    );
    let uuid = manager
        .start(request(10_700_000, 12_750_000, PolSelect::Both))
        .unwrap();

    let mut last_order = 0u8;
    let mut last_progress = 0u32;
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = manager.status(uuid.as_str()).unwrap();
        let o = order(snapshot.state);
        assert!(o >= last_order, "state went backwards");
        assert!(
            snapshot.progress >= last_progress,
            "progress went backwards: {} -> {}",
            last_progress,
            snapshot.progress
        );
        assert!(snapshot.progress <= 100);
        last_order = o;
        last_progress = snapshot.progress;
        if snapshot.state.is_terminal() {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A frontend without the spectrum extension fails the whole session
/// cleanly
#[test]
fn test_unsupported_driver_errors_out() {
    let manager = build_manager(
        Box::new(SimFrontend::new(Vec::new()).without_spectrum_support()),
        SatConf::universal("dish"),
    );
    let uuid = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Horizontal))
        .unwrap();
    let snapshot = wait_terminal(&manager, uuid.as_str());
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(snapshot.message.contains("spectrum"));
    assert_eq!(snapshot.peak_count, 0);
}

/// A frontend that disappears between start and the worker picking it up
/// lands the session in error
#[test]
fn test_frontend_removed_before_worker_runs() {
    let devices = Arc::new(DeviceRegistry::new());
    devices.register_frontend(FrontendEntry {
        uuid: "fe-1".into(),
        name: "sim".into(),
        enabled: true,
        adapter: Arc::new(Mutex::new(FrontendAdapter::new(Box::new(SimFrontend::new(
            Vec::new(),
        ))))),
        satconfs: vec![Arc::new(SatconfEntry {
            uuid: "sc-1".into(),
            enabled: true,
            satconf: SatConf::universal("dish"),
            networks: vec![NETWORK.into()],
        })],
    });
    let muxes: Arc<dyn MuxStore> = Arc::new(MemoryMuxStore::new(vec![NETWORK.into()]));
    let manager = ScanManager::new(Arc::clone(&devices), muxes);

    // race the worker: removal usually wins because the worker thread has
    // to be scheduled first; accept either outcome but require consistency
    let uuid = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Horizontal))
        .unwrap();
    devices.remove_frontend("fe-1");
    let snapshot = wait_terminal(&manager, uuid.as_str());
    match snapshot.state {
        SessionState::Error => assert!(snapshot.message.contains("Frontend")),
        SessionState::Complete => {}
        other => panic!("unexpected terminal state {other:?}"),
    }
}

/// Delegating wrapper that makes every readiness wait slow, so
/// cancellation has a window to land between slots
struct SlowFrontend {
    inner: SimFrontend,
    event_delay: Duration,
}

impl FrontendIo for SlowFrontend {
    fn clear(&mut self) -> Result<(), FrontendError> {
        self.inner.clear()
    }
    fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.inner.set_properties(props)
    }
    fn get_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.inner.get_properties(props)
    }
    fn set_voltage(&mut self, voltage: SecVoltage) -> Result<(), FrontendError> {
        self.inner.set_voltage(voltage)
    }
    fn set_tone(&mut self, on: bool) -> Result<(), FrontendError> {
        self.inner.set_tone(on)
    }
    fn diseqc_send(&mut self, msg: &[u8]) -> Result<(), FrontendError> {
        self.inner.diseqc_send(msg)
    }
    fn await_event(&mut self, timeout: Duration) -> Result<Option<FeStatus>, FrontendError> {
        std::thread::sleep(self.event_delay.min(timeout));
        self.inner.await_event(timeout)
    }
    fn read_spectrum(
        &mut self,
        max_points: usize,
        max_candidates: usize,
    ) -> Result<RawSpectrum, FrontendError> {
        self.inner.read_spectrum(max_points, max_candidates)
    }
    fn read_isi_bitset(&mut self) -> Result<Vec<u8>, FrontendError> {
        self.inner.read_isi_bitset()
    }
    fn supports_spectrum(&self) -> bool {
        self.inner.supports_spectrum()
    }
}

/// Cancel shortly after start: the session ends cancelled with partial but
/// self-consistent data
#[test]
fn test_cancellation_between_slots() {
    let carriers = vec![
        SimCarrier::new(11_012_000, 22_000_000, Polarisation::Horizontal),
        SimCarrier::new(11_100_000, 22_000_000, Polarisation::Vertical),
    ];
    let slow = SlowFrontend {
        inner: SimFrontend::new(carriers),
        event_delay: Duration::from_millis(300),
    };
    let manager = build_manager(Box::new(slow), SatConf::universal("dish"));

    let uuid = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Both))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(manager.cancel(uuid.as_str()));

    let snapshot = wait_terminal(&manager, uuid.as_str());
    assert_eq!(snapshot.state, SessionState::Cancelled);
    assert!(snapshot.progress < 100);

    // whatever was accumulated stays queryable
    let peaks = manager.peaks(uuid.as_str()).unwrap();
    assert!(peaks.len() as u32 == snapshot.peak_count);
    assert!(manager.release(uuid.as_str()));
}

/// Each new scan forces a fresh DiSEqC sequence even for the same switch
/// selection
#[test]
fn test_sec_cache_invalidated_per_scan() {
    let sim = SimFrontend::new(vec![SimCarrier::new(
        11_012_000,
        22_000_000,
        Polarisation::Horizontal,
    )]);
    let probe: SimProbe = sim.probe();
    let satconf = SatConf::universal("switched dish").with_switch(DiseqcSwitch {
        committed: 1,
        uncommitted: -1,
        uncommitted_first: false,
    });
    let manager = build_manager(Box::new(sim), satconf);

    let first = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Horizontal))
        .unwrap();
    wait_terminal(&manager, first.as_str());
    let frames_after_first = probe.diseqc_frames().len();
    assert!(frames_after_first > 0, "switch frames were sent");

    let second = manager
        .start(request(10_700_000, 11_700_000, PolSelect::Horizontal))
        .unwrap();
    wait_terminal(&manager, second.as_str());
    let frames_after_second = probe.diseqc_frames().len();
    assert!(
        frames_after_second > frames_after_first,
        "second scan must resend the chain"
    );
}

/// Shutdown stops and joins every worker
#[test]
fn test_shutdown_joins_workers() {
    let slow = SlowFrontend {
        inner: SimFrontend::new(Vec::new()),
        event_delay: Duration::from_millis(200),
    };
    let manager = build_manager(Box::new(slow), SatConf::universal("dish"));
    let uuid = manager
        .start(request(10_700_000, 12_750_000, PolSelect::Both))
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    manager.shutdown();
    assert!(manager.status(uuid.as_str()).is_none());
}
