//! Simulated frontend
//!
//! Implements [`FrontendIo`] over a configured set of carriers so the whole
//! pipeline - SEC sequencing, spectrum acquisition, peak detection, blind
//! tuning, ISI enumeration - runs without hardware. Used by the integration
//! tests and as the demo device when no DVB adapter is present.
//!
//! The simulation is driven purely by what arrives over the trait: supply
//! voltage selects polarisation, the 22 kHz tone selects the band, and
//! Unicable ODU frames are decoded back into a slice centre the same way a
//! gateway would, quantisation included.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dvb::frontend::{FrontendError, FrontendIo, RawSpectrum, SecVoltage};
use crate::dvb::properties::{
    DriverCandidate, DtvProperty, FeStatus, PlsSearchCodes, DTV_ALGORITHM, DTV_CLEAR,
    DTV_DELIVERY_SYSTEM, DTV_FREQUENCY, DTV_INNER_FEC, DTV_ISI_LIST, DTV_MATYPE, DTV_MODULATION,
    DTV_PILOT, DTV_PLS_SEARCH_LIST, DTV_ROLLOFF, DTV_SCAN_END_FREQUENCY, DTV_SCAN_RESOLUTION,
    DTV_SCAN_START_FREQUENCY, DTV_SEARCH_RANGE, DTV_SPECTRUM, DTV_STREAM_ID, DTV_SYMBOL_RATE,
    DTV_TUNE, FE_HAS_CARRIER, FE_HAS_LOCK, FE_HAS_SIGNAL, FE_HAS_SYNC,
};
use crate::dvb::{
    encode_isi_bitset, DeliverySystem, FecRate, Modulation, Pilot, PlsMode, Polarisation, Rolloff,
    LNB_LOF_HIGH_KHZ, LNB_LOF_LOW_KHZ,
};

/// One synthetic carrier on the simulated satellite
#[derive(Debug, Clone)]
pub struct SimCarrier {
    pub frequency_khz: u32,
    pub symbol_rate: u32,
    pub polarisation: Polarisation,
    /// Peak level in 0.01 dB
    pub level_cdb: i32,
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub fec: FecRate,
    pub rolloff: Rolloff,
    pub pilot: Pilot,
    /// Input stream identifiers; empty means a single-stream carrier
    pub stream_ids: Vec<u8>,
    pub pls_mode: PlsMode,
    pub pls_code: u32,
    /// Carrier payload is GSE rather than a transport stream
    pub gse: bool,
}

impl SimCarrier {
    pub fn new(frequency_khz: u32, symbol_rate: u32, polarisation: Polarisation) -> SimCarrier {
        SimCarrier {
            frequency_khz,
            symbol_rate,
            polarisation,
            level_cdb: -4000,
            delivery_system: DeliverySystem::DvbS2,
            modulation: Modulation::Psk8,
            fec: FecRate::F3_4,
            rolloff: Rolloff::R35,
            pilot: Pilot::On,
            stream_ids: Vec::new(),
            pls_mode: PlsMode::Root,
            pls_code: 1,
            gse: false,
        }
    }

    /// The -6 dB half width of the carrier shoulder, kHz
    fn half6_khz(&self) -> u32 {
        (self.symbol_rate / 1600).max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct OduSelection {
    center_khz: u32,
    pol: Polarisation,
}

#[derive(Debug, Default)]
struct SimState {
    voltage: Option<SecVoltage>,
    tone_on: bool,
    odu: Option<OduSelection>,
    params: std::collections::HashMap<u32, u32>,
    pls_list: Vec<u32>,
    event_pending: Option<FeStatus>,
    spectrum_armed: bool,
    locked: Option<usize>,
    diseqc_log: Vec<Vec<u8>>,
    tune_count: u32,
}

/// Shared inspection handle for tests
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    pub fn diseqc_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().diseqc_log.clone()
    }

    pub fn tune_count(&self) -> u32 {
        self.state.lock().unwrap().tune_count
    }
}

pub struct SimFrontend {
    carriers: Vec<SimCarrier>,
    noise_floor_cdb: i32,
    default_resolution_khz: u32,
    emit_candidates: bool,
    spectrum_capable: bool,
    unicable_scr_khz: Option<u32>,
    state: Arc<Mutex<SimState>>,
}

impl SimFrontend {
    pub fn new(carriers: Vec<SimCarrier>) -> SimFrontend {
        SimFrontend {
            carriers,
            noise_floor_cdb: -7000,
            default_resolution_khz: 500,
            emit_candidates: false,
            spectrum_capable: true,
            unicable_scr_khz: None,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Report hardware candidate peaks alongside the spectrum
    pub fn with_candidates(mut self) -> SimFrontend {
        self.emit_candidates = true;
        self
    }

    /// Pretend the driver lacks the spectrum extension
    pub fn without_spectrum_support(mut self) -> SimFrontend {
        self.spectrum_capable = false;
        self
    }

    /// Make ODU decoding exact for a known gateway output frequency
    pub fn with_unicable_scr(mut self, scr_freq_khz: u32) -> SimFrontend {
        self.unicable_scr_khz = Some(scr_freq_khz);
        self
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// Polarisation currently selected by supply voltage or the last ODU
    /// command
    fn selected_pol(state: &SimState) -> Polarisation {
        if let Some(odu) = state.odu {
            return odu.pol;
        }
        match state.voltage {
            Some(SecVoltage::V18) => Polarisation::Horizontal,
            _ => Polarisation::Vertical,
        }
    }

    fn selected_lof(state: &SimState) -> u32 {
        if state.tone_on {
            LNB_LOF_HIGH_KHZ
        } else {
            LNB_LOF_LOW_KHZ
        }
    }

    /// Map a driver-domain IF sample position to a transponder frequency
    fn if_to_transponder(state: &SimState, scr_khz: Option<u32>, if_khz: u32) -> i64 {
        match (state.odu, scr_khz) {
            (Some(odu), Some(scr)) => odu.center_khz as i64 + (if_khz as i64 - scr as i64),
            _ => if_khz as i64 + Self::selected_lof(state) as i64,
        }
    }

    /// Carrier shoulder model: a gentle 6 dB slope out to the symbol-rate
    /// bandwidth, then a steep skirt down to the noise floor
    fn level_at(&self, tp_khz: i64, pol: Polarisation) -> i32 {
        let mut level = self.noise_floor_cdb;
        for c in self.carriers.iter().filter(|c| c.polarisation == pol) {
            let d = (tp_khz - c.frequency_khz as i64).unsigned_abs() as u32;
            let half6 = c.half6_khz();
            let skirt = half6 / 4 + 1;
            let lvl = if d <= half6 {
                c.level_cdb - (600 * d / half6) as i32
            } else if d <= half6 + skirt {
                let shoulder = c.level_cdb - 600;
                let drop = (shoulder - self.noise_floor_cdb) as i64 * (d - half6) as i64
                    / skirt as i64;
                shoulder - drop as i32
            } else {
                continue;
            };
            level = level.max(lvl);
        }
        level
    }

    /// Decode an ODU frame the way the gateway would, including the tuning
    /// word quantisation
    fn decode_odu(&self, msg: &[u8]) -> Option<OduSelection> {
        let scr_khz = self.unicable_scr_khz?;
        match msg {
            [0xE0, 0x10, 0x5A | 0x5C, d1, d2, ..] => {
                let t = (((*d1 & 0x3) as u32) << 8) | *d2 as u32;
                let if_khz = (t + 350) * 4_000 - scr_khz;
                let band_high = d1 & 0x04 != 0;
                let pol = if d1 & 0x08 != 0 {
                    Polarisation::Horizontal
                } else {
                    Polarisation::Vertical
                };
                let lof = if band_high {
                    LNB_LOF_HIGH_KHZ
                } else {
                    LNB_LOF_LOW_KHZ
                };
                Some(OduSelection {
                    center_khz: if_khz + lof,
                    pol,
                })
            }
            [0x70 | 0x71, d1, d2, d3, ..] => {
                let t = (((*d1 & 0x7) as u32) << 8) | *d2 as u32;
                let if_khz = (t + 100) * 1_000;
                let band_high = d3 & 0x01 != 0;
                let pol = if d3 & 0x02 != 0 {
                    Polarisation::Horizontal
                } else {
                    Polarisation::Vertical
                };
                let lof = if band_high {
                    LNB_LOF_HIGH_KHZ
                } else {
                    LNB_LOF_LOW_KHZ
                };
                Some(OduSelection {
                    center_khz: if_khz + lof,
                    pol,
                })
            }
            _ => None,
        }
    }

    fn evaluate_blind_tune(&self, state: &mut SimState) {
        state.tune_count += 1;
        state.locked = None;

        let target_if = state.params.get(&DTV_FREQUENCY).copied().unwrap_or(0);
        let search_range = state.params.get(&DTV_SEARCH_RANGE).copied().unwrap_or(8_000_000);
        let pol = Self::selected_pol(state);
        let target_tp = Self::if_to_transponder(state, self.unicable_scr_khz, target_if);

        // Search window is a total width around the target
        let half_range_khz = (search_range / 2_000).max(1_000) as i64;

        let hit = self.carriers.iter().position(|c| {
            c.polarisation == pol
                && (c.frequency_khz as i64 - target_tp).abs() <= half_range_khz
                && self.pls_reachable(state, c)
        });

        match hit {
            Some(idx) => {
                state.locked = Some(idx);
                state.event_pending = Some(FeStatus(
                    FE_HAS_SIGNAL | FE_HAS_CARRIER | FE_HAS_SYNC | FE_HAS_LOCK,
                ));
            }
            None => {
                // Carrier hunt comes up empty: no event until the caller's
                // deadline passes
                state.event_pending = None;
            }
        }
    }

    /// A scrambled carrier locks only when its code is in the search list
    fn pls_reachable(&self, state: &SimState, carrier: &SimCarrier) -> bool {
        if carrier.pls_code <= 1 && carrier.pls_mode == PlsMode::Root {
            return true;
        }
        let encoded = crate::dvb::encode_pls(carrier.pls_mode, carrier.pls_code);
        state.pls_list.contains(&encoded)
    }

    fn readback_value(&self, state: &SimState, cmd: u32) -> u32 {
        let carrier = state.locked.map(|i| &self.carriers[i]);
        let Some(c) = carrier else { return 0 };
        match cmd {
            DTV_FREQUENCY => match (state.odu, self.unicable_scr_khz) {
                // A gateway reports the fixed user-band IF
                (Some(_), Some(scr)) => scr,
                _ => c.frequency_khz - Self::selected_lof(state),
            },
            DTV_SYMBOL_RATE => c.symbol_rate,
            DTV_MODULATION => c.modulation.driver_code(),
            DTV_INNER_FEC => c.fec.driver_code(),
            DTV_DELIVERY_SYSTEM => c.delivery_system.driver_code(),
            DTV_ROLLOFF => c.rolloff.driver_code(),
            DTV_PILOT => c.pilot.driver_code(),
            DTV_STREAM_ID => match c.stream_ids.first() {
                Some(&isi) => 256 + isi as u32,
                None => 511,
            },
            DTV_MATYPE => {
                if c.stream_ids.is_empty() {
                    // Plain transponders report no baseband header info
                    0
                } else {
                    let matype_byte: u32 = if c.gse { 0x40 } else { 0xC0 };
                    ((c.pls_mode.driver_code() & 0x3) << 26)
                        | ((c.pls_code & 0x3FFFF) << 8)
                        | matype_byte
                }
            }
            _ => 0,
        }
    }
}

impl FrontendIo for SimFrontend {
    fn clear(&mut self) -> Result<(), FrontendError> {
        let mut state = self.state.lock().unwrap();
        state.params.clear();
        state.pls_list.clear();
        state.locked = None;
        state.event_pending = None;
        state.spectrum_armed = false;
        Ok(())
    }

    fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        let mut state = self.state.lock().unwrap();
        for prop in props.iter() {
            let cmd = prop.cmd;
            match cmd {
                DTV_CLEAR => {
                    state.params.clear();
                    state.pls_list.clear();
                    state.locked = None;
                    state.event_pending = None;
                    state.spectrum_armed = false;
                }
                DTV_PLS_SEARCH_LIST => {
                    // The payload carries a pointer to the caller's code
                    // array, valid for the duration of the transaction
                    let member = unsafe {
                        std::ptr::read_unaligned(prop.data.as_ptr() as *const PlsSearchCodes)
                    };
                    if !member.codes.is_null() {
                        let codes = unsafe {
                            std::slice::from_raw_parts(member.codes, member.num_codes as usize)
                        };
                        state.pls_list = codes.to_vec();
                    }
                }
                DTV_SPECTRUM => {
                    state.params.insert(cmd, prop.value());
                    state.spectrum_armed = true;
                    state.event_pending = Some(FeStatus(FE_HAS_SIGNAL | FE_HAS_SYNC));
                }
                DTV_TUNE => {
                    if state.params.contains_key(&DTV_ALGORITHM) {
                        self.evaluate_blind_tune(&mut state);
                    }
                }
                _ => {
                    state.params.insert(cmd, prop.value());
                }
            }
        }
        Ok(())
    }

    fn get_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        let state = self.state.lock().unwrap();
        for prop in props.iter_mut() {
            let cmd = prop.cmd;
            match cmd {
                DTV_SCAN_START_FREQUENCY => {
                    if !self.spectrum_capable {
                        return Err(FrontendError::Transaction(std::io::Error::from(
                            std::io::ErrorKind::InvalidInput,
                        )));
                    }
                }
                DTV_ISI_LIST => {
                    if let Some(c) = state.locked.map(|i| &self.carriers[i]) {
                        if !c.stream_ids.is_empty() {
                            let bitset = encode_isi_bitset(&c.stream_ids);
                            let used = c
                                .stream_ids
                                .iter()
                                .map(|&i| i as usize / 8 + 1)
                                .max()
                                .unwrap_or(0)
                                .min(32);
                            prop.data[..used].copy_from_slice(&bitset[..used]);
                            prop.set_buffer_len(used);
                        } else {
                            prop.set_buffer_len(0);
                        }
                    } else {
                        prop.set_buffer_len(0);
                    }
                }
                other => {
                    let v = self.readback_value(&state, other);
                    prop.set_value(v);
                }
            }
        }
        Ok(())
    }

    fn set_voltage(&mut self, voltage: SecVoltage) -> Result<(), FrontendError> {
        self.state.lock().unwrap().voltage = Some(voltage);
        Ok(())
    }

    fn set_tone(&mut self, on: bool) -> Result<(), FrontendError> {
        self.state.lock().unwrap().tone_on = on;
        Ok(())
    }

    fn diseqc_send(&mut self, msg: &[u8]) -> Result<(), FrontendError> {
        let mut state = self.state.lock().unwrap();
        state.diseqc_log.push(msg.to_vec());
        match self.decode_odu(msg) {
            Some(sel) => state.odu = Some(sel),
            // Any plain switch or rotor frame means we left unicable mode
            None => state.odu = None,
        }
        Ok(())
    }

    fn await_event(&mut self, _timeout: Duration) -> Result<Option<FeStatus>, FrontendError> {
        Ok(self.state.lock().unwrap().event_pending.take())
    }

    fn read_spectrum(
        &mut self,
        max_points: usize,
        max_candidates: usize,
    ) -> Result<RawSpectrum, FrontendError> {
        let state = self.state.lock().unwrap();
        if !state.spectrum_armed && state.params.get(&DTV_SPECTRUM).is_none() {
            return Ok(RawSpectrum::default());
        }

        let start = state.params.get(&DTV_SCAN_START_FREQUENCY).copied().unwrap_or(0);
        let end = state.params.get(&DTV_SCAN_END_FREQUENCY).copied().unwrap_or(0);
        let res = match state.params.get(&DTV_SCAN_RESOLUTION).copied() {
            Some(0) | None => self.default_resolution_khz,
            Some(r) => r,
        };
        if end <= start || res == 0 {
            return Ok(RawSpectrum::default());
        }

        let pol = Self::selected_pol(&state);
        let mut spectrum = RawSpectrum::default();
        let mut if_khz = start;
        while if_khz <= end && spectrum.frequencies.len() < max_points {
            let tp = Self::if_to_transponder(&state, self.unicable_scr_khz, if_khz);
            spectrum.frequencies.push(if_khz);
            // levels leave the driver in 0.001 dB
            spectrum.levels_mdb.push(self.level_at(tp, pol) * 10);
            if_khz += res;
        }

        if self.emit_candidates {
            for c in self.carriers.iter().filter(|c| c.polarisation == pol) {
                let tp_start = Self::if_to_transponder(&state, self.unicable_scr_khz, start);
                let tp_end = Self::if_to_transponder(&state, self.unicable_scr_khz, end);
                let tp = c.frequency_khz as i64;
                if tp < tp_start || tp > tp_end {
                    continue;
                }
                if spectrum.candidates.len() >= max_candidates {
                    break;
                }
                let if_freq = match (state.odu, self.unicable_scr_khz) {
                    (Some(odu), Some(scr)) => scr as i64 + (tp - odu.center_khz as i64),
                    _ => tp - Self::selected_lof(&state) as i64,
                };
                spectrum.candidates.push(DriverCandidate {
                    freq: if_freq as i32,
                    symbol_rate: c.symbol_rate as i32,
                    snr: (c.level_cdb - self.noise_floor_cdb) * 10,
                    level: c.level_cdb * 10,
                });
            }
        }

        Ok(spectrum)
    }

    fn read_isi_bitset(&mut self) -> Result<Vec<u8>, FrontendError> {
        let mut prop = DtvProperty::cmd_only(DTV_ISI_LIST);
        self.get_properties(std::slice::from_mut(&mut prop))?;
        Ok(prop.buffer().to_vec())
    }

    fn supports_spectrum(&self) -> bool {
        self.spectrum_capable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrier() -> SimCarrier {
        SimCarrier::new(11_012_000, 22_000_000, Polarisation::Horizontal)
    }

    #[test]
    fn test_level_shape_has_6db_shoulder_at_symbol_rate_bandwidth() {
        let sim = SimFrontend::new(vec![carrier()]);
        let peak = sim.level_at(11_012_000, Polarisation::Horizontal);
        assert_eq!(peak, -4000);
        // -6 dB point at sr/1600 kHz from centre
        let shoulder = sim.level_at(11_012_000 + 13_750, Polarisation::Horizontal);
        assert_eq!(shoulder, -4600);
        // far away it is all noise floor
        assert_eq!(sim.level_at(11_300_000, Polarisation::Horizontal), -7000);
        // wrong polarisation sees nothing
        assert_eq!(sim.level_at(11_012_000, Polarisation::Vertical), -7000);
    }

    #[test]
    fn test_direct_spectrum_follows_voltage_and_tone() {
        let mut sim = SimFrontend::new(vec![carrier()]);
        sim.set_voltage(SecVoltage::V18).unwrap();
        sim.set_tone(false).unwrap();
        let mut props = [
            DtvProperty::new(DTV_SCAN_START_FREQUENCY, 950_000),
            DtvProperty::new(DTV_SCAN_END_FREQUENCY, 1_950_000),
            DtvProperty::new(DTV_SCAN_RESOLUTION, 500),
            DtvProperty::new(DTV_SPECTRUM, 1),
        ];
        sim.set_properties(&mut props).unwrap();
        assert!(sim.await_event(Duration::from_secs(1)).unwrap().is_some());

        let raw = sim.read_spectrum(10_000, 16).unwrap();
        assert!(!raw.frequencies.is_empty());
        // Peak IF = 11 012 000 - 9 750 000 = 1 262 000
        let (idx, _) = raw
            .levels_mdb
            .iter()
            .enumerate()
            .max_by_key(|(_, &l)| l)
            .unwrap();
        assert_eq!(raw.frequencies[idx], 1_262_000);
        assert_eq!(*raw.levels_mdb.iter().max().unwrap(), -40_000);
    }

    #[test]
    fn test_blind_tune_locks_and_reads_back() {
        let mut c = carrier();
        c.stream_ids = vec![0, 1, 2];
        let mut sim = SimFrontend::new(vec![c]);
        sim.set_voltage(SecVoltage::V18).unwrap();
        sim.set_tone(false).unwrap();

        let mut props = [
            DtvProperty::new(DTV_ALGORITHM, 2),
            DtvProperty::new(DTV_SEARCH_RANGE, 11_000_000),
            DtvProperty::new(DTV_SYMBOL_RATE, 22_000_000),
            DtvProperty::new(DTV_FREQUENCY, 1_262_500),
            DtvProperty::new(DTV_TUNE, 0),
        ];
        sim.set_properties(&mut props).unwrap();
        let status = sim.await_event(Duration::from_secs(1)).unwrap().unwrap();
        assert!(status.is_locked());

        let mut get = [
            DtvProperty::cmd_only(DTV_SYMBOL_RATE),
            DtvProperty::cmd_only(DTV_STREAM_ID),
        ];
        sim.get_properties(&mut get).unwrap();
        assert_eq!(get[0].value(), 22_000_000);
        assert_eq!(get[1].value(), 256);

        let bitset = sim.read_isi_bitset().unwrap();
        assert_eq!(crate::dvb::decode_isi_bitset(&bitset), vec![0, 1, 2]);
    }

    #[test]
    fn test_blind_tune_misses_outside_search_range() {
        let mut sim = SimFrontend::new(vec![carrier()]);
        sim.set_voltage(SecVoltage::V18).unwrap();
        sim.set_tone(false).unwrap();
        let mut props = [
            DtvProperty::new(DTV_ALGORITHM, 2),
            DtvProperty::new(DTV_SEARCH_RANGE, 8_000_000),
            DtvProperty::new(DTV_FREQUENCY, 1_500_000),
            DtvProperty::new(DTV_TUNE, 0),
        ];
        sim.set_properties(&mut props).unwrap();
        assert!(sim.await_event(Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn test_odu_decode_en50607() {
        let mut sim = SimFrontend::new(vec![carrier()]).with_unicable_scr(1_400_000);
        // T for IF 1 262 000 -> 1262 - 100 = 1162
        let t: u16 = 1162;
        let msg = [0x70, ((3 << 3) | (t >> 8) as u8 & 0x7), (t & 0xFF) as u8, 0x02];
        sim.diseqc_send(&msg).unwrap();
        let state = sim.state.lock().unwrap();
        let odu = state.odu.unwrap();
        assert_eq!(odu.center_khz, 11_012_000);
        assert_eq!(odu.pol, Polarisation::Horizontal);
    }
}
