//! Spectrum acquisition
//!
//! Two strategies with one post-condition: a contiguous (frequency kHz,
//! level 0.01 dB) array in the transponder domain covering the requested
//! (polarisation, band) slot, plus whatever candidate peaks the hardware
//! volunteered.
//!
//! The direct strategy points the LNB and asks the driver for the whole
//! band in one acquisition. The Unicable strategy can only see the gateway's
//! fixed user-band IF, so it steps the band in 50 MHz slices, re-centring
//! the ODU for each, and converts every sample's IF offset back into a
//! transponder frequency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::dvb::frontend::FrontendAdapter;
use crate::dvb::properties::{
    DtvProperty, DTV_CLEAR, DTV_DELIVERY_SYSTEM, DTV_SCAN_END_FREQUENCY, DTV_SCAN_FFT_SIZE,
    DTV_SCAN_RESOLUTION, DTV_SCAN_START_FREQUENCY, DTV_SPECTRUM, SPECTRUM_METHOD_FFT, SYS_DVBS2,
};
use crate::dvb::satconf::SatConf;
use crate::dvb::{driver_freq, transponder_freq, Band, Polarisation, LNB_SLOF_KHZ};
use crate::scan::{ScanError, SpectralPeak};

/// One point of an acquired spectrum: transponder kHz, 0.01 dB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpectrumPoint {
    #[serde(rename = "f")]
    pub frequency: u32,
    #[serde(rename = "l")]
    pub level: i32,
}

/// Spectrum acquired for one (polarisation, band) slot. Grow-only during
/// acquisition, read-only afterwards.
#[derive(Debug, Clone)]
pub struct SpectrumBuffer {
    pub polarisation: Polarisation,
    pub band: Band,
    pub points: Vec<SpectrumPoint>,
}

/// Width of one Unicable slice
pub const UNICABLE_SLICE_KHZ: u32 = 50_000;
/// Hardware candidate cap per acquisition
pub const MAX_HW_CANDIDATES: usize = 512;
/// Candidates closer than this collapse into the strongest one
pub const DEDUP_WINDOW_KHZ: u32 = 2_000;

/// Direct acquisition spectrum buffer capacity
const MAX_POINTS_DIRECT: usize = 65_536 * 4;
/// Per-slice spectrum buffer capacity
const MAX_POINTS_SLICE: usize = 65_536;

const DIRECT_TIMEOUT: Duration = Duration::from_secs(60);
const DIRECT_POLLS: u32 = 10;
const SLICE_TIMEOUT: Duration = Duration::from_secs(10);
const SLICE_POLLS: u32 = 5;
/// Default spectral resolution for Unicable slices when the user left it to
/// the driver
const SLICE_RESOLUTION_KHZ: u32 = 100;

/// Acquisition inputs common to both strategies
#[derive(Debug, Clone, Copy)]
pub struct AcquireParams {
    /// User scan range, transponder kHz
    pub start_freq: u32,
    pub end_freq: u32,
    /// 0 lets the driver pick
    pub resolution_khz: u32,
    pub fft_size: u32,
}

impl AcquireParams {
    /// Clip the user range to one band's window
    fn band_range(&self, band: Band) -> (u32, u32) {
        match band {
            Band::Low => (self.start_freq, self.end_freq.min(LNB_SLOF_KHZ)),
            Band::High => (self.start_freq.max(LNB_SLOF_KHZ), self.end_freq),
        }
    }
}

fn check_stop(stop: &AtomicBool) -> Result<(), ScanError> {
    if stop.load(Ordering::Relaxed) {
        Err(ScanError::Cancelled)
    } else {
        Ok(())
    }
}

/// Arm a spectrum acquisition over a driver-domain window
fn arm_spectrum(
    adapter: &mut FrontendAdapter,
    start_driver: i32,
    end_driver: i32,
    resolution_khz: u32,
    fft_size: u32,
) -> Result<(), ScanError> {
    let mut clear = [DtvProperty::cmd_only(DTV_CLEAR)];
    adapter.set_properties(&mut clear)?;

    let mut props = [
        DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_DVBS2),
        DtvProperty::new(DTV_SCAN_START_FREQUENCY, start_driver as u32),
        DtvProperty::new(DTV_SCAN_END_FREQUENCY, end_driver as u32),
        DtvProperty::new(DTV_SCAN_RESOLUTION, resolution_khz),
        DtvProperty::new(DTV_SCAN_FFT_SIZE, if fft_size > 0 { fft_size } else { 512 }),
        DtvProperty::new(DTV_SPECTRUM, SPECTRUM_METHOD_FFT),
    ];
    adapter.set_properties(&mut props)?;
    Ok(())
}

/// Wait for the acquisition-complete event (sync bit), polling a bounded
/// number of times
fn await_spectrum_ready(
    adapter: &mut FrontendAdapter,
    timeout: Duration,
    polls: u32,
    stop: &AtomicBool,
) -> Result<(), ScanError> {
    for _ in 0..polls {
        check_stop(stop)?;
        match adapter.await_event(timeout)? {
            Some(status) if status.has_sync() => return Ok(()),
            Some(_) => continue,
            None => break,
        }
    }
    Err(ScanError::AcquireTimeout)
}

/// Direct-LNB strategy: one acquisition covering the whole band window.
pub fn acquire_direct(
    adapter: &mut FrontendAdapter,
    satconf: Option<&SatConf>,
    params: &AcquireParams,
    pol: Polarisation,
    band: Band,
    stop: &AtomicBool,
) -> Result<(SpectrumBuffer, Vec<SpectralPeak>), ScanError> {
    let (band_start, band_end) = params.band_range(band);

    let mut start_driver = driver_freq(band_start, band);
    let mut end_driver = driver_freq(band_end, band);
    if start_driver > end_driver {
        std::mem::swap(&mut start_driver, &mut end_driver);
    }

    tracing::debug!(
        pol = %pol.as_char(),
        band = band.label(),
        start_driver,
        end_driver,
        "direct spectrum acquisition"
    );

    match satconf {
        Some(sc) => adapter.send_satconf_chain(sc, pol, band)?,
        None => adapter.set_sec_basic(pol, band)?,
    }

    arm_spectrum(adapter, start_driver, end_driver, params.resolution_khz, params.fft_size)?;
    await_spectrum_ready(adapter, DIRECT_TIMEOUT, DIRECT_POLLS, stop)?;

    let raw = adapter.read_spectrum(MAX_POINTS_DIRECT, MAX_HW_CANDIDATES)?;
    tracing::info!(
        points = raw.frequencies.len(),
        candidates = raw.candidates.len(),
        "spectrum acquired"
    );

    let mut buffer = SpectrumBuffer {
        polarisation: pol,
        band,
        points: Vec::with_capacity(raw.frequencies.len()),
    };
    for (freq, level_mdb) in raw.frequencies.iter().zip(&raw.levels_mdb) {
        let tp = transponder_freq(*freq as i32, band);
        if tp < params.start_freq || tp > params.end_freq {
            continue;
        }
        // driver speaks 0.001 dB, everything above 0.01 dB
        buffer.points.push(SpectrumPoint {
            frequency: tp,
            level: level_mdb / 10,
        });
    }

    let candidates = raw
        .candidates
        .iter()
        .map(|c| SpectralPeak {
            frequency: transponder_freq(c.freq, band),
            symbol_rate: c.symbol_rate as u32,
            snr: c.snr / 10,
            level: c.level / 10,
        })
        .collect();

    Ok((buffer, candidates))
}

/// Unicable strategy: step the band window in overlapping slices around the
/// gateway's fixed user-band IF.
///
/// `on_slice(index, total, center_khz)` is invoked as each slice starts,
/// for progress attribution.
pub fn acquire_unicable(
    adapter: &mut FrontendAdapter,
    satconf: &SatConf,
    params: &AcquireParams,
    pol: Polarisation,
    band: Band,
    stop: &AtomicBool,
    on_slice: &mut dyn FnMut(u32, u32, u32),
) -> Result<(SpectrumBuffer, Vec<SpectralPeak>), ScanError> {
    let unicable = satconf
        .unicable
        .as_ref()
        .ok_or_else(|| ScanError::InvalidParam("satconf has no unicable gateway".into()))?;

    let (band_start, band_end) = params.band_range(band);
    let range = band_end.saturating_sub(band_start);
    let total_slices = range.div_ceil(UNICABLE_SLICE_KHZ).max(1);
    let scr = unicable.scr_freq_khz;
    let half_slice = UNICABLE_SLICE_KHZ / 2;
    let resolution = if params.resolution_khz > 0 {
        params.resolution_khz
    } else {
        SLICE_RESOLUTION_KHZ
    };

    tracing::info!(
        pol = %pol.as_char(),
        band = band.label(),
        slices = total_slices,
        scr,
        "unicable spectrum acquisition"
    );

    let mut buffer = SpectrumBuffer {
        polarisation: pol,
        band,
        points: Vec::new(),
    };
    let mut candidates: Vec<SpectralPeak> = Vec::new();

    for slice in 0..total_slices {
        check_stop(stop)?;

        // The last slice re-centres against the band end; it may re-cover
        // up to half a slice already scanned, and dedup cleans that up
        let mut center = band_start + slice * UNICABLE_SLICE_KHZ + half_slice;
        if center > band_end {
            center = band_end - half_slice;
        }
        on_slice(slice, total_slices, center);

        if let Err(e) = adapter.send_unicable(unicable, center, pol, band) {
            tracing::warn!(center, "unicable command failed: {e}");
            continue;
        }

        let start_if = scr.saturating_sub(half_slice) as i32;
        let end_if = (scr + half_slice) as i32;
        if let Err(e) = arm_spectrum(adapter, start_if, end_if, resolution, params.fft_size) {
            tracing::warn!(center, "slice arm failed: {e}");
            continue;
        }
        match await_spectrum_ready(adapter, SLICE_TIMEOUT, SLICE_POLLS, stop) {
            Ok(()) => {}
            Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
            Err(e) => {
                tracing::debug!(center, "slice not ready: {e}");
                continue;
            }
        }

        let raw = match adapter.read_spectrum(MAX_POINTS_SLICE, MAX_HW_CANDIDATES) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(center, "slice read failed: {e}");
                continue;
            }
        };

        tracing::debug!(
            slice,
            total_slices,
            points = raw.frequencies.len(),
            candidates = raw.candidates.len(),
            "slice acquired"
        );

        // Map each sample's IF offset from the SCR back onto the slice
        for (freq, level_mdb) in raw.frequencies.iter().zip(&raw.levels_mdb) {
            let offset = *freq as i64 - scr as i64;
            let tp = center as i64 + offset;
            if tp < params.start_freq as i64 || tp > params.end_freq as i64 {
                continue;
            }
            buffer.points.push(SpectrumPoint {
                frequency: tp as u32,
                level: level_mdb / 10,
            });
        }

        for c in &raw.candidates {
            if candidates.len() >= MAX_HW_CANDIDATES {
                break;
            }
            let tp = center as i64 + (c.freq as i64 - scr as i64);
            if tp < 0 {
                continue;
            }
            candidates.push(SpectralPeak {
                frequency: tp as u32,
                symbol_rate: c.symbol_rate as u32,
                snr: c.snr / 10,
                level: c.level / 10,
            });
        }
    }

    buffer.points.sort_by_key(|p| p.frequency);
    let candidates = dedup_candidates(candidates, DEDUP_WINDOW_KHZ);

    tracing::info!(
        points = buffer.points.len(),
        candidates = candidates.len(),
        "unicable acquisition complete"
    );
    Ok((buffer, candidates))
}

/// Collapse candidates within `window_khz` of an already-kept one, keeping
/// the strongest. Overlapping Unicable slices report the same carrier more
/// than once.
pub fn dedup_candidates(peaks: Vec<SpectralPeak>, window_khz: u32) -> Vec<SpectralPeak> {
    let mut kept: Vec<SpectralPeak> = Vec::with_capacity(peaks.len());
    for peak in peaks {
        match kept
            .iter_mut()
            .find(|k| k.frequency.abs_diff(peak.frequency) < window_khz)
        {
            Some(existing) => {
                if peak.level > existing.level {
                    *existing = peak;
                }
            }
            None => kept.push(peak),
        }
    }
    kept
}
