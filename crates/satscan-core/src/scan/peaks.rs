//! Software peak detection over an acquired spectrum
//!
//! Deterministic and allocation-light. Runs when the user forces software
//! detection, or in auto mode when the hardware reported no candidates.
//!
//! The detector finds local maxima above a noise-floor threshold, merges
//! neighbours that lack a real valley between them (sidelobes and shoulder
//! artefacts of wide carriers), then estimates each survivor's symbol rate
//! from its -6 dB bandwidth.

use crate::scan::SpectralPeak;
use crate::scan::spectrum::SpectrumPoint;

/// Threshold above the spectrum minimum for candidate acceptance: 10 dB
pub const DETECT_THRESHOLD_CDB: i32 = 1000;
/// A valley must dip 4 dB below the weaker neighbour to separate two peaks
const MIN_VALLEY_DEPTH_CDB: i32 = 400;
/// Local-maximum window, samples
const WINDOW: usize = 20;
/// Hard cap on candidates per buffer
pub const MAX_PEAKS: usize = 512;

const SYMBOL_RATE_MIN: u32 = 2_000_000;
const SYMBOL_RATE_MAX: u32 = 45_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    idx: usize,
    level: i32,
}

/// Detect candidate carriers in one spectrum buffer.
///
/// Needs at least 100 samples to say anything. `threshold_cdb` is the
/// acceptance margin above the buffer minimum in 0.01 dB units.
pub fn detect_peaks(
    points: &[SpectrumPoint],
    max_peaks: usize,
    threshold_cdb: i32,
) -> Vec<SpectralPeak> {
    if points.len() < 100 {
        return Vec::new();
    }
    let n = points.len();

    let min_level = points.iter().map(|p| p.level).min().unwrap_or(0);
    let max_level = points.iter().map(|p| p.level).max().unwrap_or(0);
    let peak_threshold = min_level + threshold_cdb;

    tracing::debug!(
        min = min_level,
        max = max_level,
        threshold = peak_threshold,
        "peak detection over {n} samples"
    );

    let candidates = local_maxima(points, peak_threshold);
    tracing::debug!("{} candidates above threshold", candidates.len());
    if candidates.is_empty() {
        return Vec::new();
    }

    let merged = valley_merge(points, candidates);
    tracing::debug!("{} peaks after valley merge", merged.len());

    let mut out = Vec::new();
    for cand in merged.into_iter().take(max_peaks) {
        out.push(measure_peak(points, cand, min_level));
    }
    out
}

/// Sweep for samples that top every neighbour within the window. After an
/// acceptance the sweep skips half a window to avoid re-accepting the same
/// summit.
fn local_maxima(points: &[SpectrumPoint], threshold: i32) -> Vec<Candidate> {
    let n = points.len();
    let half_win = WINDOW / 2;
    let mut candidates = Vec::new();

    let mut i = half_win;
    while i < n - half_win && candidates.len() < MAX_PEAKS {
        let level = points[i].level;
        if level >= threshold {
            let is_max = (i - half_win..=i + half_win)
                .all(|j| j == i || points[j].level <= level);
            if is_max {
                candidates.push(Candidate { idx: i, level });
                i += half_win;
            }
        }
        i += 1;
    }
    candidates
}

/// Merge neighbouring candidates left to right: a pair stays separate only
/// when the spectrum dips at least 4 dB below the weaker of the two
/// somewhere between them; otherwise the stronger absorbs the weaker.
fn valley_merge(points: &[SpectrumPoint], candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::with_capacity(candidates.len());

    for curr in candidates {
        let Some(prev) = merged.last_mut() else {
            merged.push(curr);
            continue;
        };

        let weaker = prev.level.min(curr.level);
        let valley = points[prev.idx + 1..curr.idx]
            .iter()
            .map(|p| p.level)
            .min()
            .unwrap_or(weaker);

        if weaker - valley >= MIN_VALLEY_DEPTH_CDB {
            merged.push(curr);
        } else if curr.level > prev.level {
            *prev = curr;
        }
    }
    merged
}

/// Estimate bandwidth from the -6 dB points and derive centre frequency and
/// symbol rate.
///
/// The centre is the midpoint of the two edges rather than the argmax;
/// FFT leakage skews the summit but not the shoulders. The symbol rate
/// assumes the usual 25 % excess bandwidth (SR = BW / 1.25, i.e. kHz * 800).
fn measure_peak(points: &[SpectrumPoint], cand: Candidate, min_level: i32) -> SpectralPeak {
    let n = points.len();
    let edge_level = cand.level - 600;

    let mut left = cand.idx;
    for j in (0..=cand.idx).rev() {
        left = j;
        if points[j].level < edge_level {
            break;
        }
    }
    let mut right = cand.idx;
    for j in cand.idx..n {
        right = j;
        if points[j].level < edge_level {
            break;
        }
    }

    let bandwidth_khz = points[right].frequency - points[left].frequency;
    let center = (points[left].frequency + points[right].frequency) / 2;
    let symbol_rate = (bandwidth_khz * 800).clamp(SYMBOL_RATE_MIN, SYMBOL_RATE_MAX);

    SpectralPeak {
        frequency: center,
        symbol_rate,
        level: cand.level,
        snr: cand.level - min_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: i32 = -7000;

    fn flat(n: usize, start_khz: u32, step_khz: u32) -> Vec<SpectrumPoint> {
        (0..n)
            .map(|i| SpectrumPoint {
                frequency: start_khz + i as u32 * step_khz,
                level: FLOOR,
            })
            .collect()
    }

    /// Carve a carrier-shaped bump: 6 dB shoulder out to `half6` samples,
    /// then a skirt down to the floor.
    fn add_bump(points: &mut [SpectrumPoint], center: usize, half6: usize, peak: i32) {
        let skirt = half6 / 4 + 1;
        for (i, p) in points.iter_mut().enumerate() {
            let d = center.abs_diff(i);
            let lvl = if d <= half6 {
                peak - (600 * d / half6) as i32
            } else if d <= half6 + skirt {
                let shoulder = peak - 600;
                shoulder - ((shoulder - FLOOR) * (d - half6) as i32 / skirt as i32)
            } else {
                continue;
            };
            p.level = p.level.max(lvl);
        }
    }

    #[test]
    fn test_too_few_samples_yields_nothing() {
        let mut points = flat(99, 10_700_000, 500);
        add_bump(&mut points, 50, 10, -4000);
        assert!(detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB).is_empty());
    }

    #[test]
    fn test_flat_spectrum_yields_nothing() {
        let points = flat(2048, 10_700_000, 500);
        assert!(detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB).is_empty());
    }

    #[test]
    fn test_single_triangular_bump() {
        // Constant floor with an 8 000 kHz-wide bump at sample 1024 rising
        // to -4000: exactly one peak, centred, SR from the -6 dB width
        let step = 100u32;
        let mut points = flat(2048, 10_700_000, step);
        add_bump(&mut points, 1024, 40, -4000); // 40 * 100 kHz = 4 MHz half width

        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 1);
        let p = peaks[0];

        let expected_center = 10_700_000 + 1024 * step;
        assert!(
            p.frequency.abs_diff(expected_center) <= step,
            "centre {} not within one sample of {}",
            p.frequency,
            expected_center
        );
        assert!(
            (5_000_000..=7_000_000).contains(&p.symbol_rate),
            "symbol rate {} outside [5e6, 7e6]",
            p.symbol_rate
        );
        assert_eq!(p.snr, 3000);
        assert_eq!(p.level, -4000);
    }

    #[test]
    fn test_detected_levels_and_rates_are_bounded() {
        let mut points = flat(4096, 10_700_000, 250);
        add_bump(&mut points, 600, 60, -3500);
        add_bump(&mut points, 1800, 20, -4800);
        add_bump(&mut points, 3200, 110, -3000);

        let min = points.iter().map(|p| p.level).min().unwrap();
        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 3);
        for p in &peaks {
            assert!(p.level >= min + DETECT_THRESHOLD_CDB);
            assert!((2_000_000..=45_000_000).contains(&p.symbol_rate));
            assert_eq!(p.snr, p.level - min);
        }
    }

    #[test]
    fn test_close_bumps_without_valley_merge_to_stronger() {
        let mut points = flat(1024, 10_700_000, 100);
        // Two summits 8 samples apart on one wide pedestal: the dip between
        // them is far less than 4 dB
        add_bump(&mut points, 500, 40, -4000);
        add_bump(&mut points, 508, 40, -4200);

        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].level, -4000);
    }

    #[test]
    fn test_separated_bumps_stay_separate() {
        let mut points = flat(2048, 10_700_000, 100);
        add_bump(&mut points, 500, 30, -4000);
        add_bump(&mut points, 1500, 30, -4300);

        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 2);
        assert!(peaks[0].frequency < peaks[1].frequency);
    }

    #[test]
    fn test_valley_merge_is_idempotent() {
        let mut points = flat(2048, 10_700_000, 100);
        add_bump(&mut points, 300, 30, -4000);
        add_bump(&mut points, 330, 30, -4100);
        add_bump(&mut points, 900, 25, -3800);
        add_bump(&mut points, 1700, 50, -4500);

        let candidates = local_maxima(&points, FLOOR + DETECT_THRESHOLD_CDB);
        let once = valley_merge(&points, candidates);
        let twice = valley_merge(&points, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_kept_pairs_are_separated_by_real_valleys() {
        // Two summits on one pedestal collapse into one peak; the far bump
        // survives because the spectrum dips 4 dB below it in between
        let mut points = flat(2048, 10_700_000, 100);
        add_bump(&mut points, 400, 35, -4000);
        add_bump(&mut points, 420, 35, -4050);
        add_bump(&mut points, 1200, 35, -4400);

        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 2);
        for pair in peaks.windows(2) {
            let weaker = pair[0].level.min(pair[1].level);
            let valley = points
                .iter()
                .filter(|p| p.frequency > pair[0].frequency && p.frequency < pair[1].frequency)
                .map(|p| p.level)
                .min()
                .unwrap();
            assert!(
                valley <= weaker - MIN_VALLEY_DEPTH_CDB,
                "kept pair without a separating valley: {} vs {}",
                valley,
                weaker
            );
        }
    }

    #[test]
    fn test_candidate_cap() {
        // A comb of narrow spikes; the sweep must stop at the cap
        let mut points = flat(40_000, 10_000_000, 100);
        let mut i = 15;
        while i < 39_985 {
            points[i].level = -3000;
            i += 25;
        }
        let candidates = local_maxima(&points, FLOOR + DETECT_THRESHOLD_CDB);
        assert!(candidates.len() <= MAX_PEAKS);
    }

    #[test]
    fn test_symbol_rate_clamped_for_narrow_spike() {
        let mut points = flat(1024, 10_700_000, 100);
        // Single-sample spike: -6 dB width is one sample pair
        points[500].level = -3000;
        let peaks = detect_peaks(&points, MAX_PEAKS, DETECT_THRESHOLD_CDB);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].symbol_rate, 2_000_000);
    }
}
