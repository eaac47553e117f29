//! Per-candidate blind tune
//!
//! Resolves a single candidate carrier to its full DVB-S2 parameters: the
//! driver hunts around the candidate frequency with a symbol-rate hint and
//! a list of common scrambling codes, and on lock we read everything back,
//! decode the multistream context and classify the payload format.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::dvb::frontend::FrontendAdapter;
use crate::dvb::properties::{
    DtvProperty, PlsSearchCodes, ALGORITHM_BLIND, DTV_ALGORITHM, DTV_CLEAR, DTV_DELIVERY_SYSTEM,
    DTV_FREQUENCY, DTV_INNER_FEC, DTV_MATYPE, DTV_MODULATION, DTV_PILOT, DTV_ROLLOFF,
    DTV_SEARCH_RANGE, DTV_STREAM_ID, DTV_SYMBOL_RATE, DTV_TUNE, NO_STREAM_ID_FILTER, SYS_AUTO,
};
use crate::dvb::satconf::SatConf;
use crate::dvb::{
    decode_isi_bitset, decode_stream_id, encode_pls, matype_is_gse, matype_pls_code,
    matype_pls_mode, Band, DeliverySystem, FecRate, Modulation, Pilot, PlsMode, Polarisation,
    Rolloff,
};
use crate::scan::session::LockedTuning;
use crate::scan::ScanError;

/// Lock budget for a blind tune
const LOCK_TIMEOUT: Duration = Duration::from_secs(12);
/// Symbol-rate hint when the candidate has no estimate
pub const DEFAULT_SR_ESTIMATE: u32 = 22_000_000;
/// Blind search never narrows below this window, sym/s
const MIN_SEARCH_RANGE: u32 = 8_000_000;

/// Result of a prescan, shaped for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PrescanOutcome {
    pub locked: bool,
    #[serde(flatten)]
    pub tuning: Option<LockedTuning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multistream: Option<bool>,
}

impl PrescanOutcome {
    fn no_lock() -> PrescanOutcome {
        PrescanOutcome {
            locked: false,
            tuning: None,
            multistream: None,
        }
    }
}

/// The scrambling codes worth trying blind: the unscrambled roots, the
/// default gold sequence and the codes broadcasters actually deploy
const PLS_SEARCH: [(PlsMode, u32); 6] = [
    (PlsMode::Root, 0),
    (PlsMode::Root, 1),
    (PlsMode::Root, 8),
    (PlsMode::Root, 16416),
    (PlsMode::Gold, 0),
    (PlsMode::Gold, 8192),
];

/// Blind-tune one candidate.
///
/// `est_symbol_rate` comes from the matching session candidate when there
/// is one. The adapter's tuning state is cleared on the way out; the
/// descriptor stays open for the next prescan.
pub fn prescan(
    adapter: &mut FrontendAdapter,
    satconf: Option<&SatConf>,
    frequency: u32,
    pol: Polarisation,
    est_symbol_rate: u32,
) -> Result<PrescanOutcome, ScanError> {
    let band = Band::for_frequency(frequency);
    let est_sr = if est_symbol_rate > 0 {
        est_symbol_rate
    } else {
        DEFAULT_SR_ESTIMATE
    };

    let unicable = satconf.and_then(|s| s.unicable.as_ref());

    // Point the dish and derive the driver-domain target
    let driver_target = match (satconf, unicable) {
        (Some(_), Some(uc)) => {
            adapter.send_unicable(uc, frequency, pol, band)?;
            uc.scr_freq_khz
        }
        (Some(sc), None) => {
            adapter.send_satconf_chain(sc, pol, band)?;
            frequency - band.lof_khz()
        }
        (None, _) => {
            adapter.set_sec_basic(pol, band)?;
            frequency - band.lof_khz()
        }
    };

    let search_range = (est_sr / 2).max(MIN_SEARCH_RANGE);
    tracing::info!(
        frequency,
        pol = %pol.as_char(),
        driver_target,
        est_sr,
        search_range,
        "blind tune"
    );

    let mut clear = [DtvProperty::cmd_only(DTV_CLEAR)];
    adapter.set_properties(&mut clear)?;

    // The driver requires this exact submission order; search range and
    // symbol rate must precede the frequency
    let pls_codes: Vec<u32> = PLS_SEARCH
        .iter()
        .map(|&(mode, code)| encode_pls(mode, code))
        .collect();
    let mut props = [
        DtvProperty::new(DTV_ALGORITHM, ALGORITHM_BLIND),
        DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_AUTO),
        DtvProperty::new(DTV_SEARCH_RANGE, search_range),
        DtvProperty::new(DTV_SYMBOL_RATE, est_sr),
        DtvProperty::new(DTV_FREQUENCY, driver_target),
        DtvProperty::new(DTV_STREAM_ID, NO_STREAM_ID_FILTER),
        PlsSearchCodes::property(&pls_codes),
        DtvProperty::new(DTV_TUNE, 0),
    ];
    adapter.set_properties(&mut props)?;

    // Carrier lock alone is a blind-search false positive; insist on sync
    let deadline = Instant::now() + LOCK_TIMEOUT;
    let mut locked = false;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match adapter.await_event(remaining)? {
            Some(status) if status.is_locked() => {
                locked = true;
                break;
            }
            Some(status) if status.has_carrier_lock() => {
                tracing::debug!(status = status.0, "carrier lock without sync, ignoring");
            }
            Some(_) => {}
            None => break,
        }
    }

    if !locked {
        tracing::info!(frequency, "blind tune did not lock");
        let mut clear = [DtvProperty::cmd_only(DTV_CLEAR)];
        adapter.set_properties(&mut clear)?;
        return Ok(PrescanOutcome::no_lock());
    }

    let outcome = read_back(adapter, frequency, band, unicable.is_some())?;

    // Keep the descriptor usable for the next candidate
    let mut clear = [DtvProperty::cmd_only(DTV_CLEAR)];
    adapter.set_properties(&mut clear)?;

    Ok(outcome)
}

/// Fetch every tuning parameter in one transaction and decode the
/// multistream context
fn read_back(
    adapter: &mut FrontendAdapter,
    candidate_freq: u32,
    band: Band,
    unicable: bool,
) -> Result<PrescanOutcome, ScanError> {
    let mut props = [
        DtvProperty::cmd_only(DTV_FREQUENCY),
        DtvProperty::cmd_only(DTV_SYMBOL_RATE),
        DtvProperty::cmd_only(DTV_MODULATION),
        DtvProperty::cmd_only(DTV_INNER_FEC),
        DtvProperty::cmd_only(DTV_DELIVERY_SYSTEM),
        DtvProperty::cmd_only(DTV_STREAM_ID),
        DtvProperty::cmd_only(DTV_ROLLOFF),
        DtvProperty::cmd_only(DTV_PILOT),
        DtvProperty::cmd_only(DTV_MATYPE),
    ];
    adapter.get_properties(&mut props)?;

    // A gateway reports its fixed user-band IF as the frequency, which
    // says nothing about the carrier; keep the candidate frequency there
    let frequency = if unicable {
        candidate_freq
    } else {
        props[0].value() + band.lof_khz()
    };

    let stream_id = decode_stream_id(props[5].value());
    let matype = props[8].value();
    let pls_mode = PlsMode::from_driver(matype_pls_mode(matype));
    let pls_code = matype_pls_code(matype);
    let is_gse = matype_is_gse(matype, stream_id);

    let isi_bitset = adapter.read_isi_bitset()?;
    let isi_list = decode_isi_bitset(&isi_bitset);
    let multistream = isi_list.len() > 1;

    let tuning = LockedTuning {
        frequency,
        symbol_rate: props[1].value(),
        delivery_system: DeliverySystem::from_driver(props[4].value()),
        modulation: Modulation::from_driver(props[2].value()),
        fec: FecRate::from_driver(props[3].value()),
        rolloff: Rolloff::from_driver(props[6].value()),
        pilot: Pilot::from_driver(props[7].value()),
        stream_id,
        pls_mode,
        pls_code,
        is_gse,
        isi_list,
    };

    tracing::info!(
        frequency = tuning.frequency,
        symbol_rate = tuning.symbol_rate,
        stream_id = tuning.stream_id,
        pls_code = tuning.pls_code,
        gse = tuning.is_gse,
        multistream,
        "blind tune locked"
    );

    Ok(PrescanOutcome {
        locked: true,
        tuning: Some(tuning),
        multistream: Some(multistream),
    })
}
