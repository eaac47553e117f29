//! DVB-S/S2 vocabulary shared across the scanning pipeline
//!
//! Frequency conversion between the transponder domain (what operators see)
//! and the driver domain (the LNB intermediate frequency), the Universal LNB
//! band geometry, and the enums that travel between the driver read-back
//! path and the reporting surface.
//!
//! All frequencies are kHz, symbol rates are symbols/s, levels are 0.01 dB
//! units unless a name says otherwise.

pub mod frontend;
pub mod properties;
pub mod satconf;
pub mod sim;

use serde::{Deserialize, Serialize};

/// Universal LNB switch frequency (low/high band split)
pub const LNB_SLOF_KHZ: u32 = 11_700_000;
/// Universal LNB low band local oscillator
pub const LNB_LOF_LOW_KHZ: u32 = 9_750_000;
/// Universal LNB high band local oscillator
pub const LNB_LOF_HIGH_KHZ: u32 = 10_600_000;

/// One of the two Universal LNB RF windows, switched by the 22 kHz tone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Low,
    High,
}

impl Band {
    /// Band for a transponder frequency: high iff at or above the switch
    /// frequency.
    pub fn for_frequency(freq_khz: u32) -> Band {
        if freq_khz >= LNB_SLOF_KHZ {
            Band::High
        } else {
            Band::Low
        }
    }

    pub fn from_index(index: u32) -> Option<Band> {
        match index {
            0 => Some(Band::Low),
            1 => Some(Band::High),
            _ => None,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Band::Low => 0,
            Band::High => 1,
        }
    }

    /// Local oscillator frequency subtracted by the LNB in this band
    pub fn lof_khz(self) -> u32 {
        match self {
            Band::Low => LNB_LOF_LOW_KHZ,
            Band::High => LNB_LOF_HIGH_KHZ,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::High => "high",
        }
    }
}

/// Convert a transponder frequency to the driver-visible IF
pub fn driver_freq(freq_khz: u32, band: Band) -> i32 {
    freq_khz as i32 - band.lof_khz() as i32
}

/// Convert a driver-visible IF back to a transponder frequency
pub fn transponder_freq(driver_khz: i32, band: Band) -> u32 {
    (driver_khz + band.lof_khz() as i32) as u32
}

/// Frequency tolerance for mux matching, indexed by symbol rate.
///
/// Narrow carriers are placed precisely, wide ones wander: below 5 Msym/s
/// match within 1 MHz, up to 30 Msym/s within 5 MHz, above that 10 MHz.
/// Returned in kHz.
pub fn freq_tolerance_for_sr(symbol_rate: u32) -> u32 {
    if symbol_rate < 5_000_000 {
        1_000
    } else if symbol_rate < 30_000_000 {
        5_000
    } else {
        10_000
    }
}

/// Signal polarisation as selected by LNB supply voltage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarisation {
    #[default]
    #[serde(rename = "H")]
    Horizontal,
    #[serde(rename = "V")]
    Vertical,
}

impl Polarisation {
    pub fn from_char(c: char) -> Option<Polarisation> {
        match c {
            'H' | 'h' => Some(Polarisation::Horizontal),
            'V' | 'v' => Some(Polarisation::Vertical),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Polarisation::Horizontal => 'H',
            Polarisation::Vertical => 'V',
        }
    }

    /// Spectrum slot index within a session (H before V)
    pub fn index(self) -> u32 {
        match self {
            Polarisation::Horizontal => 0,
            Polarisation::Vertical => 1,
        }
    }
}

/// Decode the driver's stream-id read-back encoding.
///
/// Raw 511 means "no ISI filter" and maps to -1; 256..=510 carries an ISI
/// biased by 256; anything below 256 is already a plain ISI.
pub fn decode_stream_id(raw: u32) -> i32 {
    match raw {
        511 => -1,
        256..=510 => (raw - 256) as i32,
        v => v as i32,
    }
}

/// PLS mode field of a MATYPE word (bits 26-27)
pub fn matype_pls_mode(matype: u32) -> u32 {
    (matype >> 26) & 0x3
}

/// PLS code field of a MATYPE word (bits 8-25)
pub fn matype_pls_code(matype: u32) -> u32 {
    (matype >> 8) & 0x3FFFF
}

/// Classify a locked carrier as GSE from its MATYPE word.
///
/// The low byte is the raw DVB-S2 MATYPE whose bits 6-7 encode the stream
/// format (0b11 = transport stream). Non-multistream carriers report
/// MATYPE 0, which must not be read as GSE, so the classification requires
/// an ISI filter to be active as well.
pub fn matype_is_gse(matype: u32, stream_id: i32) -> bool {
    let ts_gs = (matype & 0xFF) >> 6;
    stream_id >= 0 && matype != 0 && ts_gs != 0b11
}

/// Encode a PLS search entry: mode in bits 26-27, code in bits 8-25
pub fn encode_pls(mode: PlsMode, code: u32) -> u32 {
    ((mode.driver_code() & 0x3) << 26) | ((code & 0x3FFFF) << 8)
}

/// Expand an ISI bitset (up to 32 bytes, LSB first within each byte) into a
/// sorted list of stream identifiers.
pub fn decode_isi_bitset(bitset: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (byte_idx, &byte) in bitset.iter().take(32).enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                out.push((byte_idx * 8 + bit) as u8);
            }
        }
    }
    out
}

/// Pack a list of stream identifiers back into the 32-byte bitset form
pub fn encode_isi_bitset(isis: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for &isi in isis {
        out[isi as usize / 8] |= 1 << (isi % 8);
    }
    out
}

/// Delivery system of a locked carrier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliverySystem {
    #[serde(rename = "DVB-S")]
    DvbS,
    #[default]
    #[serde(rename = "DVB-S2")]
    DvbS2,
}

impl DeliverySystem {
    pub fn from_driver(v: u32) -> DeliverySystem {
        if v == properties::SYS_DVBS {
            DeliverySystem::DvbS
        } else {
            DeliverySystem::DvbS2
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            DeliverySystem::DvbS => properties::SYS_DVBS,
            DeliverySystem::DvbS2 => properties::SYS_DVBS2,
        }
    }
}

/// Modulation of a locked carrier (DVB-S/S2 constellations only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "QPSK")]
    Qpsk,
    #[serde(rename = "8PSK")]
    Psk8,
    #[serde(rename = "16APSK")]
    Apsk16,
    #[serde(rename = "32APSK")]
    Apsk32,
}

impl Modulation {
    pub fn from_driver(v: u32) -> Modulation {
        match v {
            0 => Modulation::Qpsk,
            9 => Modulation::Psk8,
            10 => Modulation::Apsk16,
            11 => Modulation::Apsk32,
            _ => Modulation::Auto,
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            Modulation::Qpsk => 0,
            Modulation::Psk8 => 9,
            Modulation::Apsk16 => 10,
            Modulation::Apsk32 => 11,
            Modulation::Auto => 6,
        }
    }
}

/// Forward error correction code rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FecRate {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "1/2")]
    F1_2,
    #[serde(rename = "2/3")]
    F2_3,
    #[serde(rename = "3/4")]
    F3_4,
    #[serde(rename = "4/5")]
    F4_5,
    #[serde(rename = "5/6")]
    F5_6,
    #[serde(rename = "6/7")]
    F6_7,
    #[serde(rename = "7/8")]
    F7_8,
    #[serde(rename = "8/9")]
    F8_9,
    #[serde(rename = "3/5")]
    F3_5,
    #[serde(rename = "9/10")]
    F9_10,
}

impl FecRate {
    pub fn from_driver(v: u32) -> FecRate {
        match v {
            1 => FecRate::F1_2,
            2 => FecRate::F2_3,
            3 => FecRate::F3_4,
            4 => FecRate::F4_5,
            5 => FecRate::F5_6,
            6 => FecRate::F6_7,
            7 => FecRate::F7_8,
            8 => FecRate::F8_9,
            10 => FecRate::F3_5,
            11 => FecRate::F9_10,
            _ => FecRate::Auto,
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            FecRate::F1_2 => 1,
            FecRate::F2_3 => 2,
            FecRate::F3_4 => 3,
            FecRate::F4_5 => 4,
            FecRate::F5_6 => 5,
            FecRate::F6_7 => 6,
            FecRate::F7_8 => 7,
            FecRate::F8_9 => 8,
            FecRate::F3_5 => 10,
            FecRate::F9_10 => 11,
            FecRate::Auto => 9,
        }
    }
}

/// Spectral rolloff factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rolloff {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "35")]
    R35,
    #[serde(rename = "25")]
    R25,
    #[serde(rename = "20")]
    R20,
    #[serde(rename = "15")]
    R15,
    #[serde(rename = "10")]
    R10,
    #[serde(rename = "5")]
    R5,
}

impl Rolloff {
    pub fn from_driver(v: u32) -> Rolloff {
        match v {
            0 => Rolloff::R35,
            1 => Rolloff::R20,
            2 => Rolloff::R25,
            4 => Rolloff::R15,
            5 => Rolloff::R10,
            6 => Rolloff::R5,
            _ => Rolloff::Auto,
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            Rolloff::R35 => 0,
            Rolloff::R20 => 1,
            Rolloff::R25 => 2,
            Rolloff::R15 => 4,
            Rolloff::R10 => 5,
            Rolloff::R5 => 6,
            Rolloff::Auto => 3,
        }
    }

    /// Rolloff as a percentage for bandwidth arithmetic; unknown defaults
    /// to the DVB-S value of 0.35.
    pub fn percent(self) -> u32 {
        match self {
            Rolloff::R35 | Rolloff::Auto => 35,
            Rolloff::R25 => 25,
            Rolloff::R20 => 20,
            Rolloff::R15 => 15,
            Rolloff::R10 => 10,
            Rolloff::R5 => 5,
        }
    }
}

/// DVB-S2 pilot tones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pilot {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
}

impl Pilot {
    pub fn from_driver(v: u32) -> Pilot {
        match v {
            0 => Pilot::On,
            1 => Pilot::Off,
            _ => Pilot::Auto,
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            Pilot::On => 0,
            Pilot::Off => 1,
            Pilot::Auto => 2,
        }
    }
}

/// Physical-layer scrambling mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlsMode {
    #[default]
    #[serde(rename = "ROOT")]
    Root,
    #[serde(rename = "GOLD")]
    Gold,
    #[serde(rename = "COMBO")]
    Combo,
}

impl PlsMode {
    pub fn from_driver(v: u32) -> PlsMode {
        match v {
            1 => PlsMode::Gold,
            2 => PlsMode::Combo,
            _ => PlsMode::Root,
        }
    }

    pub fn driver_code(self) -> u32 {
        match self {
            PlsMode::Root => 0,
            PlsMode::Gold => 1,
            PlsMode::Combo => 2,
        }
    }
}
