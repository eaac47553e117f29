//! DVB v5 property ABI
//!
//! The frontend is driven through `FE_SET_PROPERTY`/`FE_GET_PROPERTY`
//! transactions carrying arrays of `dtv_property`. The kernel struct is
//! 76 bytes, packed: cmd (u32), three reserved u32s, a 56-byte union and a
//! result i32. The union is addressed here as raw bytes with explicit
//! offsets because the spectrum read-back descriptor does not fit any of
//! the named union members and must be marshalled bit-exactly.

use std::mem;

// Standard DVB v5 property command ids
pub const DTV_TUNE: u32 = 1;
pub const DTV_CLEAR: u32 = 2;
pub const DTV_FREQUENCY: u32 = 3;
pub const DTV_MODULATION: u32 = 4;
pub const DTV_INVERSION: u32 = 6;
pub const DTV_SYMBOL_RATE: u32 = 8;
pub const DTV_INNER_FEC: u32 = 9;
pub const DTV_PILOT: u32 = 12;
pub const DTV_ROLLOFF: u32 = 13;
pub const DTV_DELIVERY_SYSTEM: u32 = 17;
pub const DTV_STREAM_ID: u32 = 42;

// Neumo driver extensions, not present in mainline dvb headers.
// 74/75/79-84 match the driver; the MATYPE, ISI list and PLS search list
// ids sit in the same extension block.
pub const DTV_ALGORITHM: u32 = 74;
pub const DTV_SEARCH_RANGE: u32 = 75;
pub const DTV_SCAN_START_FREQUENCY: u32 = 79;
pub const DTV_SCAN_END_FREQUENCY: u32 = 80;
pub const DTV_SCAN_RESOLUTION: u32 = 81;
pub const DTV_SCAN_FFT_SIZE: u32 = 82;
pub const DTV_MATYPE: u32 = 83;
pub const DTV_SPECTRUM: u32 = 84;
pub const DTV_ISI_LIST: u32 = 85;
pub const DTV_PLS_SEARCH_LIST: u32 = 86;

/// `DTV_ALGORITHM` value requesting a blind parameter search
pub const ALGORITHM_BLIND: u32 = 2;

// Delivery systems (fe_delivery_system)
pub const SYS_AUTO: u32 = 0;
pub const SYS_DVBS: u32 = 5;
pub const SYS_DVBS2: u32 = 6;

// Spectrum acquisition methods
pub const SPECTRUM_METHOD_SWEEP: u32 = 0;
pub const SPECTRUM_METHOD_FFT: u32 = 1;

/// Stream-id value meaning "no ISI filter" when setting `DTV_STREAM_ID`
pub const NO_STREAM_ID_FILTER: u32 = u32::MAX;

// fe_status bits reported on the readiness descriptor
pub const FE_HAS_SIGNAL: u32 = 0x01;
pub const FE_HAS_CARRIER: u32 = 0x02;
pub const FE_HAS_VITERBI: u32 = 0x04;
pub const FE_HAS_SYNC: u32 = 0x08;
pub const FE_HAS_LOCK: u32 = 0x10;
pub const FE_TIMEDOUT: u32 = 0x20;

/// Frontend status bitmask from an `FE_GET_EVENT` read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeStatus(pub u32);

impl FeStatus {
    pub fn has_carrier_lock(self) -> bool {
        self.0 & FE_HAS_LOCK != 0
    }

    pub fn has_sync(self) -> bool {
        self.0 & FE_HAS_SYNC != 0
    }

    /// Full lock: carrier lock plus sync. Carrier lock alone is a known
    /// false positive during blind search.
    pub fn is_locked(self) -> bool {
        self.has_carrier_lock() && self.has_sync()
    }

    pub fn timed_out(self) -> bool {
        self.0 & FE_TIMEDOUT != 0
    }
}

/// Size of the `dtv_property` payload union
pub const DTV_UNION_SIZE: usize = 56;
/// Offset of the buffer length field within the union (`u.buffer.len`)
const BUFFER_LEN_OFFSET: usize = 32;
/// Usable bytes of the in-line buffer member (`u.buffer.data`)
pub const BUFFER_DATA_SIZE: usize = 32;

/// Kernel `struct dtv_property`: 76 bytes, packed
#[repr(C, packed)]
pub struct DtvProperty {
    pub cmd: u32,
    pub reserved: [u32; 3],
    pub data: [u8; DTV_UNION_SIZE],
    pub result: i32,
}

impl DtvProperty {
    /// Property carrying a plain u32 value
    pub fn new(cmd: u32, value: u32) -> Self {
        let mut p = Self::cmd_only(cmd);
        p.set_value(value);
        p
    }

    /// Property with a zeroed payload, for command-only entries and get
    /// transactions
    pub fn cmd_only(cmd: u32) -> Self {
        DtvProperty {
            cmd,
            reserved: [0; 3],
            data: [0; DTV_UNION_SIZE],
            result: 0,
        }
    }

    /// Read the u32 union member
    pub fn value(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[0..4]);
        u32::from_ne_bytes(b)
    }

    pub fn set_value(&mut self, value: u32) {
        self.data[0..4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Length field of the buffer union member
    pub fn buffer_len(&self) -> usize {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[BUFFER_LEN_OFFSET..BUFFER_LEN_OFFSET + 4]);
        u32::from_ne_bytes(b) as usize
    }

    pub fn set_buffer_len(&mut self, len: usize) {
        self.data[BUFFER_LEN_OFFSET..BUFFER_LEN_OFFSET + 4]
            .copy_from_slice(&(len as u32).to_ne_bytes());
    }

    /// In-line buffer bytes (`u.buffer.data`), clamped to the reported
    /// length
    pub fn buffer(&self) -> &[u8] {
        &self.data[..self.buffer_len().min(BUFFER_DATA_SIZE)]
    }
}

/// Kernel `struct dtv_properties` handed to the property ioctls
#[repr(C)]
pub struct DtvProperties {
    pub num: u32,
    pub props: *mut DtvProperty,
}

/// Composite spectrum read-back descriptor.
///
/// Matches the driver's `dtv_fe_spectrum`: caller-allocated buffers for
/// frequencies, levels and candidate peaks, their capacities going in and
/// the filled counts coming back. Packed - the driver copies it byte for
/// byte out of the property union, so native alignment must not leak in.
#[repr(C, packed)]
pub struct SpectrumDescriptor {
    pub freq: *mut u32,
    pub rf_level: *mut i32,
    pub candidates: *mut DriverCandidate,
    pub num_freq: u32,
    pub num_candidates: u32,
    pub scale: u32,
    pub spectrum_method: u8,
}

/// Hardware candidate peak as reported by the driver.
///
/// Frequencies are driver-domain kHz; snr and level are 0.001 dB.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DriverCandidate {
    pub freq: i32,
    pub symbol_rate: i32,
    pub snr: i32,
    pub level: i32,
}

impl SpectrumDescriptor {
    /// Serialise the descriptor into a property payload.
    ///
    /// The descriptor is one byte longer than the in-line buffer member, so
    /// it spills into the neighbouring union bytes; the buffer length slot
    /// is written afterwards, exactly as the driver expects.
    pub fn write_into(&self, prop: &mut DtvProperty) {
        let size = mem::size_of::<SpectrumDescriptor>();
        debug_assert!(size <= DTV_UNION_SIZE);
        let bytes =
            unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, size) };
        prop.data[..size].copy_from_slice(bytes);
        prop.set_buffer_len(size);
    }

    /// Deserialise the filled counts after a get transaction
    pub fn read_from(prop: &DtvProperty) -> (u32, u32) {
        let desc =
            unsafe { std::ptr::read_unaligned(prop.data.as_ptr() as *const SpectrumDescriptor) };
        (desc.num_freq, desc.num_candidates)
    }
}

/// PLS search list union member: a count and a pointer to encoded codes
#[repr(C)]
pub struct PlsSearchCodes {
    pub num_codes: u32,
    pub codes: *const u32,
}

impl PlsSearchCodes {
    /// Build a `DTV_PLS_SEARCH_LIST` property over a caller-owned code
    /// array. The array must stay alive until the transaction completes.
    pub fn property(codes: &[u32]) -> DtvProperty {
        let mut prop = DtvProperty::cmd_only(DTV_PLS_SEARCH_LIST);
        let member = PlsSearchCodes {
            num_codes: codes.len() as u32,
            codes: codes.as_ptr(),
        };
        let size = mem::size_of::<PlsSearchCodes>();
        let bytes =
            unsafe { std::slice::from_raw_parts(&member as *const _ as *const u8, size) };
        prop.data[..size].copy_from_slice(bytes);
        prop
    }
}
