//! Frontend device access
//!
//! All driver concerns are funnelled through the [`FrontendIo`] trait so the
//! scanning layers can run against a stub. [`LinuxFrontend`] implements it
//! over a `/dev/dvb/adapterN/frontendM` descriptor with the v5 property
//! ioctls; [`FrontendAdapter`] wraps any implementation and adds the SEC
//! sequencing rules the hardware requires: mandatory settle delays after
//! voltage and tone changes, and a cache of the last switch selection so
//! unchanged tunes skip DiSEqC traffic.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::dvb::properties::{
    DriverCandidate, DtvProperties, DtvProperty, FeStatus, SpectrumDescriptor,
    DTV_SCAN_START_FREQUENCY,
};
use crate::dvb::satconf::{SatConf, Unicable};
use crate::dvb::{Band, Polarisation};

/// Settle time after a voltage change
pub const VOLTAGE_SETTLE: Duration = Duration::from_millis(15);
/// Settle time after a tone change
pub const TONE_SETTLE: Duration = Duration::from_millis(20);

/// LNB supply voltage, which doubles as the polarisation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecVoltage {
    V13,
    V18,
}

impl SecVoltage {
    pub fn for_polarisation(pol: Polarisation) -> SecVoltage {
        match pol {
            Polarisation::Horizontal => SecVoltage::V18,
            Polarisation::Vertical => SecVoltage::V13,
        }
    }

    fn driver_code(self) -> libc::c_int {
        match self {
            SecVoltage::V13 => 0,
            SecVoltage::V18 => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("failed to open frontend {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("property transaction failed: {0}")]
    Transaction(#[source] io::Error),
    #[error("SEC command failed: {0}")]
    Sec(#[source] io::Error),
    #[error("event wait failed: {0}")]
    EventWait(#[source] io::Error),
    #[error("frontend does not support spectrum acquisition")]
    SpectrumUnsupported,
}

/// Raw spectrum data as returned by the driver.
///
/// Frequencies are driver-domain kHz and levels are 0.001 dB; the acquirer
/// converts both before anything else sees them.
#[derive(Debug, Default)]
pub struct RawSpectrum {
    pub frequencies: Vec<u32>,
    pub levels_mdb: Vec<i32>,
    pub candidates: Vec<DriverCandidate>,
}

/// The narrow driver surface everything above is written against
pub trait FrontendIo: Send {
    /// Reset any pending tuning state
    fn clear(&mut self) -> Result<(), FrontendError>;

    /// Submit a property-set transaction, in order
    fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError>;

    /// Submit a property-get transaction; results land in the same slice
    fn get_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError>;

    fn set_voltage(&mut self, voltage: SecVoltage) -> Result<(), FrontendError>;

    fn set_tone(&mut self, on: bool) -> Result<(), FrontendError>;

    /// Send a raw DiSEqC master command (3 to 6 bytes)
    fn diseqc_send(&mut self, msg: &[u8]) -> Result<(), FrontendError>;

    /// Wait for a frontend event up to `timeout`. `Ok(None)` means the
    /// timeout elapsed without one.
    fn await_event(&mut self, timeout: Duration) -> Result<Option<FeStatus>, FrontendError>;

    /// Fetch the acquired spectrum plus hardware candidates in one
    /// composite get transaction
    fn read_spectrum(
        &mut self,
        max_points: usize,
        max_candidates: usize,
    ) -> Result<RawSpectrum, FrontendError>;

    /// Fetch the ISI bitset of the currently locked carrier; empty when the
    /// driver has none
    fn read_isi_bitset(&mut self) -> Result<Vec<u8>, FrontendError>;

    /// Whether the driver exposes the spectrum-acquisition extension
    fn supports_spectrum(&self) -> bool;
}

mod ioctls {
    use super::DvbFrontendEvent;
    use crate::dvb::properties::DtvProperties;

    nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
    nix::ioctl_read!(fe_get_property, b'o', 83, DtvProperties);
    nix::ioctl_read!(fe_get_event, b'o', 78, DvbFrontendEvent);
    nix::ioctl_write_ptr!(fe_diseqc_send_master_cmd, b'o', 63, super::DiseqcMasterCmd);
    nix::ioctl_write_int_bad!(fe_set_tone, nix::request_code_none!(b'o', 66));
    nix::ioctl_write_int_bad!(fe_set_voltage, nix::request_code_none!(b'o', 67));
}

/// Kernel `struct dvb_diseqc_master_cmd`
#[repr(C)]
pub struct DiseqcMasterCmd {
    pub msg: [u8; 6],
    pub msg_len: u8,
}

/// Kernel `struct dvb_frontend_event`: status plus the legacy parameter
/// block, which we never interpret
#[repr(C)]
pub struct DvbFrontendEvent {
    pub status: u32,
    parameters: [u8; 36],
}

const SEC_TONE_ON: libc::c_int = 0;
const SEC_TONE_OFF: libc::c_int = 1;

/// A real frontend behind a character device descriptor.
///
/// The descriptor is borrowed state: sessions never close it, the owning
/// device object does when it is dropped.
pub struct LinuxFrontend {
    file: File,
    path: String,
    spectrum_capable: bool,
}

impl LinuxFrontend {
    pub fn open(adapter: u32, frontend: u32) -> Result<Self, FrontendError> {
        let path = format!("/dev/dvb/adapter{adapter}/frontend{frontend}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| FrontendError::Open {
                path: path.clone(),
                source,
            })?;

        let mut fe = LinuxFrontend {
            file,
            path,
            spectrum_capable: false,
        };
        fe.spectrum_capable = fe.probe_spectrum_support();
        tracing::info!(
            path = %fe.path,
            spectrum = fe.spectrum_capable,
            "opened DVB frontend"
        );
        Ok(fe)
    }

    /// The spectrum extension is detected by asking for one of its
    /// properties; stock drivers reject the unknown command.
    fn probe_spectrum_support(&mut self) -> bool {
        let mut prop = [DtvProperty::cmd_only(DTV_SCAN_START_FREQUENCY)];
        self.get_properties(&mut prop).is_ok()
    }

    fn transact(&self, props: &mut [DtvProperty], get: bool) -> Result<(), FrontendError> {
        let mut cmdseq = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        let fd = self.file.as_raw_fd();
        let res = unsafe {
            if get {
                ioctls::fe_get_property(fd, &mut cmdseq)
            } else {
                ioctls::fe_set_property(fd, &cmdseq)
            }
        };
        res.map(|_| ())
            .map_err(|e| FrontendError::Transaction(io::Error::from(e)))
    }
}

impl FrontendIo for LinuxFrontend {
    fn clear(&mut self) -> Result<(), FrontendError> {
        let mut props = [DtvProperty::cmd_only(crate::dvb::properties::DTV_CLEAR)];
        self.set_properties(&mut props)
    }

    fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.transact(props, false)
    }

    fn get_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.transact(props, true)
    }

    fn set_voltage(&mut self, voltage: SecVoltage) -> Result<(), FrontendError> {
        unsafe { ioctls::fe_set_voltage(self.file.as_raw_fd(), voltage.driver_code()) }
            .map(|_| ())
            .map_err(|e| FrontendError::Sec(io::Error::from(e)))
    }

    fn set_tone(&mut self, on: bool) -> Result<(), FrontendError> {
        let arg = if on { SEC_TONE_ON } else { SEC_TONE_OFF };
        unsafe { ioctls::fe_set_tone(self.file.as_raw_fd(), arg) }
            .map(|_| ())
            .map_err(|e| FrontendError::Sec(io::Error::from(e)))
    }

    fn diseqc_send(&mut self, msg: &[u8]) -> Result<(), FrontendError> {
        let mut cmd = DiseqcMasterCmd {
            msg: [0; 6],
            msg_len: msg.len().min(6) as u8,
        };
        cmd.msg[..cmd.msg_len as usize].copy_from_slice(&msg[..cmd.msg_len as usize]);
        unsafe { ioctls::fe_diseqc_send_master_cmd(self.file.as_raw_fd(), &cmd) }
            .map(|_| ())
            .map_err(|e| FrontendError::Sec(io::Error::from(e)))
    }

    fn await_event(&mut self, timeout: Duration) -> Result<Option<FeStatus>, FrontendError> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(
            self.file.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLPRI,
        )];
        let n = poll(&mut fds, PollTimeout::from(ms))
            .map_err(|e| FrontendError::EventWait(io::Error::from(e)))?;
        if n == 0 {
            return Ok(None);
        }

        let mut event = DvbFrontendEvent {
            status: 0,
            parameters: [0; 36],
        };
        unsafe { ioctls::fe_get_event(self.file.as_raw_fd(), &mut event) }
            .map_err(|e| FrontendError::EventWait(io::Error::from(e)))?;
        Ok(Some(FeStatus(event.status)))
    }

    fn read_spectrum(
        &mut self,
        max_points: usize,
        max_candidates: usize,
    ) -> Result<RawSpectrum, FrontendError> {
        let mut freqs = vec![0u32; max_points];
        let mut levels = vec![0i32; max_points];
        let mut candidates = vec![DriverCandidate::default(); max_candidates];

        let descriptor = SpectrumDescriptor {
            freq: freqs.as_mut_ptr(),
            rf_level: levels.as_mut_ptr(),
            candidates: candidates.as_mut_ptr(),
            num_freq: max_points as u32,
            num_candidates: max_candidates as u32,
            scale: 0,
            spectrum_method: 0,
        };

        let mut prop = DtvProperty::cmd_only(crate::dvb::properties::DTV_SPECTRUM);
        descriptor.write_into(&mut prop);
        self.get_properties(std::slice::from_mut(&mut prop))?;

        let (num_freq, num_candidates) = SpectrumDescriptor::read_from(&prop);
        freqs.truncate((num_freq as usize).min(max_points));
        levels.truncate((num_freq as usize).min(max_points));
        candidates.truncate((num_candidates as usize).min(max_candidates));

        Ok(RawSpectrum {
            frequencies: freqs,
            levels_mdb: levels,
            candidates,
        })
    }

    fn read_isi_bitset(&mut self) -> Result<Vec<u8>, FrontendError> {
        let mut prop = DtvProperty::cmd_only(crate::dvb::properties::DTV_ISI_LIST);
        self.get_properties(std::slice::from_mut(&mut prop))?;
        Ok(prop.buffer().to_vec())
    }

    fn supports_spectrum(&self) -> bool {
        self.spectrum_capable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SecSelection {
    pol: Polarisation,
    band: Band,
}

/// Pacing and sequencing wrapper over a [`FrontendIo`].
///
/// Owns the last-selection cache: a repeated `send_satconf_chain` for the
/// same (polarisation, band) is a no-op until the cache is invalidated,
/// which the session manager does at the start of every scan to force
/// fresh DiSEqC traffic.
pub struct FrontendAdapter {
    io: Box<dyn FrontendIo>,
    sec_cache: Option<SecSelection>,
}

impl FrontendAdapter {
    pub fn new(io: Box<dyn FrontendIo>) -> Self {
        FrontendAdapter {
            io,
            sec_cache: None,
        }
    }

    pub fn clear(&mut self) -> Result<(), FrontendError> {
        self.io.clear()
    }

    pub fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.io.set_properties(props)
    }

    pub fn get_properties(&mut self, props: &mut [DtvProperty]) -> Result<(), FrontendError> {
        self.io.get_properties(props)
    }

    pub fn await_event(&mut self, timeout: Duration) -> Result<Option<FeStatus>, FrontendError> {
        self.io.await_event(timeout)
    }

    pub fn read_spectrum(
        &mut self,
        max_points: usize,
        max_candidates: usize,
    ) -> Result<RawSpectrum, FrontendError> {
        self.io.read_spectrum(max_points, max_candidates)
    }

    pub fn read_isi_bitset(&mut self) -> Result<Vec<u8>, FrontendError> {
        self.io.read_isi_bitset()
    }

    pub fn supports_spectrum(&self) -> bool {
        self.io.supports_spectrum()
    }

    /// Drop the cached switch selection so the next chain is sent in full
    pub fn invalidate_sec_cache(&mut self) {
        self.sec_cache = None;
    }

    fn set_voltage_paced(&mut self, voltage: SecVoltage) -> Result<(), FrontendError> {
        self.io.set_voltage(voltage)?;
        thread::sleep(VOLTAGE_SETTLE);
        Ok(())
    }

    fn set_tone_paced(&mut self, on: bool) -> Result<(), FrontendError> {
        self.io.set_tone(on)?;
        thread::sleep(TONE_SETTLE);
        Ok(())
    }

    /// Select (polarisation, band) with voltage and tone only, for setups
    /// without any DiSEqC devices in front of the LNB
    pub fn set_sec_basic(&mut self, pol: Polarisation, band: Band) -> Result<(), FrontendError> {
        self.set_voltage_paced(SecVoltage::for_polarisation(pol))?;
        self.set_tone_paced(band == Band::High)
    }

    /// Run the configured DiSEqC chain (switches, rotor) for the target
    /// (polarisation, band), honouring each device's settle delay.
    ///
    /// Skipped entirely when the cached selection already matches.
    pub fn send_satconf_chain(
        &mut self,
        satconf: &SatConf,
        pol: Polarisation,
        band: Band,
    ) -> Result<(), FrontendError> {
        let selection = SecSelection { pol, band };
        if self.sec_cache == Some(selection) {
            tracing::debug!(pol = %pol.as_char(), band = band.label(), "SEC selection cached, skipping chain");
            return Ok(());
        }

        // Tone must be off while DiSEqC frames are on the bus
        self.set_tone_paced(false)?;
        self.set_voltage_paced(SecVoltage::for_polarisation(pol))?;

        for step in satconf.sec_sequence(pol, band) {
            tracing::debug!(msg = ?step.msg, delay_ms = step.post_delay.as_millis() as u64, "DiSEqC command");
            self.io.diseqc_send(&step.msg)?;
            thread::sleep(step.post_delay);
        }

        self.set_voltage_paced(SecVoltage::for_polarisation(pol))?;
        self.set_tone_paced(band == Band::High)?;

        tracing::debug!(pol = %pol.as_char(), band = band.label(), "LNB configured");
        self.sec_cache = Some(selection);
        Ok(())
    }

    /// Send a Unicable ODU channel-change command for a transponder
    /// frequency. The bus stays at 13 V throughout; the gateway owns
    /// band/polarisation selection from there on, so the switch cache is
    /// dropped.
    pub fn send_unicable(
        &mut self,
        unicable: &Unicable,
        freq_khz: u32,
        pol: Polarisation,
        band: Band,
    ) -> Result<(), FrontendError> {
        self.set_tone_paced(false)?;
        self.set_voltage_paced(SecVoltage::V13)?;

        let step = unicable.tune_command(freq_khz, pol, band);
        tracing::debug!(
            freq_khz,
            scr = unicable.scr,
            msg = ?step.msg,
            "Unicable ODU command"
        );
        self.io.diseqc_send(&step.msg)?;
        thread::sleep(step.post_delay);

        self.sec_cache = None;
        Ok(())
    }
}
