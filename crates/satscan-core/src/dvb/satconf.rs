//! Satellite configuration: the device chain between frontend and dish
//!
//! A [`SatConf`] describes what sits in front of the LNB - committed and
//! uncommitted DiSEqC switches, a rotor, optionally a Unicable gateway -
//! and builds the raw DiSEqC frames for a (polarisation, band) selection.
//! The scanning core only parameterises and invokes this chain; the model
//! itself is configuration handed in by the host.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dvb::{Band, Polarisation};

/// Post-command settle time for a plain DiSEqC frame
const DISEQC_SETTLE: Duration = Duration::from_millis(25);

/// LNB geometry. Only Universal LNBs take part in band-split scanning;
/// the enum leaves room for fixed-oscillator types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LnbType {
    Universal,
}

impl LnbType {
    pub fn label(self) -> &'static str {
        match self {
            LnbType::Universal => "Universal LNB",
        }
    }
}

/// DiSEqC 1.0/1.1 switch ports
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiseqcSwitch {
    /// Committed port 0-3, -1 when absent
    pub committed: i8,
    /// Uncommitted port 0-15, -1 when absent
    pub uncommitted: i8,
    /// Send the uncommitted frame before the committed one
    pub uncommitted_first: bool,
}

/// DiSEqC 1.2 rotor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Rotor {
    /// Stored satellite position
    pub position: u8,
    /// Worst-case travel time the positioner asks us to wait out
    pub settle_secs: u32,
}

/// Unicable command dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnicableVariant {
    /// EN 50494, "Unicable I": 8 user bands
    En50494,
    /// EN 50607, "JESS": 32 user bands
    En50607,
}

impl UnicableVariant {
    pub fn label(self) -> &'static str {
        match self {
            UnicableVariant::En50494 => "Unicable I (EN50494)",
            UnicableVariant::En50607 => "Unicable II (EN50607)",
        }
    }
}

/// Single-channel-router gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unicable {
    pub variant: UnicableVariant,
    /// SCR user-band number
    pub scr: u8,
    /// Fixed IF the gateway outputs for this user band, kHz
    pub scr_freq_khz: u32,
    /// Satellite position input at the gateway
    pub position: u8,
    /// Optional PIN for protected gateways
    pub pin: Option<u8>,
}

/// One DiSEqC frame plus the delay the device wants afterwards
#[derive(Debug, Clone)]
pub struct SecStep {
    pub msg: Vec<u8>,
    pub post_delay: Duration,
}

impl Unicable {
    /// Build the ODU channel-change command for a transponder frequency.
    ///
    /// The tuning word is computed from the LNB IF for the target band and
    /// the user band's output frequency.
    pub fn tune_command(&self, freq_khz: u32, pol: Polarisation, band: Band) -> SecStep {
        let lof = band.lof_khz();
        let if_khz = freq_khz.abs_diff(lof);
        let pol_h = (pol == Polarisation::Horizontal) as u16;
        let band_high = (band == Band::High) as u16;

        let msg = match self.variant {
            UnicableVariant::En50494 => {
                // T = (IF + SCR)/4 MHz, rounded, minus 350
                let t = ((if_khz + self.scr_freq_khz + 2_000) / 4_000).saturating_sub(350) as u16;
                let data1 = ((self.scr as u16 & 0x7) << 5)
                    | ((self.position as u16 & 0x1) << 4)
                    | (pol_h << 3)
                    | (band_high << 2)
                    | ((t >> 8) & 0x3);
                let cmd = if self.pin.is_some() { 0x5C } else { 0x5A };
                let mut m = vec![0xE0, 0x10, cmd, data1 as u8, (t & 0xFF) as u8];
                if let Some(pin) = self.pin {
                    m.push(pin);
                }
                m
            }
            UnicableVariant::En50607 => {
                // T = IF in MHz minus 100
                let t = (if_khz / 1_000).saturating_sub(100) as u16;
                let data1 = ((self.scr as u16 & 0x1F) << 3) | ((t >> 8) & 0x7);
                let data3 = ((self.position as u16 & 0x3F) << 2) | (pol_h << 1) | band_high;
                let cmd = if self.pin.is_some() { 0x71 } else { 0x70 };
                let mut m = vec![cmd, data1 as u8, (t & 0xFF) as u8, data3 as u8];
                if let Some(pin) = self.pin {
                    m.push(pin);
                }
                m
            }
        };

        SecStep {
            msg,
            post_delay: DISEQC_SETTLE,
        }
    }
}

/// A complete satellite configuration element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatConf {
    pub name: String,
    pub lnb: LnbType,
    pub switch: Option<DiseqcSwitch>,
    pub rotor: Option<Rotor>,
    pub unicable: Option<Unicable>,
    /// Drive the switch before the rotor; mirrors the host's chain order
    /// setting
    pub switch_before_rotor: bool,
}

impl SatConf {
    /// A bare Universal LNB with nothing in front of it
    pub fn universal(name: impl Into<String>) -> SatConf {
        SatConf {
            name: name.into(),
            lnb: LnbType::Universal,
            switch: None,
            rotor: None,
            unicable: None,
            switch_before_rotor: true,
        }
    }

    pub fn with_switch(mut self, switch: DiseqcSwitch) -> SatConf {
        self.switch = Some(switch);
        self
    }

    pub fn with_rotor(mut self, rotor: Rotor) -> SatConf {
        self.rotor = Some(rotor);
        self
    }

    pub fn with_unicable(mut self, unicable: Unicable) -> SatConf {
        self.unicable = Some(unicable);
        self
    }

    /// The DiSEqC frames to select (polarisation, band), in chain order.
    ///
    /// The Unicable gateway is not part of this sequence; its ODU command
    /// is per-tune and handled separately.
    pub fn sec_sequence(&self, pol: Polarisation, band: Band) -> Vec<SecStep> {
        let mut steps = Vec::new();

        let switch_steps = self.switch.map(|sw| sw.frames(pol, band)).unwrap_or_default();
        let rotor_step = self.rotor.map(|r| SecStep {
            msg: vec![0xE0, 0x31, 0x6B, r.position],
            post_delay: Duration::from_secs(r.settle_secs as u64),
        });

        if self.switch_before_rotor {
            steps.extend(switch_steps);
            steps.extend(rotor_step);
        } else {
            steps.extend(rotor_step);
            steps.extend(switch_steps);
        }
        steps
    }
}

impl DiseqcSwitch {
    fn frames(&self, pol: Polarisation, band: Band) -> Vec<SecStep> {
        let mut committed = None;
        if self.committed >= 0 {
            // Port bits 2-3, option bits: 18V/horizontal and high-band tone
            let data = 0xF0u8
                | ((self.committed as u8 & 0x3) << 2)
                | (((pol == Polarisation::Horizontal) as u8) << 1)
                | ((band == Band::High) as u8);
            committed = Some(SecStep {
                msg: vec![0xE0, 0x10, 0x38, data],
                post_delay: DISEQC_SETTLE,
            });
        }

        let mut uncommitted = None;
        if self.uncommitted >= 0 {
            let data = 0xF0u8 | (self.uncommitted as u8 & 0x0F);
            uncommitted = Some(SecStep {
                msg: vec![0xE0, 0x10, 0x39, data],
                post_delay: DISEQC_SETTLE,
            });
        }

        let mut steps = Vec::new();
        if self.uncommitted_first {
            steps.extend(uncommitted);
            steps.extend(committed);
        } else {
            steps.extend(committed);
            steps.extend(uncommitted);
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_switch_frame_encodes_port_pol_band() {
        let sw = DiseqcSwitch {
            committed: 1,
            uncommitted: -1,
            uncommitted_first: false,
        };
        let steps = sw.frames(Polarisation::Horizontal, Band::High);
        assert_eq!(steps.len(), 1);
        // 0xF0 | port 1 << 2 | H << 1 | high
        assert_eq!(steps[0].msg, vec![0xE0, 0x10, 0x38, 0xF7]);

        let steps = sw.frames(Polarisation::Vertical, Band::Low);
        assert_eq!(steps[0].msg, vec![0xE0, 0x10, 0x38, 0xF4]);
    }

    #[test]
    fn test_uncommitted_first_ordering() {
        let sw = DiseqcSwitch {
            committed: 0,
            uncommitted: 5,
            uncommitted_first: true,
        };
        let steps = sw.frames(Polarisation::Horizontal, Band::Low);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].msg[2], 0x39);
        assert_eq!(steps[1].msg[2], 0x38);
    }

    #[test]
    fn test_rotor_goto_with_settle() {
        let sc = SatConf::universal("motorised").with_rotor(Rotor {
            position: 3,
            settle_secs: 15,
        });
        let steps = sc.sec_sequence(Polarisation::Vertical, Band::Low);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].msg, vec![0xE0, 0x31, 0x6B, 3]);
        assert_eq!(steps[0].post_delay, Duration::from_secs(15));
    }

    #[test]
    fn test_chain_order_switch_vs_rotor() {
        let sc = SatConf::universal("both")
            .with_switch(DiseqcSwitch {
                committed: 0,
                uncommitted: -1,
                uncommitted_first: false,
            })
            .with_rotor(Rotor {
                position: 1,
                settle_secs: 1,
            });
        let steps = sc.sec_sequence(Polarisation::Horizontal, Band::Low);
        assert_eq!(steps[0].msg[2], 0x38, "switch first by default");
        assert_eq!(steps[1].msg[1], 0x31, "rotor second");

        let mut swapped = sc.clone();
        swapped.switch_before_rotor = false;
        let steps = swapped.sec_sequence(Polarisation::Horizontal, Band::Low);
        assert_eq!(steps[0].msg[1], 0x31, "rotor first when configured");
    }

    #[test]
    fn test_en50494_tuning_word() {
        let uc = Unicable {
            variant: UnicableVariant::En50494,
            scr: 0,
            scr_freq_khz: 1_400_000,
            position: 0,
            pin: None,
        };
        // 11 012 000 kHz low band: IF = 1 262 000 kHz
        // T = round((1262 + 1400) / 4) - 350 = 666 - 350 = 315... in MHz:
        // (1_262_000 + 1_400_000 + 2_000) / 4_000 - 350 = 666 - 350 = 316
        let step = uc.tune_command(11_012_000, Polarisation::Horizontal, Band::Low);
        assert_eq!(step.msg.len(), 5);
        assert_eq!(step.msg[0], 0xE0);
        assert_eq!(step.msg[1], 0x10);
        assert_eq!(step.msg[2], 0x5A);
        let t = (((step.msg[3] & 0x3) as u16) << 8) | step.msg[4] as u16;
        assert_eq!(t, 316);
        // H-pol bit set, low band bit clear
        assert_ne!(step.msg[3] & 0x08, 0);
        assert_eq!(step.msg[3] & 0x04, 0);
    }

    #[test]
    fn test_en50494_pin_variant() {
        let uc = Unicable {
            variant: UnicableVariant::En50494,
            scr: 2,
            scr_freq_khz: 1_210_000,
            position: 0,
            pin: Some(42),
        };
        let step = uc.tune_command(12_100_000, Polarisation::Vertical, Band::High);
        assert_eq!(step.msg.len(), 6);
        assert_eq!(step.msg[2], 0x5C);
        assert_eq!(step.msg[5], 42);
    }

    #[test]
    fn test_en50607_frame() {
        let uc = Unicable {
            variant: UnicableVariant::En50607,
            scr: 7,
            scr_freq_khz: 1_680_000,
            position: 1,
            pin: None,
        };
        // high band IF for 12 188 000 = 1 588 000 kHz -> T = 1588 - 100
        let step = uc.tune_command(12_188_000, Polarisation::Vertical, Band::High);
        assert_eq!(step.msg.len(), 4);
        assert_eq!(step.msg[0], 0x70);
        let t = (((step.msg[1] & 0x7) as u16) << 8) | step.msg[2] as u16;
        assert_eq!(t, 1488);
        assert_eq!(step.msg[1] >> 3, 7);
        // position 1, V-pol, high band
        assert_eq!(step.msg[3], (1 << 2) | 0x01);
    }
}
