//! Debug port registers and protocol versions.

use std::fmt;

use bitfield::bitfield;
use jep106::JEP106Code;

use super::Register;
use crate::config::ConfigError;

/// The ARM Debug Interface architecture version spoken to a debug port.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum AdiVersion {
    V5,
    V6,
}

impl AdiVersion {
    /// Offset added to every AP register address.
    pub fn ap_register_delta(self) -> u64 {
        match self {
            AdiVersion::V5 => 0x000,
            AdiVersion::V6 => 0xD00,
        }
    }
}

impl TryFrom<u8> for AdiVersion {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(AdiVersion::V5),
            6 => Ok(AdiVersion::V6),
            other => Err(ConfigError::InvalidAdiVersion(other)),
        }
    }
}

impl fmt::Display for AdiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdiVersion::V5 => write!(f, "ADIv5"),
            AdiVersion::V6 => write!(f, "ADIv6"),
        }
    }
}

/// Where a DP register lives: its bank (when banked) and its address A[3:0].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct DpRegisterAddress {
    pub bank: Option<u8>,
    pub address: u8,
}

impl fmt::Display for DpRegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            Some(bank) => write!(f, "{:#x} (bank {})", self.address, bank),
            None => write!(f, "{:#x}", self.address),
        }
    }
}

pub trait DpRegister: Register {
    /// The DPBANKSEL value this register needs, if it is banked.
    const BANK: Option<u8>;

    fn register_address() -> DpRegisterAddress {
        DpRegisterAddress {
            bank: Self::BANK,
            address: Self::ADDRESS,
        }
    }
}

/// Implements the conversions and register traits for a bitfield DP register.
macro_rules! dp_register {
    ($name:ident, $address:expr, $bank:expr, $display:expr) => {
        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(raw: $name) -> Self {
                raw.0
            }
        }

        impl Register for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = $display;
        }

        impl DpRegister for $name {
            const BANK: Option<u8> = $bank;
        }
    };
}

bitfield! {
    /// Written through the JTAG ABORT instruction rather than DPACC.
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

dp_register!(Abort, 0x0, None, "ABORT");

bitfield! {
    #[derive(Clone, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub w_data_err, _ : 7;
    pub read_ok, _ : 6;
    pub sticky_err, set_sticky_err: 5;
    pub stick_cmp, set_stick_cmp: 4;
    pub u8, trn_mode, _: 3, 2;
    pub sticky_orun, set_sticky_orun: 1;
    pub orun_detect, set_orun_detect: 0;
}

dp_register!(Ctrl, 0x4, Some(0), "CTRL/STAT");

bitfield! {
    /// SELECT as laid out by ADIv5.
    #[derive(Clone, Default)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

dp_register!(Select, 0x8, None, "SELECT");

bitfield! {
    /// SELECT as laid out by ADIv6: bits [31:4] of the AP register address.
    #[derive(Clone, Default)]
    pub struct SelectV6(u32);
    impl Debug;
    pub u32, addr, set_addr: 31, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

dp_register!(SelectV6, 0x8, None, "SELECT");

bitfield! {
    /// Bits [63:32] of the AP register address, ADIv6 only.
    #[derive(Clone, Default)]
    pub struct Select1(u32);
    impl Debug;
    pub u32, addr, set_addr: 31, 0;
}

dp_register!(Select1, 0x4, Some(5), "SELECT1");

#[derive(Clone, Copy, Debug, Default)]
pub struct RdBuff(pub u32);

dp_register!(RdBuff, 0xC, None, "RDBUFF");

bitfield! {
    #[derive(Clone)]
    pub struct DPIDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub designer, _: 11, 1;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

dp_register!(DPIDR, 0x0, Some(0), "DPIDR");

bitfield! {
    /// ADIv6 only.
    #[derive(Clone)]
    pub struct DPIDR1(u32);
    impl Debug;
    pub errmode, _: 7;
    /// Address size in bits.
    pub u8, asize, _: 6, 0;
}

dp_register!(DPIDR1, 0x0, Some(1), "DPIDR1");

#[derive(Debug)]
pub struct DebugPortId {
    pub revision: u8,
    pub part_no: u8,
    pub version: DebugPortVersion,
    pub min_dp_support: MinDpSupport,
    pub designer: JEP106Code,
}

impl From<DPIDR> for DebugPortId {
    fn from(dpidr: DPIDR) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            version: dpidr.version().into(),
            min_dp_support: dpidr.min().into(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

impl fmt::Display for DebugPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} rev {} part {:#04x} by {}",
            self.version,
            self.revision,
            self.part_no,
            self.designer.get().unwrap_or("<unknown designer>")
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MinDpSupport {
    NotImplemented,
    Implemented,
}

impl From<bool> for MinDpSupport {
    fn from(bit_set: bool) -> Self {
        if bit_set {
            MinDpSupport::Implemented
        } else {
            MinDpSupport::NotImplemented
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DebugPortVersion {
    DPv0,
    DPv1,
    DPv2,
    DPv3,
    Unsupported(u8),
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            3 => DebugPortVersion::DPv3,
            other => DebugPortVersion::Unsupported(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dpidr_fields() {
        // Cortex-M4 style SW-DP: ARM designer, DPv1.
        let dpidr = DPIDR(0x2BA0_1477);
        let id = DebugPortId::from(dpidr.clone());

        assert_eq!(dpidr.version(), 1);
        assert_eq!(id.version, DebugPortVersion::DPv1);
        assert_eq!(id.revision, 2);
        assert_eq!(id.part_no, 0xBA);
        assert_eq!(id.designer.get(), Some("ARM Ltd"));
    }

    #[test]
    fn dpidr1_asize() {
        assert_eq!(DPIDR1(0x0000_0040).asize(), 64);
        assert_eq!(DPIDR1(0x0000_00A0).asize(), 0x20);
    }

    #[test]
    fn select_layouts() {
        let mut v5 = Select(0);
        v5.set_ap_sel(0x12);
        v5.set_ap_bank_sel(0xF);
        v5.set_dp_bank_sel(0x2);
        assert_eq!(u32::from(v5), 0x1200_00F2);

        let mut v6 = SelectV6(0);
        v6.set_addr(0x8001_0D0F >> 4);
        v6.set_dp_bank_sel(0x5);
        assert_eq!(u32::from(v6), 0x8001_0D05);
    }

    #[test]
    fn adi_version_from_config_value() {
        assert_eq!(AdiVersion::try_from(5).unwrap(), AdiVersion::V5);
        assert_eq!(AdiVersion::try_from(6).unwrap(), AdiVersion::V6);
        assert!(matches!(
            AdiVersion::try_from(4),
            Err(ConfigError::InvalidAdiVersion(4))
        ));
    }
}
