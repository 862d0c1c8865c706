//! Access port records and register offsets.

use std::fmt;

use crate::config::ConfigError;

use super::dp::AdiVersion;

/// Number of access ports a debug port can address.
pub const AP_COUNT: usize = 256;

/// HPROT1 (privileged), MasterType (debug) and DbgSwEnable.
pub const CSW_AHB_DEFAULT: u32 = 0xA200_0000;

/// Highest TCK wait-state count accepted after memory accesses.
pub const MEMACCESS_TCK_MAX: u32 = 255;

/// AP base addresses are 4 KiB aligned.
pub const AP_BASE_ALIGNMENT: u64 = 0x1000;

/// Registers of an access port, by offset inside its register window.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ApRegister {
    Csw,
    Tar,
    Tar2,
    Drw,
    Bd0,
    Bd1,
    Bd2,
    Bd3,
    Mbt,
    Cfg,
    Base,
    Idr,
}

impl ApRegister {
    pub fn offset(self) -> u16 {
        match self {
            ApRegister::Csw => 0x00,
            ApRegister::Tar => 0x04,
            ApRegister::Tar2 => 0x08,
            ApRegister::Drw => 0x0C,
            ApRegister::Bd0 => 0x10,
            ApRegister::Bd1 => 0x14,
            ApRegister::Bd2 => 0x18,
            ApRegister::Bd3 => 0x1C,
            ApRegister::Mbt => 0x20,
            ApRegister::Cfg => 0xF4,
            ApRegister::Base => 0xF8,
            ApRegister::Idr => 0xFC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ApRegister::Csw => "CSW",
            ApRegister::Tar => "TAR",
            ApRegister::Tar2 => "TAR2",
            ApRegister::Drw => "DRW",
            ApRegister::Bd0 => "BD0",
            ApRegister::Bd1 => "BD1",
            ApRegister::Bd2 => "BD2",
            ApRegister::Bd3 => "BD3",
            ApRegister::Mbt => "MBT",
            ApRegister::Cfg => "CFG",
            ApRegister::Base => "BASE",
            ApRegister::Idr => "IDR",
        }
    }

    /// Accesses to these registers start a memory transfer on the bus.
    pub fn is_memory_access(self) -> bool {
        matches!(
            self,
            ApRegister::Drw | ApRegister::Bd0 | ApRegister::Bd1 | ApRegister::Bd2 | ApRegister::Bd3
        )
    }
}

impl fmt::Display for ApRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-AP configuration.
///
/// `base` and `csw_default` survive [`AccessPorts::reset`] once they were set
/// explicitly.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AccessPort {
    ap_num: u8,
    base: u64,
    csw_default: u32,
    configured: bool,
    memaccess_tck: u32,
    /// TAR auto-increment wraps at this boundary.
    pub tar_autoincr_block: u32,
    /// Cached CFG register, `None` until it was read.
    pub cfg_reg: Option<u32>,
}

impl AccessPort {
    pub fn new(ap_num: u8) -> Self {
        Self {
            ap_num,
            base: u64::from(ap_num) << 16,
            csw_default: CSW_AHB_DEFAULT,
            configured: false,
            memaccess_tck: MEMACCESS_TCK_MAX,
            tar_autoincr_block: 1 << 10,
            cfg_reg: None,
        }
    }

    pub fn ap_num(&self) -> u8 {
        self.ap_num
    }

    /// Base of the register window, used for ADIv6 addressing.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// CSW value used for memory accesses.
    pub fn csw_default(&self) -> u32 {
        self.csw_default
    }

    /// TCK cycles spent in Run-Test/Idle after each memory access.
    pub fn memaccess_tck(&self) -> u32 {
        self.memaccess_tck
    }

    /// Whether `base` or `csw_default` was set explicitly.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Whether the CFG register reports large physical addresses.
    pub fn has_large_physical_address(&self) -> bool {
        self.cfg_reg.is_some_and(|cfg| cfg & 0x2 != 0)
    }

    /// The address of `register` under the given protocol version.
    ///
    /// ADIv5 addresses registers by APSEL and offset, so the result is the
    /// offset alone. ADIv6 places them at `base + 0xD00 + offset`.
    pub fn register_address(&self, version: AdiVersion, register: ApRegister) -> u64 {
        let offset = version.ap_register_delta() + u64::from(register.offset());
        match version {
            AdiVersion::V5 => offset,
            AdiVersion::V6 => self.base + offset,
        }
    }

    pub fn set_memaccess_tck(&mut self, cycles: u32) -> Result<(), ConfigError> {
        if cycles > MEMACCESS_TCK_MAX {
            return Err(ConfigError::MemaccessTckOutOfRange(cycles));
        }
        self.memaccess_tck = cycles;
        Ok(())
    }

    pub fn set_base(&mut self, base: u64) -> Result<(), ConfigError> {
        if base % AP_BASE_ALIGNMENT != 0 {
            return Err(ConfigError::ApBaseUnaligned(base));
        }
        self.base = base;
        self.configured = true;
        Ok(())
    }

    pub fn set_csw_default(&mut self, csw: u32) {
        self.csw_default = csw;
        self.configured = true;
    }

    fn reset(&mut self) {
        let mut defaults = AccessPort::new(self.ap_num);
        if self.configured {
            defaults.base = self.base;
            defaults.csw_default = self.csw_default;
            defaults.configured = true;
        }
        *self = defaults;
    }
}

/// The access ports owned by one debug port, indexed by AP number.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AccessPorts {
    ports: Vec<AccessPort>,
}

impl Default for AccessPorts {
    fn default() -> Self {
        Self {
            ports: (0..AP_COUNT).map(|i| AccessPort::new(i as u8)).collect(),
        }
    }
}

impl AccessPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ap_num: u8) -> &AccessPort {
        &self.ports[usize::from(ap_num)]
    }

    pub fn get_mut(&mut self, ap_num: u8) -> &mut AccessPort {
        &mut self.ports[usize::from(ap_num)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessPort> {
        self.ports.iter()
    }

    /// Restores every AP to its defaults, keeping explicitly configured
    /// base addresses and CSW values.
    pub fn reset(&mut self) {
        for port in &mut self.ports {
            port.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0; "first")]
    #[test_case(1; "second")]
    #[test_case(0x42; "middle")]
    #[test_case(255; "last")]
    fn default_base_is_index_shifted(ap_num: u8) {
        let aps = AccessPorts::new();
        assert_eq!(aps.get(ap_num).base(), u64::from(ap_num) << 16);
    }

    #[test]
    fn defaults() {
        let ap = AccessPort::new(3);

        assert_eq!(ap.ap_num(), 3);
        assert_eq!(ap.csw_default(), CSW_AHB_DEFAULT);
        assert_eq!(ap.memaccess_tck(), 255);
        assert_eq!(ap.tar_autoincr_block, 1024);
        assert_eq!(ap.cfg_reg, None);
        assert!(!ap.has_large_physical_address());
        assert!(!ap.is_configured());
    }

    #[test]
    fn register_address_per_version() {
        let mut ap = AccessPort::new(2);
        ap.set_base(0x8000_0000).unwrap();

        assert_eq!(ap.register_address(AdiVersion::V5, ApRegister::Idr), 0xFC);
        assert_eq!(
            ap.register_address(AdiVersion::V6, ApRegister::Csw),
            0x8000_0D00
        );
        assert_eq!(
            ap.register_address(AdiVersion::V6, ApRegister::Idr),
            0x8000_0DFC
        );
    }

    #[test]
    fn unaligned_base_is_rejected() {
        let mut ap = AccessPort::new(0);

        assert!(matches!(
            ap.set_base(0x1_0800),
            Err(ConfigError::ApBaseUnaligned(0x1_0800))
        ));
        assert_eq!(ap.base(), 0);
        assert!(!ap.is_configured());
    }

    #[test_case(0; "zero")]
    #[test_case(8; "small")]
    #[test_case(255; "maximum")]
    fn memaccess_tck_in_range_is_accepted(cycles: u32) {
        let mut ap = AccessPort::new(0);
        ap.set_memaccess_tck(cycles).unwrap();
        assert_eq!(ap.memaccess_tck(), cycles);
    }

    #[test]
    fn memaccess_tck_above_maximum_is_rejected() {
        let mut ap = AccessPort::new(0);
        ap.set_memaccess_tck(16).unwrap();

        assert!(matches!(
            ap.set_memaccess_tck(256),
            Err(ConfigError::MemaccessTckOutOfRange(256))
        ));
        assert_eq!(ap.memaccess_tck(), 16);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut aps = AccessPorts::new();
        aps.get_mut(7).cfg_reg = Some(2);
        aps.get_mut(7).tar_autoincr_block = 1 << 12;
        aps.get_mut(7).set_memaccess_tck(4).unwrap();

        aps.reset();

        assert_eq!(aps.get(7), &AccessPort::new(7));
        assert_eq!(aps.iter().count(), AP_COUNT);
    }

    #[test]
    fn reset_keeps_configured_base_and_csw() {
        let mut aps = AccessPorts::new();
        aps.get_mut(7).set_base(0x8000_0000).unwrap();
        aps.get_mut(9).set_csw_default(0x2300_0002);
        aps.get_mut(7).cfg_reg = Some(2);
        aps.get_mut(7).set_memaccess_tck(4).unwrap();

        aps.reset();

        let ap = aps.get(7);
        assert_eq!(ap.base(), 0x8000_0000);
        assert_eq!(ap.csw_default(), CSW_AHB_DEFAULT);
        assert_eq!(ap.cfg_reg, None);
        assert_eq!(ap.memaccess_tck(), MEMACCESS_TCK_MAX);
        assert!(ap.is_configured());

        let ap = aps.get(9);
        assert_eq!(ap.base(), 9 << 16);
        assert_eq!(ap.csw_default(), 0x2300_0002);
    }
}
