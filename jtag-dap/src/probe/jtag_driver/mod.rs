//! Backend for the Linux JTAG class driver (`/dev/jtagN`).
//!
//! The kernel driver performs whole scans and state moves itself. In hardware
//! accelerated transfer mode the controller cannot be reset with the state-set
//! request, so the reset is done by bit-banging TMS instead.

#[cfg(target_os = "linux")]
mod device;

#[cfg(target_os = "linux")]
pub use device::JtagDeviceNode;

use std::io;

use serde::{Deserialize, Serialize};

use super::{
    BackendCapabilities, DebugProbeError, JtagBackend, LastInstruction, RawScan, ScanRegister,
    ScanType, TapState,
};

/// `struct jtag_end_tap_state`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EndTapState {
    pub reset: u8,
    pub endstate: u8,
    pub tck: u8,
}

/// `struct jtag_xfer`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Transfer {
    pub xfer_type: u8,
    pub direction: u8,
    pub endstate: u8,
    pub padding: u8,
    pub length: u32,
    pub tdio: u64,
}

/// `struct tck_bitbang`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TckBitbang {
    pub tms: u8,
    pub tdi: u8,
    pub tdo: u8,
}

/// `struct jtag_mode`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Mode {
    pub feature: u32,
    pub mode: u32,
}

pub const JTAG_NO_RESET: u8 = 0;
pub const JTAG_FORCE_RESET: u8 = 1;

pub const JTAG_SIR_XFER: u8 = 0;
pub const JTAG_SDR_XFER: u8 = 1;

pub const JTAG_READ_XFER: u8 = 1;
pub const JTAG_WRITE_XFER: u8 = 2;
pub const JTAG_READ_WRITE_XFER: u8 = 3;

pub const JTAG_XFER_MODE: u32 = 0;
pub const JTAG_CONTROL_MODE: u32 = 1;
pub const JTAG_MASTER_MODE: u32 = 1;
pub const JTAG_XFER_HW_MODE: u32 = 1;
pub const JTAG_XFER_SW_MODE: u32 = 0;

/// The kernel's `enum jtag_tapstate` value for a TAP state.
pub fn kernel_state(state: TapState) -> u8 {
    TapState::ALL
        .iter()
        .position(|s| *s == state)
        .unwrap_or_default() as u8
}

/// The requests the JTAG class driver understands.
///
/// Implemented by [`JtagDeviceNode`] for the real device.
pub trait JtagDevice: std::fmt::Debug + Send {
    fn set_mode(&mut self, mode: &Mode) -> io::Result<()>;
    fn set_state(&mut self, state: &EndTapState) -> io::Result<()>;
    fn set_frequency(&mut self, hz: u32) -> io::Result<()>;
    fn frequency(&mut self) -> io::Result<u32>;
    /// Performs `xfer` on `data`, which is updated in place with TDO.
    fn transfer(&mut self, xfer: &mut Transfer, data: &mut [u8]) -> io::Result<()>;
    fn bitbang(&mut self, bitbang: &mut TckBitbang) -> io::Result<()>;
}

/// Device settings for [`JtagDriverBackend`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JtagDriverConfig {
    /// The `N` in `/dev/jtagN`.
    pub instance: u32,
    /// Use the controller's hardware transfer mode instead of software bit-banging.
    pub hw_accel: bool,
}

impl Default for JtagDriverConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            hw_accel: true,
        }
    }
}

impl JtagDriverConfig {
    pub fn device_path(&self) -> std::path::PathBuf {
        format!("/dev/jtag{}", self.instance).into()
    }
}

/// JTAG through the Linux JTAG class driver.
#[derive(Debug)]
pub struct JtagDriverBackend<D> {
    device: D,
    hw_accel: bool,
}

#[cfg(target_os = "linux")]
impl JtagDriverBackend<JtagDeviceNode> {
    /// Opens the device node described by `config` and puts the controller in
    /// master mode.
    pub fn open(config: &JtagDriverConfig) -> Result<Self, DebugProbeError> {
        let path = config.device_path();
        let device = JtagDeviceNode::open(&path).map_err(|source| {
            tracing::error!("Can't open {}: {}", path.display(), source);
            DebugProbeError::DeviceOpen { path, source }
        })?;
        Self::with_device(device, config.hw_accel)
    }
}

impl<D: JtagDevice> JtagDriverBackend<D> {
    /// Configures `device` for master operation in the requested transfer mode.
    pub fn with_device(mut device: D, hw_accel: bool) -> Result<Self, DebugProbeError> {
        device
            .set_mode(&Mode {
                feature: JTAG_CONTROL_MODE,
                mode: JTAG_MASTER_MODE,
            })
            .map_err(ioctl_error("JTAG_SIOCMODE (control)"))?;

        let xfer_mode = if hw_accel {
            JTAG_XFER_HW_MODE
        } else {
            JTAG_XFER_SW_MODE
        };
        device
            .set_mode(&Mode {
                feature: JTAG_XFER_MODE,
                mode: xfer_mode,
            })
            .map_err(ioctl_error("JTAG_SIOCMODE (transfer)"))?;

        tracing::info!(
            "JTAG driver in {} transfer mode",
            if hw_accel { "hardware" } else { "software" }
        );

        Ok(Self { device, hw_accel })
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn bitbang(&mut self, tms: bool, tdi: bool) -> Result<bool, DebugProbeError> {
        let mut bitbang = TckBitbang {
            tms: tms.into(),
            tdi: tdi.into(),
            tdo: 0,
        };
        self.device
            .bitbang(&mut bitbang)
            .map_err(ioctl_error("JTAG_IOCBITBANG"))?;
        Ok(bitbang.tdo != 0)
    }
}

fn ioctl_error(request: &'static str) -> impl Fn(io::Error) -> DebugProbeError {
    move |source| DebugProbeError::Ioctl { request, source }
}

/// Converts a frequency in Hz to the kHz speed used by adapter configuration.
pub fn speed_to_khz(hz: u32) -> u32 {
    hz / 1000
}

/// Converts a kHz speed to the frequency in Hz programmed into the device.
pub fn khz_to_speed(khz: u32) -> Result<u32, DebugProbeError> {
    khz.checked_mul(1000)
        .ok_or(DebugProbeError::UnsupportedSpeed(khz))
}

impl<D: JtagDevice> JtagBackend for JtagDriverBackend<D> {
    fn name(&self) -> &str {
        "Linux JTAG driver"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            set_state: true,
            stale_capture_after_reset: self.hw_accel,
        }
    }

    fn scan(&mut self, scan: RawScan<'_>) -> Result<(), DebugProbeError> {
        let length = u32::try_from(scan.bits).map_err(|_| {
            DebugProbeError::Other(anyhow::anyhow!("Scan of {} bits is too long", scan.bits))
        })?;

        let mut xfer = Transfer {
            xfer_type: match scan.register {
                ScanRegister::Ir => JTAG_SIR_XFER,
                ScanRegister::Dr => JTAG_SDR_XFER,
            },
            direction: match scan.scan_type {
                ScanType::In => JTAG_READ_XFER,
                ScanType::Out => JTAG_WRITE_XFER,
                ScanType::Duplex => JTAG_READ_WRITE_XFER,
            },
            endstate: kernel_state(scan.end_state),
            padding: 0,
            length,
            tdio: 0,
        };

        self.device
            .transfer(&mut xfer, scan.data)
            .map_err(ioctl_error("JTAG_IOCXFER"))
    }

    fn reset_tap(&mut self) -> Result<TapState, DebugProbeError> {
        if self.hw_accel {
            // The state-set request does not reset the controller in hardware mode.
            for _ in 0..5 {
                self.bitbang(true, false)?;
            }
        } else {
            self.device
                .set_state(&EndTapState {
                    reset: JTAG_FORCE_RESET,
                    endstate: kernel_state(TapState::Reset),
                    tck: 0,
                })
                .map_err(ioctl_error("JTAG_SIOCSTATE"))?;
        }
        Ok(TapState::Reset)
    }

    fn idle_clocks(
        &mut self,
        cycles: u32,
        _last_ir: Option<&LastInstruction>,
    ) -> Result<(), DebugProbeError> {
        for _ in 0..cycles {
            self.bitbang(false, false)?;
        }
        Ok(())
    }

    fn clock_tms(&mut self, tms: bool) -> Result<(), DebugProbeError> {
        self.bitbang(tms, false).map(|_| ())
    }

    fn set_state(&mut self, state: TapState) -> Result<(), DebugProbeError> {
        self.device
            .set_state(&EndTapState {
                reset: JTAG_NO_RESET,
                endstate: kernel_state(state),
                tck: 0,
            })
            .map_err(ioctl_error("JTAG_SIOCSTATE"))
    }

    fn set_speed(&mut self, hz: u32) -> Result<u32, DebugProbeError> {
        self.device
            .set_frequency(hz)
            .map_err(ioctl_error("JTAG_SIOCFREQ"))?;
        self.speed()
    }

    fn speed(&mut self) -> Result<u32, DebugProbeError> {
        self.device
            .frequency()
            .map_err(ioctl_error("JTAG_GIOCFREQ"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, PartialEq, Eq, Debug)]
    enum Request {
        Mode(Mode),
        State(EndTapState),
        SetFrequency(u32),
        Transfer(Transfer, Vec<u8>),
        Bitbang(u8),
    }

    #[derive(Debug, Default)]
    struct MockDevice {
        requests: Vec<Request>,
        frequency: u32,
    }

    impl JtagDevice for MockDevice {
        fn set_mode(&mut self, mode: &Mode) -> io::Result<()> {
            self.requests.push(Request::Mode(*mode));
            Ok(())
        }

        fn set_state(&mut self, state: &EndTapState) -> io::Result<()> {
            self.requests.push(Request::State(*state));
            Ok(())
        }

        fn set_frequency(&mut self, hz: u32) -> io::Result<()> {
            self.requests.push(Request::SetFrequency(hz));
            // The controller rounds down to its divider.
            self.frequency = hz - hz % 3;
            Ok(())
        }

        fn frequency(&mut self) -> io::Result<u32> {
            Ok(self.frequency)
        }

        fn transfer(&mut self, xfer: &mut Transfer, data: &mut [u8]) -> io::Result<()> {
            self.requests.push(Request::Transfer(*xfer, data.to_vec()));
            data.iter_mut().for_each(|b| *b = !*b);
            Ok(())
        }

        fn bitbang(&mut self, bitbang: &mut TckBitbang) -> io::Result<()> {
            self.requests.push(Request::Bitbang(bitbang.tms));
            bitbang.tdo = 1;
            Ok(())
        }
    }

    fn backend(hw_accel: bool) -> JtagDriverBackend<MockDevice> {
        let mut backend = JtagDriverBackend::with_device(MockDevice::default(), hw_accel).unwrap();
        backend.device.requests.clear();
        backend
    }

    #[test]
    fn open_selects_master_and_transfer_mode() {
        let backend = JtagDriverBackend::with_device(MockDevice::default(), false).unwrap();

        assert_eq!(
            backend.into_inner().requests,
            vec![
                Request::Mode(Mode {
                    feature: JTAG_CONTROL_MODE,
                    mode: JTAG_MASTER_MODE
                }),
                Request::Mode(Mode {
                    feature: JTAG_XFER_MODE,
                    mode: JTAG_XFER_SW_MODE
                }),
            ]
        );
    }

    #[test]
    fn hardware_reset_bitbangs_five_tms_high() {
        let mut backend = backend(true);

        assert_eq!(backend.reset_tap().unwrap(), TapState::Reset);
        assert_eq!(backend.device.requests, vec![Request::Bitbang(1); 5]);
        assert!(backend.capabilities().stale_capture_after_reset);
    }

    #[test]
    fn software_reset_uses_force_reset_state() {
        let mut backend = backend(false);

        backend.reset_tap().unwrap();

        assert_eq!(
            backend.device.requests,
            vec![Request::State(EndTapState {
                reset: JTAG_FORCE_RESET,
                endstate: 0,
                tck: 0
            })]
        );
        assert!(!backend.capabilities().stale_capture_after_reset);
    }

    #[test]
    fn scan_maps_register_direction_and_end_state() {
        let mut backend = backend(true);
        let mut data = [0x0F, 0x00];

        backend
            .scan(RawScan {
                register: ScanRegister::Dr,
                scan_type: ScanType::Duplex,
                data: &mut data,
                bits: 12,
                end_state: TapState::DR_PAUSE,
            })
            .unwrap();

        assert_eq!(data, [0xF0, 0xFF]);
        assert_eq!(
            backend.device.requests,
            vec![Request::Transfer(
                Transfer {
                    xfer_type: JTAG_SDR_XFER,
                    direction: JTAG_READ_WRITE_XFER,
                    endstate: 6,
                    padding: 0,
                    length: 12,
                    tdio: 0,
                },
                vec![0x0F, 0x00]
            )]
        );
    }

    #[test]
    fn idle_clocks_bitbang_tms_low() {
        let mut backend = backend(true);

        backend.idle_clocks(3, None).unwrap();

        assert_eq!(backend.device.requests, vec![Request::Bitbang(0); 3]);
    }

    #[test]
    fn speed_reads_back_the_programmed_frequency() {
        let mut backend = backend(true);

        assert_eq!(backend.set_speed(1_000_000).unwrap(), 999_999);
        assert_eq!(speed_to_khz(999_999), 999);
        assert_eq!(khz_to_speed(400).unwrap(), 400_000);
    }

    #[test]
    fn kernel_states_follow_the_driver_enumeration() {
        assert_eq!(kernel_state(TapState::Reset), 0);
        assert_eq!(kernel_state(TapState::Idle), 1);
        assert_eq!(kernel_state(TapState::DR_SHIFT), 4);
        assert_eq!(kernel_state(TapState::IR_PAUSE), 13);
    }
}
