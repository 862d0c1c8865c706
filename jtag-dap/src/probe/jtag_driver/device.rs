//! The `/dev/jtagN` character device.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::Path;

use super::{EndTapState, JtagDevice, Mode, TckBitbang, Transfer};

const JTAG_IOCTL_MAGIC: u32 = 0xb2;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (JTAG_IOCTL_MAGIC << 8) | nr
}

const JTAG_SIOCSTATE: u32 = ioc(IOC_WRITE, 0, size_of::<EndTapState>());
const JTAG_SIOCFREQ: u32 = ioc(IOC_WRITE, 1, size_of::<u32>());
const JTAG_GIOCFREQ: u32 = ioc(IOC_READ, 2, size_of::<u32>());
const JTAG_IOCXFER: u32 = ioc(IOC_READ | IOC_WRITE, 3, size_of::<Transfer>());
const JTAG_SIOCMODE: u32 = ioc(IOC_WRITE, 5, size_of::<Mode>());
const JTAG_IOCBITBANG: u32 = ioc(IOC_READ | IOC_WRITE, 6, size_of::<TckBitbang>());

/// An open JTAG class device.
#[derive(Debug)]
pub struct JtagDeviceNode {
    file: File,
}

impl JtagDeviceNode {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        tracing::debug!("Opened {}", path.display());
        Ok(Self { file })
    }

    /// Issues `request` with a pointer to `arg`.
    fn ioctl<T>(&mut self, request: u32, arg: *mut T) -> io::Result<()> {
        // SAFETY: `arg` points to a live `#[repr(C)]` value of the size encoded
        // in `request`, and the descriptor stays open for the duration of the call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl JtagDevice for JtagDeviceNode {
    fn set_mode(&mut self, mode: &Mode) -> io::Result<()> {
        let mut mode = *mode;
        self.ioctl(JTAG_SIOCMODE, &mut mode)
    }

    fn set_state(&mut self, state: &EndTapState) -> io::Result<()> {
        let mut state = *state;
        self.ioctl(JTAG_SIOCSTATE, &mut state)
    }

    fn set_frequency(&mut self, hz: u32) -> io::Result<()> {
        let mut hz = hz;
        self.ioctl(JTAG_SIOCFREQ, &mut hz)
    }

    fn frequency(&mut self) -> io::Result<u32> {
        let mut hz = 0u32;
        self.ioctl(JTAG_GIOCFREQ, &mut hz)?;
        Ok(hz)
    }

    fn transfer(&mut self, xfer: &mut Transfer, data: &mut [u8]) -> io::Result<()> {
        if (xfer.length as usize).div_ceil(8) > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "transfer buffer shorter than its bit length",
            ));
        }
        // The driver reads TDI from and writes TDO to this buffer.
        xfer.tdio = data.as_mut_ptr() as u64;
        let result = self.ioctl(JTAG_IOCXFER, xfer as *mut Transfer);
        xfer.tdio = 0;
        result
    }

    fn bitbang(&mut self, bitbang: &mut TckBitbang) -> io::Result<()> {
        self.ioctl(JTAG_IOCBITBANG, bitbang as *mut TckBitbang)
    }
}
