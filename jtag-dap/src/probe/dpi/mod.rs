//! Backend for simulators exposing the JTAG DPI socket protocol.
//!
//! The simulator accepts one text command per line. `ib <n>` and `db <n>`
//! announce an IR or DR scan of `n` bits, followed by `ceil(n / 8)` bytes of
//! TDI data. The simulator answers with the same number of TDO bytes. `reset`
//! drives its TAP into Test-Logic-Reset.
//!
//! There is no command for single TMS clocks. After a failure the engine
//! recovers the TAP state with `reset`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    BackendCapabilities, DebugProbeError, JtagBackend, LastInstruction, RawScan, ScanRegister,
    TapState,
};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5555;
/// Clocks the simulator spends per IR command beyond the shifted bits.
pub const DEFAULT_IDLE_OVERHEAD_BITS: u32 = 6;

/// Connection settings for [`DpiBackend`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DpiConfig {
    pub address: String,
    pub port: u16,
    /// Clocks charged per re-sent instruction, on top of its length, when
    /// emulating idle clocks.
    pub idle_overhead_bits: u32,
    /// Read and write timeout for the socket, in milliseconds. Zero disables it.
    pub timeout_ms: u64,
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            idle_overhead_bits: DEFAULT_IDLE_OVERHEAD_BITS,
            timeout_ms: 0,
        }
    }
}

/// JTAG over a DPI simulator socket.
#[derive(Debug)]
pub struct DpiBackend<S = TcpStream> {
    stream: S,
    idle_overhead_bits: u32,
}

impl DpiBackend<TcpStream> {
    /// Connects to the simulator described by `config`.
    pub fn connect(config: &DpiConfig) -> Result<Self, DebugProbeError> {
        let addr = (config.address.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} does not resolve", config.address),
                )
            })?;

        let stream = TcpStream::connect(addr).map_err(|e| {
            tracing::error!("Can't connect to {}:{}: {}", config.address, config.port, e);
            e
        })?;

        if is_loopback(&addr) {
            // Small scans dominate, don't let Nagle batch them.
            stream.set_nodelay(true)?;
        }

        if config.timeout_ms > 0 {
            let timeout = Some(Duration::from_millis(config.timeout_ms));
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
        }

        tracing::info!("Connected to JTAG DPI server at {}", addr);

        Ok(Self::from_stream(stream, config.idle_overhead_bits))
    }
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

impl<S: Read + Write> DpiBackend<S> {
    /// Wraps an already connected stream.
    pub fn from_stream(stream: S, idle_overhead_bits: u32) -> Self {
        Self {
            stream,
            idle_overhead_bits,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends one scan command and replaces `data` with the simulator's answer.
    fn shift(
        &mut self,
        register: ScanRegister,
        data: &mut [u8],
        bits: usize,
    ) -> Result<(), DebugProbeError> {
        let bytes = bits.div_ceil(8);
        if data.len() < bytes {
            return Err(DebugProbeError::Other(anyhow::anyhow!(
                "Scan of {} bits needs {} bytes, got {}",
                bits,
                bytes,
                data.len()
            )));
        }

        let command = match register {
            ScanRegister::Ir => "ib",
            ScanRegister::Dr => "db",
        };

        let header = format!("{} {}\n", command, bits);
        self.stream.write_all(header.as_bytes())?;
        self.stream.write_all(&data[..bytes])?;
        self.stream.flush()?;

        self.stream.read_exact(&mut data[..bytes])?;

        Ok(())
    }
}

impl<S: Read + Write + std::fmt::Debug + Send> JtagBackend for DpiBackend<S> {
    fn name(&self) -> &str {
        "JTAG DPI"
    }

    fn capabilities(&self) -> BackendCapabilities {
        // Every simulator command is a complete scan starting and ending in
        // Run-Test/Idle, so state moves need no wire traffic.
        BackendCapabilities {
            set_state: true,
            stale_capture_after_reset: false,
        }
    }

    fn scan(&mut self, scan: RawScan<'_>) -> Result<(), DebugProbeError> {
        tracing::trace!("{} {} bits: {:02x?}", scan.register, scan.bits, scan.data);
        self.shift(scan.register, scan.data, scan.bits)
    }

    fn reset_tap(&mut self) -> Result<TapState, DebugProbeError> {
        self.stream.write_all(b"reset\n")?;
        self.stream.flush()?;
        Ok(TapState::Reset)
    }

    fn idle_clocks(
        &mut self,
        cycles: u32,
        last_ir: Option<&LastInstruction>,
    ) -> Result<(), DebugProbeError> {
        if cycles == 0 {
            return Ok(());
        }

        // The protocol has no idle command. Re-sending the last instruction
        // keeps the TAP doing nothing new while the clock runs.
        let Some(last_ir) = last_ir.filter(|ir| !ir.is_empty()) else {
            tracing::error!("No previous IR scan to repeat for idle clocks");
            return Err(DebugProbeError::NoInstruction);
        };

        let per_iteration = last_ir.len() as u64 + u64::from(self.idle_overhead_bits);
        let mut remaining = u64::from(cycles);
        let instruction = last_ir.to_bytes();

        while remaining > 0 {
            let mut data = instruction.clone();
            self.shift(ScanRegister::Ir, &mut data, last_ir.len())?;
            remaining = remaining.saturating_sub(per_iteration);
        }

        Ok(())
    }

    fn clock_tms(&mut self, _tms: bool) -> Result<(), DebugProbeError> {
        Err(DebugProbeError::NotSupported("raw TMS sequences"))
    }

    fn set_state(&mut self, state: TapState) -> Result<(), DebugProbeError> {
        tracing::trace!("DPI state move to {} needs no traffic", state);
        Ok(())
    }
}
