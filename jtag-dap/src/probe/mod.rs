//! JTAG command execution and the backends it runs on.

pub mod common;
pub mod dpi;
pub mod engine;
pub mod fake_probe;
pub mod jtag_driver;
pub mod queue;
pub mod tap;

use std::{fmt, path::PathBuf};

use bitvec::prelude::*;
use thiserror::Error;

pub use common::{ChainParams, ScanChain, TapConfig};
pub use engine::JtagEngine;
pub use queue::{
    BatchExecutionError, CommandQueue, CommandResult, DeferredResultIndex, DeferredResultSet,
    JtagCommand, ScanCommand, ScanType,
};
pub use tap::{RegisterState, TapState, TapStateMachine};

/// Failures talking to the backend itself.
#[derive(Error, Debug)]
pub enum DebugProbeError {
    #[error("I/O error while communicating with the backend")]
    Io(#[from] std::io::Error),
    #[error("The {request} request to the JTAG device failed")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("The JTAG device {} could not be opened", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("The backend does not support {0}")]
    NotSupported(&'static str),
    #[error("Idle clocks were requested before any instruction was shifted")]
    NoInstruction,
    #[error("The requested speed setting ({0} Hz) is not supported by the backend")]
    UnsupportedSpeed(u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures executing JTAG commands.
#[derive(Error, Debug)]
pub enum JtagError {
    #[error("{0} is not a stable end state")]
    UnstableEndState(TapState),
    #[error("The {0} command is not supported")]
    Unsupported(&'static str),
    #[error("The TAP state is unknown after a backend failure, a Test-Logic-Reset is required")]
    StateUntrusted,
    #[error("The backend failed")]
    Probe(#[from] DebugProbeError),
    #[error("Reset failed (TRST: {}, SRST: {})", outcome(.trst), outcome(.srst))]
    Reset {
        trst: Option<DebugProbeError>,
        srst: Option<DebugProbeError>,
    },
}

fn outcome(result: &Option<DebugProbeError>) -> String {
    match result {
        Some(error) => error.to_string(),
        None => "ok".to_string(),
    }
}

/// Which register a scan shifts through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanRegister {
    Ir,
    Dr,
}

impl fmt::Display for ScanRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanRegister::Ir => write!(f, "IR"),
            ScanRegister::Dr => write!(f, "DR"),
        }
    }
}

/// One scan as handed to a backend.
///
/// `data` holds `bits` bits, LSB first. Outgoing bits are read from it and
/// captured bits are written back into it in place.
#[derive(Debug)]
pub struct RawScan<'a> {
    pub register: ScanRegister,
    pub scan_type: ScanType,
    pub data: &'a mut [u8],
    pub bits: usize,
    pub end_state: TapState,
}

/// Optional behaviour a backend advertises to the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BackendCapabilities {
    /// The backend moves between stable states with [`JtagBackend::set_state`]
    /// instead of individual TMS clocks.
    pub set_state: bool,
    /// The first capture after a TAP reset is stale and has to be read and
    /// discarded with a 1-bit DR scan.
    pub stale_capture_after_reset: bool,
}

/// The instruction most recently shifted into the IR.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LastInstruction {
    bits: BitVec<u8, Lsb0>,
}

impl LastInstruction {
    pub fn new(bits: BitVec<u8, Lsb0>) -> Self {
        Self { bits }
    }

    /// Length of the instruction in bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &BitSlice<u8, Lsb0> {
        &self.bits
    }

    /// The instruction packed into bytes, LSB first, with unused high bits cleared.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }
}

/// The primitive operations a JTAG transport provides.
///
/// The engine tracks the TAP state and calls these in order. An error from any
/// of them leaves the TAP state untrusted in the engine.
pub trait JtagBackend: fmt::Debug + Send {
    /// Get human readable name for the backend.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Shifts `scan.bits` bits through the selected register and leaves the TAP
    /// in `scan.end_state`.
    fn scan(&mut self, scan: RawScan<'_>) -> Result<(), DebugProbeError>;

    /// Drives the TAP into Test-Logic-Reset and returns the state it is left in.
    fn reset_tap(&mut self) -> Result<TapState, DebugProbeError>;

    /// Asserts the system reset signal.
    fn reset_system(&mut self) -> Result<(), DebugProbeError> {
        Err(DebugProbeError::NotSupported("system reset (SRST)"))
    }

    /// Clocks TCK `cycles` times in Run-Test/Idle.
    ///
    /// `last_ir` is the instruction most recently shifted, for transports that
    /// can only clock by re-sending it.
    fn idle_clocks(
        &mut self,
        cycles: u32,
        last_ir: Option<&LastInstruction>,
    ) -> Result<(), DebugProbeError>;

    /// Clocks TCK once with the given TMS value.
    fn clock_tms(&mut self, tms: bool) -> Result<(), DebugProbeError>;

    /// Moves directly to a stable state. Only used when
    /// [`BackendCapabilities::set_state`] is advertised.
    fn set_state(&mut self, _state: TapState) -> Result<(), DebugProbeError> {
        Err(DebugProbeError::NotSupported("direct state moves"))
    }

    /// Programs the TCK frequency and returns the frequency actually in use.
    fn set_speed(&mut self, _hz: u32) -> Result<u32, DebugProbeError> {
        Err(DebugProbeError::NotSupported("speed configuration"))
    }

    /// The TCK frequency in use.
    fn speed(&mut self) -> Result<u32, DebugProbeError> {
        Err(DebugProbeError::NotSupported("speed configuration"))
    }
}
