//! All the interface bits for ARM.

pub mod ap;
pub mod dap;
pub mod dp;

use std::fmt::Debug;

pub use dap::{AdiTarget, Dap, DapRegistry, DeferredRead};
pub use dp::AdiVersion;

use crate::probe::BatchExecutionError;

/// Failures of debug port transactions.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("Target device responded with WAIT response to request.")]
    WaitResponse,
    #[error("Target device responded with FAULT response to request.")]
    FaultResponse,
    #[error("Target device did not respond to request (ACK {0:#05b}).")]
    NoAcknowledge(u8),
    #[error("Target power-up failed.")]
    TargetPowerUpFailed,
    #[error("Reading {register} failed while negotiating the ADI version")]
    NegotiationFailed {
        register: &'static str,
        #[source]
        source: Box<DapError>,
    },
    #[error("The debug port is not connected")]
    NotConnected,
    #[error("The result belongs to a run that is not the most recent completed one")]
    StaleResult,
    #[error("Executing the JTAG scans failed")]
    Jtag(#[from] BatchExecutionError),
}

/// Which kind of port a transaction addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

pub trait Register: Clone + From<u32> + Into<u32> + Sized + Debug {
    const ADDRESS: u8;
    const NAME: &'static str;
}
