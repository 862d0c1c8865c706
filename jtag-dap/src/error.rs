use crate::architecture::arm::DapError;
use crate::config::ConfigError;
use crate::probe::{BatchExecutionError, DebugProbeError, JtagError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An error with the usage of the backend occured")]
    Probe(#[from] DebugProbeError),
    #[error("A JTAG protocol error occured")]
    Jtag(#[from] JtagError),
    #[error("Executing the JTAG command queue failed")]
    Batch(#[from] BatchExecutionError),
    #[error("An ARM debug access port error occured")]
    Dap(#[from] DapError),
    #[error("The configuration is invalid")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
