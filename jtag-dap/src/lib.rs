//! # JTAG command engine and ARM debug access port layer
//!
//! This crate drives a JTAG scan chain through its TAP state machine and,
//! layered on top, speaks the ARM Debug Interface (ADIv5 and ADIv6) to
//! access Debug Port and Access Port registers.
//!
//! # Examples
//!
//! ## Reading the DPIDR of a simulated target
//!
//! ```no_run
//! # use jtag_dap::Error;
//! use jtag_dap::architecture::arm::{dap::Dap, dp::DPIDR};
//! use jtag_dap::config::Configuration;
//! use jtag_dap::probe::JtagEngine;
//!
//! let config = Configuration::from_yaml(
//!     r#"
//! backend:
//!   kind: dpi
//! taps:
//!   - name: cpu.tap
//!     ir_len: 4
//! daps:
//!   - name: cpu.dap
//!     chain_position: cpu.tap
//! "#,
//! )?;
//!
//! let mut engine = JtagEngine::new(config.open_backend()?);
//! let (mut registry, _targets) = config.build_registry()?;
//! registry.init_all(&mut engine)?;
//!
//! let dap: &mut Dap = registry.get_mut("cpu.dap")?;
//! dap.power_up(&mut engine)?;
//! let dpidr: DPIDR = dap.read_dp_register(&mut engine)?;
//! println!("DP version {}", dpidr.version());
//! # Ok::<(), Error>(())
//! ```
//!
//! The crate is built around three pieces: the [`probe::JtagEngine`] which
//! executes a [`probe::CommandQueue`] against one [`probe::JtagBackend`], the
//! [`architecture::arm::dap::Dap`] which turns register accesses into JTAG-DP
//! scans, and the [`architecture::arm::dap::DapRegistry`] which owns the named
//! debug ports of a scan chain.

/// All the interface bits for the different architectures.
pub mod architecture;
pub mod config;
mod error;
pub mod probe;

pub use crate::error::Error;
pub use crate::probe::{DebugProbeError, JtagBackend, JtagEngine, JtagError};
