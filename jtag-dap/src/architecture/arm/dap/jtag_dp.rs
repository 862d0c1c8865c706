//! JTAG-DP scan encoding.
//!
//! Every DPACC and APACC access is a 35 bit DR scan. The bits shifted in hold
//! RnW in bit 0, A[3:2] in bits 2:1 and the write data in bits 34:3. The bits
//! captured hold the ACK in bits 2:0 and the read data in bits 34:3, both
//! belonging to the transaction shifted in before.

use bitvec::prelude::*;

use crate::architecture::arm::{dp::AdiVersion, DapError, PortType};

// IR values for JTAG registers
pub const JTAG_ABORT_IR_VALUE: u32 = 0x8;
pub const JTAG_DEBUG_PORT_IR_VALUE: u32 = 0xA;
pub const JTAG_ACCESS_PORT_IR_VALUE: u32 = 0xB;

pub const JTAG_STATUS_WAIT: u8 = 0b001;
/// OK/FAULT response, STICKYERR tells them apart.
pub const JTAG_STATUS_OK_FAULT: u8 = 0b010;
/// OK response of an ADIv6 debug port.
pub const JTAG_STATUS_OK: u8 = 0b100;

// ARM DR accesses are always 35 bits wide
pub const JTAG_DR_BIT_LENGTH: usize = 35;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferDirection {
    Read,
    Write,
}

/// One DPACC or APACC transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DapTransfer {
    pub port: PortType,
    /// Register address. Only A[3:2] goes on the wire.
    pub address: u8,
    pub direction: TransferDirection,
    pub value: u32,
    /// Run-Test/Idle clocks after the scan.
    pub idle_cycles_after: u32,
}

impl DapTransfer {
    pub fn read(port: PortType, address: u8) -> Self {
        Self {
            port,
            address,
            direction: TransferDirection::Read,
            value: 0,
            idle_cycles_after: 0,
        }
    }

    pub fn write(port: PortType, address: u8, value: u32) -> Self {
        Self {
            port,
            address,
            direction: TransferDirection::Write,
            value,
            idle_cycles_after: 0,
        }
    }

    pub fn with_idle_cycles(mut self, cycles: u32) -> Self {
        self.idle_cycles_after = cycles;
        self
    }

    pub fn instruction(&self) -> u32 {
        match self.port {
            PortType::DebugPort => JTAG_DEBUG_PORT_IR_VALUE,
            PortType::AccessPort => JTAG_ACCESS_PORT_IR_VALUE,
        }
    }

    pub fn payload(&self) -> BitVec<u8, Lsb0> {
        let mut payload = 0u64;

        // 32-bit value, bits 34:3
        payload |= u64::from(self.value) << 3;
        // A[3:2], bits 2:1
        payload |= (u64::from(self.address) & 0b1100) >> 1;
        // RnW, bit 0
        payload |= u64::from(self.direction == TransferDirection::Read);

        payload_bits(payload)
    }
}

/// The DR value written after the ABORT instruction.
pub fn abort_payload(abort: u32) -> BitVec<u8, Lsb0> {
    payload_bits(u64::from(abort) << 3)
}

fn payload_bits(payload: u64) -> BitVec<u8, Lsb0> {
    let mut bits = BitVec::<u8, Lsb0>::from_vec(payload.to_le_bytes().to_vec());
    bits.truncate(JTAG_DR_BIT_LENGTH);
    bits
}

/// The captured half of a DR scan.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Response {
    pub ack: u8,
    pub value: u32,
}

impl Response {
    pub fn parse(captured: &BitSlice<u8, Lsb0>) -> Self {
        Self {
            ack: captured[..3].load_le::<u8>(),
            value: captured[3..JTAG_DR_BIT_LENGTH].load_le::<u32>(),
        }
    }

    /// Checks the acknowledge. A passing OK/FAULT still needs the STICKYERR check.
    pub fn check(&self, version: AdiVersion) -> Result<(), DapError> {
        match (self.ack, version) {
            (JTAG_STATUS_WAIT, _) => Err(DapError::WaitResponse),
            (JTAG_STATUS_OK_FAULT, _) => Ok(()),
            (JTAG_STATUS_OK, AdiVersion::V6) => Ok(()),
            (ack, _) => {
                tracing::error!("Unexpected DAP response: {:#05b}", ack);
                Err(DapError::NoAcknowledge(ack))
            }
        }
    }
}
