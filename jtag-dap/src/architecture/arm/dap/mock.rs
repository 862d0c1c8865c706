//! A simulated JTAG-DP for tests and dry runs.
//!
//! [`MockJtagDp::probe`] returns a [`FakeProbe`] whose scans are answered by
//! the simulated debug port, including the one transaction capture delay.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use bitvec::prelude::*;

use super::jtag_dp::{
    TransferDirection, JTAG_ABORT_IR_VALUE, JTAG_ACCESS_PORT_IR_VALUE, JTAG_DEBUG_PORT_IR_VALUE,
    JTAG_DR_BIT_LENGTH, JTAG_STATUS_OK, JTAG_STATUS_OK_FAULT, JTAG_STATUS_WAIT,
};
use crate::architecture::arm::dp::AdiVersion;
use crate::probe::{fake_probe::FakeProbe, ChainParams, ScanRegister};

/// DPv1, designed by ARM.
pub const ADIV5_DPIDR: u32 = 0x2BA0_1477;
/// DPv3, designed by ARM.
pub const ADIV6_DPIDR: u32 = 0x0BA0_3477;

const CTRL_STICKY_MASK: u32 = (1 << 1) | (1 << 4) | (1 << 5) | (1 << 7);
const CTRL_STICKYERR: u32 = 1 << 5;
const CTRL_CDBGPWRUPREQ: u32 = 1 << 28;
const CTRL_CDBGPWRUPACK: u32 = 1 << 29;
const CTRL_CSYSPWRUPREQ: u32 = 1 << 30;
const CTRL_CSYSPWRUPACK: u32 = 1 << 31;

/// A transaction the simulated debug port executed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MockTransaction {
    /// `address` is `bank << 4 | A[3:0]` for banked registers, A[3:0] otherwise.
    Dp {
        address: u64,
        direction: TransferDirection,
        value: u32,
    },
    /// `address` is the full AP register address. ADIv5 accesses use
    /// `APSEL << 16 | offset`.
    Ap {
        address: u64,
        direction: TransferDirection,
        value: u32,
    },
}

impl MockTransaction {
    pub fn dp_read(address: u64) -> Self {
        MockTransaction::Dp {
            address,
            direction: TransferDirection::Read,
            value: 0,
        }
    }

    pub fn dp_write(address: u64, value: u32) -> Self {
        MockTransaction::Dp {
            address,
            direction: TransferDirection::Write,
            value,
        }
    }

    pub fn ap_read(address: u64) -> Self {
        MockTransaction::Ap {
            address,
            direction: TransferDirection::Read,
            value: 0,
        }
    }

    pub fn ap_write(address: u64, value: u32) -> Self {
        MockTransaction::Ap {
            address,
            direction: TransferDirection::Write,
            value,
        }
    }
}

#[derive(Debug)]
struct MockDpState {
    version: AdiVersion,
    chain: ChainParams,
    dpidr: u32,
    dpidr1: u32,
    ctrl: u32,
    select: u32,
    select1: u32,
    cdbgpwrupack: bool,
    syspwrupack: bool,
    ap_registers: HashMap<u64, u32>,
    fault_addresses: HashSet<u64>,
    wait_responses: usize,
    instruction: u32,
    /// ACK and read data returned by the next capture.
    pending: (u8, u32),
    transactions: Vec<MockTransaction>,
    aborts: usize,
}

impl MockDpState {
    fn scan(&mut self, register: ScanRegister, data: &mut [u8], bits: usize) {
        let bits = &mut data.view_bits_mut::<Lsb0>()[..bits];
        match register {
            ScanRegister::Ir => {
                let start = self.chain.irpre;
                self.instruction = bits[start..start + self.chain.irlen].load_le::<u32>();
            }
            ScanRegister::Dr => {
                let start = self.chain.drpre;
                let dr = &mut bits[start..start + JTAG_DR_BIT_LENGTH];
                let request = dr.load_le::<u64>();

                match self.instruction {
                    JTAG_ABORT_IR_VALUE => {
                        if request >> 3 & 1 != 0 {
                            self.aborts += 1;
                        }
                    }
                    JTAG_DEBUG_PORT_IR_VALUE | JTAG_ACCESS_PORT_IR_VALUE => {
                        let (ack, value) = self.pending;
                        dr[..3].store_le(ack);
                        dr[3..].store_le(value);
                        self.pending = self.transact(request);
                    }
                    _ => {}
                }
            }
        }
    }

    fn transact(&mut self, request: u64) -> (u8, u32) {
        if self.wait_responses > 0 {
            self.wait_responses -= 1;
            return (JTAG_STATUS_WAIT, 0);
        }

        let direction = if request & 1 != 0 {
            TransferDirection::Read
        } else {
            TransferDirection::Write
        };
        let a = ((request >> 1) & 0b11) as u8 * 4;
        let value = (request >> 3) as u32;
        let ok = match self.version {
            AdiVersion::V5 => JTAG_STATUS_OK_FAULT,
            AdiVersion::V6 => JTAG_STATUS_OK,
        };

        if self.instruction == JTAG_DEBUG_PORT_IR_VALUE {
            let read = self.dp_access(a, direction, value);
            (ok, read)
        } else {
            let address = self.ap_address(a);
            self.transactions.push(MockTransaction::Ap {
                address,
                direction,
                value: if direction == TransferDirection::Write { value } else { 0 },
            });

            if self.fault_addresses.contains(&address) {
                self.ctrl |= CTRL_STICKYERR;
                return (JTAG_STATUS_OK_FAULT, 0);
            }

            match direction {
                TransferDirection::Read => (ok, self.ap_registers.get(&address).copied().unwrap_or(0)),
                TransferDirection::Write => {
                    self.ap_registers.insert(address, value);
                    (ok, 0)
                }
            }
        }
    }

    fn dp_access(&mut self, a: u8, direction: TransferDirection, value: u32) -> u32 {
        let bank = (self.select & 0xF) as u8;
        let banked = a == 0x4 || (a == 0x0 && self.version == AdiVersion::V6);
        let address = if banked {
            u64::from(bank << 4 | a)
        } else {
            u64::from(a)
        };
        self.transactions.push(MockTransaction::Dp {
            address,
            direction,
            value: if direction == TransferDirection::Write { value } else { 0 },
        });

        match (address, direction) {
            (0x00, TransferDirection::Read) => self.dpidr,
            (0x10, TransferDirection::Read) => self.dpidr1,
            (0x04, TransferDirection::Read) => self.ctrl_stat(),
            (0x04, TransferDirection::Write) => {
                let sticky = self.ctrl & CTRL_STICKY_MASK & !value;
                self.ctrl = (value & !CTRL_STICKY_MASK) | sticky;
                0
            }
            (0x54, TransferDirection::Read) => self.select1,
            (0x54, TransferDirection::Write) => {
                self.select1 = value;
                0
            }
            (0x08, TransferDirection::Write) => {
                self.select = value;
                0
            }
            _ => 0,
        }
    }

    fn ctrl_stat(&self) -> u32 {
        let mut ctrl = self.ctrl;
        if ctrl & CTRL_CDBGPWRUPREQ != 0 && self.cdbgpwrupack {
            ctrl |= CTRL_CDBGPWRUPACK;
        }
        if ctrl & CTRL_CSYSPWRUPREQ != 0 && self.syspwrupack {
            ctrl |= CTRL_CSYSPWRUPACK;
        }
        ctrl
    }

    fn ap_address(&self, a: u8) -> u64 {
        match self.version {
            AdiVersion::V5 => {
                u64::from(self.select >> 24) << 16 | u64::from(self.select & 0xF0) | u64::from(a)
            }
            AdiVersion::V6 => {
                u64::from(self.select1) << 32 | u64::from(self.select & !0xF) | u64::from(a)
            }
        }
    }
}

/// Simulated JTAG-DP. Clones share the same state.
#[derive(Clone, Debug)]
pub struct MockJtagDp {
    state: Arc<Mutex<MockDpState>>,
}

impl MockJtagDp {
    /// A debug port answering with the ACK encoding of `version` and the given DPIDR.
    pub fn new(version: AdiVersion, dpidr: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockDpState {
                version,
                chain: ChainParams {
                    irlen: 4,
                    ..ChainParams::default()
                },
                dpidr,
                dpidr1: 0x20,
                ctrl: 0,
                select: 0,
                select1: 0,
                cdbgpwrupack: true,
                syspwrupack: true,
                ap_registers: HashMap::new(),
                fault_addresses: HashSet::new(),
                wait_responses: 0,
                instruction: 0b1110,
                pending: (0, 0),
                transactions: Vec::new(),
                aborts: 0,
            })),
        }
    }

    pub fn adiv5() -> Self {
        Self::new(AdiVersion::V5, ADIV5_DPIDR)
    }

    pub fn adiv6() -> Self {
        Self::new(AdiVersion::V6, ADIV6_DPIDR)
    }

    fn lock(&self) -> MutexGuard<'_, MockDpState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_dpidr1(self, dpidr1: u32) -> Self {
        self.lock().dpidr1 = dpidr1;
        self
    }

    /// Places the debug port's TAP at the position described by `chain`.
    pub fn with_chain(self, chain: ChainParams) -> Self {
        self.lock().chain = chain;
        self
    }

    pub fn with_ap_register(self, address: u64, value: u32) -> Self {
        self.lock().ap_registers.insert(address, value);
        self
    }

    /// Accesses to `address` set STICKYERR.
    pub fn with_fault_at(self, address: u64) -> Self {
        self.lock().fault_addresses.insert(address);
        self
    }

    /// Answers the next `count` transactions with WAIT.
    pub fn with_wait_responses(self, count: usize) -> Self {
        self.lock().wait_responses = count;
        self
    }

    /// Never acknowledges the system power-up request.
    pub fn without_syspwrupack(self) -> Self {
        self.lock().syspwrupack = false;
        self
    }

    /// Never acknowledges either power-up request.
    pub fn without_power_up_acks(self) -> Self {
        let mut state = self.lock();
        state.cdbgpwrupack = false;
        state.syspwrupack = false;
        drop(state);
        self
    }

    /// A fake backend whose scans reach this debug port.
    pub fn probe(&self) -> FakeProbe {
        let state = self.state.clone();
        FakeProbe::new().with_scan_handler(Box::new(move |register, data, bits| {
            state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .scan(register, data, bits);
            Ok(())
        }))
    }

    pub fn transactions(&self) -> Vec<MockTransaction> {
        self.lock().transactions.clone()
    }

    pub fn clear_transactions(&self) {
        self.lock().transactions.clear();
    }

    /// CTRL/STAT as a read would return it.
    pub fn ctrl(&self) -> u32 {
        self.lock().ctrl_stat()
    }

    pub fn ap_register(&self, address: u64) -> Option<u32> {
        self.lock().ap_registers.get(&address).copied()
    }

    /// Number of DAPABORTs received.
    pub fn aborts(&self) -> usize {
        self.lock().aborts
    }
}
