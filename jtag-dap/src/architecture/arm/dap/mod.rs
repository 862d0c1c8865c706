//! Debug port connections over JTAG-DP.
//!
//! A [`Dap`] collects DP and AP register accesses in a journal and turns them
//! into DPACC/APACC scans when [`Dap::run`] is called. Read results only become
//! available once that run completed.

pub mod jtag_dp;
pub mod mock;
mod registry;

pub use registry::{AdiTarget, DapRegistry};

use std::{
    thread,
    time::{Duration, Instant},
};

use self::jtag_dp::{
    abort_payload, DapTransfer, Response, TransferDirection, JTAG_ABORT_IR_VALUE,
    JTAG_DR_BIT_LENGTH,
};
use super::{
    ap::{AccessPort, AccessPorts, ApRegister},
    dp::{
        Abort, AdiVersion, Ctrl, DebugPortId, DpRegister, DpRegisterAddress, RdBuff, Select,
        Select1, DPIDR, DPIDR1,
    },
    DapError, PortType, Register,
};
use crate::probe::{
    ChainParams, CommandQueue, CommandResult, JtagCommand, JtagEngine, ScanCommand, TapState,
};

const POWER_UP_TIMEOUT: Duration = Duration::from_secs(1);
const POWER_UP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the result of a queued read.
///
/// Valid only after the [`Dap::run`] that executed the read, and only until
/// the next run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeferredRead {
    generation: u64,
    index: usize,
}

/// One debug port on the scan chain.
#[derive(Debug)]
pub struct Dap {
    dap_name: String,
    tap: String,
    chain: ChainParams,
    declared_version: Option<AdiVersion>,
    version: Option<AdiVersion>,
    asize: u8,
    ignore_syspwrupack: bool,
    power_up_timeout: Duration,
    aps: AccessPorts,

    select: Option<u32>,
    select1: Option<u32>,
    last_instruction: Option<u32>,

    journal: Vec<DapTransfer>,
    /// Journal entries queued by the caller, SELECT writes not included.
    queued: usize,
    /// Journal positions of the reads handed out for the current journal.
    reads: Vec<usize>,
    generation: u64,
    results: Vec<u32>,
    completed: Option<u64>,
}

impl Dap {
    /// A debug port behind the TAP `tap`, addressed with the bypass padding in `chain`.
    pub fn new(dap_name: impl Into<String>, tap: impl Into<String>, chain: ChainParams) -> Self {
        Self {
            dap_name: dap_name.into(),
            tap: tap.into(),
            chain,
            declared_version: None,
            version: None,
            asize: 32,
            ignore_syspwrupack: false,
            power_up_timeout: POWER_UP_TIMEOUT,
            aps: AccessPorts::new(),
            select: None,
            select1: None,
            last_instruction: None,
            journal: Vec::new(),
            queued: 0,
            reads: Vec::new(),
            generation: 0,
            results: Vec::new(),
            completed: None,
        }
    }

    /// Skip protocol detection and always connect with `version`.
    pub fn with_adi_version(mut self, version: Option<AdiVersion>) -> Self {
        self.declared_version = version;
        self
    }

    /// Do not wait for CSYSPWRUPACK when powering up.
    pub fn with_ignore_syspwrupack(mut self, ignore: bool) -> Self {
        self.ignore_syspwrupack = ignore;
        self
    }

    pub fn set_power_up_timeout(&mut self, timeout: Duration) {
        self.power_up_timeout = timeout;
    }

    /// Name of the DAP this record belongs to.
    pub fn dap_name(&self) -> &str {
        &self.dap_name
    }

    pub fn tap(&self) -> &str {
        &self.tap
    }

    pub fn chain_params(&self) -> ChainParams {
        self.chain
    }

    pub fn declared_version(&self) -> Option<AdiVersion> {
        self.declared_version
    }

    /// The protocol version of the current connection, `None` while not connected.
    pub fn version(&self) -> Option<AdiVersion> {
        self.version
    }

    /// Address size in bits. 32 for ADIv5, from DPIDR1 for ADIv6.
    pub fn asize(&self) -> u8 {
        self.asize
    }

    pub fn ignore_syspwrupack(&self) -> bool {
        self.ignore_syspwrupack
    }

    pub fn access_ports(&self) -> &AccessPorts {
        &self.aps
    }

    pub fn access_port(&self, ap_num: u8) -> &AccessPort {
        self.aps.get(ap_num)
    }

    pub fn access_port_mut(&mut self, ap_num: u8) -> &mut AccessPort {
        self.aps.get_mut(ap_num)
    }

    /// Number of DP and AP accesses queued and not yet run.
    ///
    /// SELECT and SELECT1 writes added to reach a bank are not counted.
    pub fn pending(&self) -> usize {
        self.queued
    }

    /// Resets the AP records and connects.
    ///
    /// AP base addresses and CSW values set explicitly are kept. Debug power
    /// is requested separately with [`Dap::power_up`].
    pub fn init(&mut self, engine: &mut JtagEngine) -> Result<AdiVersion, DapError> {
        self.aps.reset();
        self.version = None;
        self.connect(engine, self.declared_version)
    }

    /// Connects to the debug port.
    ///
    /// With a declared version that version is used as is. Otherwise DPIDR is
    /// read over an ADIv6 connection and the connection is redone as ADIv5
    /// when its version field is below 3. ADIv6 connections then read the
    /// address size from DPIDR1.
    #[tracing::instrument(skip_all, fields(dap = %self.dap_name))]
    pub fn connect(
        &mut self,
        engine: &mut JtagEngine,
        declared: Option<AdiVersion>,
    ) -> Result<AdiVersion, DapError> {
        let result = self.negotiate(engine, declared);
        if result.is_err() {
            self.version = None;
        }
        result
    }

    fn negotiate(
        &mut self,
        engine: &mut JtagEngine,
        declared: Option<AdiVersion>,
    ) -> Result<AdiVersion, DapError> {
        let version = match declared {
            Some(version) => {
                tracing::info!("DAP {} configured to use {} protocol", self.tap, version);
                self.reconnect(version);
                version
            }
            None => {
                // An ADIv6 connection accepts both OK encodings. ADIv5 would
                // reject the ADIv6 one.
                self.reconnect(AdiVersion::V6);

                let dpidr: DPIDR = self
                    .read_dp_register(engine)
                    .map_err(negotiation_failed(DPIDR::NAME))?;
                tracing::debug!("DebugPort ID: {}", DebugPortId::from(dpidr.clone()));

                if dpidr.version() < 3 {
                    tracing::info!("DAP {} DPIDR indicates ADIv5 protocol is being used", self.tap);
                    self.reconnect(AdiVersion::V5);
                    AdiVersion::V5
                } else {
                    tracing::info!("DAP {} DPIDR indicates ADIv6 protocol is being used", self.tap);
                    AdiVersion::V6
                }
            }
        };

        self.asize = match version {
            AdiVersion::V5 => 32,
            AdiVersion::V6 => {
                let dpidr1: DPIDR1 = self
                    .read_dp_register(engine)
                    .map_err(negotiation_failed(DPIDR1::NAME))?;
                dpidr1.asize()
            }
        };
        tracing::debug!("DAP {} address size {} bits", self.tap, self.asize);

        Ok(version)
    }

    fn reconnect(&mut self, version: AdiVersion) {
        self.discard_journal();
        self.invalidate_cache();
        self.version = Some(version);
    }

    /// Forgets the cached SELECT values and the current instruction.
    pub fn invalidate_cache(&mut self) {
        self.select = None;
        self.select1 = None;
        self.last_instruction = None;
    }

    fn discard_journal(&mut self) {
        if self.queued > 0 {
            tracing::warn!(
                "DAP {}: discarding {} queued transactions",
                self.dap_name,
                self.queued
            );
        }
        self.journal.clear();
        self.queued = 0;
        self.reads.clear();
        self.generation += 1;
    }

    /// Queues a read of the DP register at `address`.
    pub fn queue_dp_read(&mut self, address: DpRegisterAddress) -> Result<DeferredRead, DapError> {
        let index = self.push_dp(address, TransferDirection::Read, 0)?;
        self.queued += 1;
        Ok(self.defer(index))
    }

    /// Queues a write of `value` to the DP register at `address`.
    pub fn queue_dp_write(&mut self, address: DpRegisterAddress, value: u32) -> Result<(), DapError> {
        self.push_dp(address, TransferDirection::Write, value)?;
        self.queued += 1;
        Ok(())
    }

    /// Queues a read of `register` of AP `ap_num`.
    pub fn queue_ap_read(
        &mut self,
        ap_num: u8,
        register: ApRegister,
    ) -> Result<DeferredRead, DapError> {
        let index = self.push_ap(ap_num, register, TransferDirection::Read, 0)?;
        self.queued += 1;
        Ok(self.defer(index))
    }

    /// Queues a write of `value` to `register` of AP `ap_num`.
    pub fn queue_ap_write(
        &mut self,
        ap_num: u8,
        register: ApRegister,
        value: u32,
    ) -> Result<(), DapError> {
        self.push_ap(ap_num, register, TransferDirection::Write, value)?;
        self.queued += 1;
        Ok(())
    }

    /// The value of a read executed by the most recent run.
    pub fn read_result(&self, read: DeferredRead) -> Result<u32, DapError> {
        if self.completed != Some(read.generation) {
            return Err(DapError::StaleResult);
        }
        self.results
            .get(read.index)
            .copied()
            .ok_or(DapError::StaleResult)
    }

    pub fn read_dp_register<R: DpRegister>(
        &mut self,
        engine: &mut JtagEngine,
    ) -> Result<R, DapError> {
        let read = self.queue_dp_read(R::register_address())?;
        self.run(engine)?;
        let value = self.read_result(read)?;
        tracing::debug!("Read DP register {}, value=0x{:08x}", R::NAME, value);
        Ok(R::from(value))
    }

    pub fn write_dp_register<R: DpRegister>(
        &mut self,
        engine: &mut JtagEngine,
        register: R,
    ) -> Result<(), DapError> {
        let value: u32 = register.into();
        tracing::debug!("Writing DP register {}, value=0x{:08x}", R::NAME, value);
        self.queue_dp_write(R::register_address(), value)?;
        self.run(engine)
    }

    pub fn read_ap_register(
        &mut self,
        engine: &mut JtagEngine,
        ap_num: u8,
        register: ApRegister,
    ) -> Result<u32, DapError> {
        let read = self.queue_ap_read(ap_num, register)?;
        self.run(engine)?;
        self.read_result(read)
    }

    pub fn write_ap_register(
        &mut self,
        engine: &mut JtagEngine,
        ap_num: u8,
        register: ApRegister,
        value: u32,
    ) -> Result<(), DapError> {
        self.queue_ap_write(ap_num, register, value)?;
        self.run(engine)
    }

    /// Executes the journal.
    ///
    /// The journal is always emptied. On success the results of all queued
    /// reads become available through [`Dap::read_result`]. Any failure drops
    /// the SELECT cache.
    #[tracing::instrument(skip_all, fields(dap = %self.dap_name, transfers = self.journal.len()))]
    pub fn run(&mut self, engine: &mut JtagEngine) -> Result<(), DapError> {
        let generation = self.generation;
        self.generation += 1;
        self.completed = None;
        self.results.clear();
        self.queued = 0;

        if self.journal.is_empty() {
            self.completed = Some(generation);
            return Ok(());
        }

        match self.run_journal(engine) {
            Ok(results) => {
                self.results = results;
                self.completed = Some(generation);
                Ok(())
            }
            Err(error) => {
                self.journal.clear();
                self.reads.clear();
                self.invalidate_cache();
                Err(error)
            }
        }
    }

    fn run_journal(&mut self, engine: &mut JtagEngine) -> Result<Vec<u32>, DapError> {
        // Check CTRL/STATUS to make sure OK/FAULT meant OK. The RDBUFF read
        // pushes that last result out of the pipeline.
        let ctrl_index = self.push_dp(Ctrl::register_address(), TransferDirection::Read, 0)?;
        self.push_dp(RdBuff::register_address(), TransferDirection::Read, 0)?;

        let transfers = std::mem::take(&mut self.journal);
        let reads = std::mem::take(&mut self.reads);

        let values = self.flush(engine, &transfers)?;

        let ctrl = Ctrl::from(values[ctrl_index]);
        if ctrl.sticky_err() {
            tracing::debug!("JTAG transaction set failed: {:#x?}", transfers);

            // Clear the sticky bit so future transactions succeed
            self.flush(
                engine,
                &[
                    DapTransfer::write(PortType::DebugPort, Ctrl::ADDRESS, ctrl.into()),
                    DapTransfer::read(PortType::DebugPort, RdBuff::ADDRESS),
                ],
            )?;

            return Err(DapError::FaultResponse);
        }

        Ok(reads.into_iter().map(|index| values[index]).collect())
    }

    /// Scans `transfers` and returns the response to every transfer but the last.
    fn flush(
        &mut self,
        engine: &mut JtagEngine,
        transfers: &[DapTransfer],
    ) -> Result<Vec<u32>, DapError> {
        let version = self.version.ok_or(DapError::NotConnected)?;

        let mut queue = CommandQueue::new();
        let mut captures = Vec::with_capacity(transfers.len());

        for transfer in transfers {
            let instruction = transfer.instruction();
            if self.last_instruction != Some(instruction) {
                queue.schedule(ScanCommand::ir(self.chain.pad_ir(instruction)));
                self.last_instruction = Some(instruction);
            }

            let payload = self.chain.pad_dr(&transfer.payload());
            captures.push(queue.schedule(ScanCommand::dr(payload).with_capture()));

            if transfer.idle_cycles_after > 0 {
                queue.schedule(JtagCommand::RunTest {
                    cycles: transfer.idle_cycles_after,
                    end_state: TapState::Idle,
                });
            }
        }

        let mut results = engine.execute(&queue)?;

        let mut responses = Vec::with_capacity(captures.len());
        for index in captures {
            let captured = results
                .take(index)
                .ok()
                .and_then(CommandResult::into_bits)
                .ok_or(DapError::StaleResult)?;
            responses.push(Response::parse(
                self.chain.unpad_dr(&captured, JTAG_DR_BIT_LENGTH),
            ));
        }

        // Each response is read in the next transaction
        let mut values = Vec::with_capacity(transfers.len());
        for (transfer, response) in transfers.iter().zip(responses.iter().skip(1)) {
            if let Err(error) = response.check(version) {
                tracing::debug!("{:x?} failed: {}", transfer, error);
                return Err(error);
            }
            values.push(response.value);
        }

        Ok(values)
    }

    fn defer(&mut self, journal_index: usize) -> DeferredRead {
        self.reads.push(journal_index);
        DeferredRead {
            generation: self.generation,
            index: self.reads.len() - 1,
        }
    }

    fn push_dp(
        &mut self,
        address: DpRegisterAddress,
        direction: TransferDirection,
        value: u32,
    ) -> Result<usize, DapError> {
        let version = self.version.ok_or(DapError::NotConnected)?;

        if let Some(bank) = address.bank {
            if is_banked(version, address.address) {
                self.select_dp_bank(bank);
            }
        }

        if direction == TransferDirection::Write {
            if address.address == Select::ADDRESS {
                self.select = Some(value);
            } else if version == AdiVersion::V6 && address == Select1::register_address() {
                self.select1 = Some(value);
            }
        }

        self.journal.push(match direction {
            TransferDirection::Read => DapTransfer::read(PortType::DebugPort, address.address),
            TransferDirection::Write => {
                DapTransfer::write(PortType::DebugPort, address.address, value)
            }
        });
        Ok(self.journal.len() - 1)
    }

    fn push_ap(
        &mut self,
        ap_num: u8,
        register: ApRegister,
        direction: TransferDirection,
        value: u32,
    ) -> Result<usize, DapError> {
        let version = self.version.ok_or(DapError::NotConnected)?;
        let ap = self.aps.get(ap_num);
        let address = ap.register_address(version, register);
        let idle_cycles = if register.is_memory_access() {
            ap.memaccess_tck()
        } else {
            0
        };

        let ap_select = match version {
            AdiVersion::V5 => {
                let mut select = Select::default();
                select.set_ap_sel(ap_num);
                select.set_ap_bank_sel(((address >> 4) & 0xF) as u8);
                u32::from(select)
            }
            AdiVersion::V6 => {
                let high = (address >> 32) as u32;
                if self.asize > 32 {
                    if self.select1 != Some(high) {
                        self.push_dp(Select1::register_address(), TransferDirection::Write, high)?;
                    }
                } else if high != 0 {
                    tracing::warn!(
                        "AP register address {:#x} exceeds the {} bit address size",
                        address,
                        self.asize
                    );
                }
                (address as u32) & !0xF
            }
        };

        let desired = ap_select | (self.select.unwrap_or(0) & 0xF);
        if self.select != Some(desired) {
            tracing::debug!("Changing AP to {}, SELECT to {:#010x}", ap_num, desired);
            self.write_select(desired);
        }

        let transfer = match direction {
            TransferDirection::Read => DapTransfer::read(PortType::AccessPort, address as u8),
            TransferDirection::Write => {
                DapTransfer::write(PortType::AccessPort, address as u8, value)
            }
        };
        tracing::trace!("Queued {:?} of AP {} {}", direction, ap_num, register);
        self.journal.push(transfer.with_idle_cycles(idle_cycles));
        Ok(self.journal.len() - 1)
    }

    fn select_dp_bank(&mut self, bank: u8) {
        let desired = (self.select.unwrap_or(0) & !0xF) | u32::from(bank & 0xF);
        if self.select != Some(desired) {
            tracing::debug!("Changing DP_BANK_SEL to {}", bank);
            self.write_select(desired);
        }
    }

    fn write_select(&mut self, value: u32) {
        self.journal.push(DapTransfer::write(
            PortType::DebugPort,
            Select::ADDRESS,
            value,
        ));
        self.select = Some(value);
    }

    /// Requests debug and system power and waits for the acknowledges.
    ///
    /// CSYSPWRUPACK is not waited for when the DAP ignores it.
    pub fn power_up(&mut self, engine: &mut JtagEngine) -> Result<(), DapError> {
        tracing::debug!("Requesting debug power");
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.write_dp_register(engine, ctrl)?;

        let start = Instant::now();
        loop {
            let ctrl: Ctrl = self.read_dp_register(engine)?;
            if ctrl.cdbgpwrupack() && (self.ignore_syspwrupack || ctrl.csyspwrupack()) {
                return Ok(());
            }

            if start.elapsed() >= self.power_up_timeout {
                tracing::error!("Debug power request failed");
                return Err(DapError::TargetPowerUpFailed);
            }
            thread::sleep(POWER_UP_POLL_INTERVAL);
        }
    }

    /// Aborts the current AP transaction with DAPABORT.
    ///
    /// Transactions still queued are discarded.
    pub fn abort(&mut self, engine: &mut JtagEngine) -> Result<(), DapError> {
        let mut abort = Abort::default();
        abort.set_dapabort(true);

        let mut queue = CommandQueue::new();
        queue.schedule(ScanCommand::ir(self.chain.pad_ir(JTAG_ABORT_IR_VALUE)));
        queue.schedule(ScanCommand::dr(
            self.chain.pad_dr(&abort_payload(abort.into())),
        ));

        self.discard_journal();
        self.invalidate_cache();
        engine.execute(&queue)?;
        self.last_instruction = Some(JTAG_ABORT_IR_VALUE);

        Ok(())
    }
}

/// Whether DPBANKSEL applies to DP address `address`.
fn is_banked(version: AdiVersion, address: u8) -> bool {
    match version {
        AdiVersion::V5 => address == 0x4,
        AdiVersion::V6 => address == 0x0 || address == 0x4,
    }
}

fn negotiation_failed(register: &'static str) -> impl Fn(DapError) -> DapError {
    move |source| {
        tracing::error!("DAP read of {} failed: {}", register, source);
        DapError::NegotiationFailed {
            register,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockJtagDp, MockTransaction, ADIV5_DPIDR};
    use super::*;
    use crate::probe::{ScanChain, TapConfig};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn single_tap() -> ChainParams {
        ScanChain::new(vec![TapConfig::new("cpu.tap", 4)])
            .chain_params(0)
            .unwrap()
    }

    fn setup(mock: &MockJtagDp) -> (Dap, JtagEngine) {
        let engine = JtagEngine::new(Box::new(mock.probe()));
        (Dap::new("cpu.dap", "cpu.tap", single_tap()), engine)
    }

    fn dpidr_reads(mock: &MockJtagDp) -> usize {
        mock.transactions()
            .iter()
            .filter(|t| **t == MockTransaction::dp_read(0x00))
            .count()
    }

    #[test_case(0x2BA0_1477, AdiVersion::V5; "version field 1")]
    #[test_case(0x0BA0_2477, AdiVersion::V5; "version field 2")]
    #[test_case(0x0BA0_3477, AdiVersion::V6; "version field 3")]
    #[test_case(0x0BA0_7477, AdiVersion::V6; "version field 7")]
    fn negotiation_follows_dpidr_version(dpidr: u32, expected: AdiVersion) {
        let mock = MockJtagDp::new(expected, dpidr);
        let (mut dap, mut engine) = setup(&mock);

        let version = dap.connect(&mut engine, None).unwrap();

        assert_eq!(version, expected);
        assert_eq!(dap.version(), Some(expected));
        assert_eq!(dpidr_reads(&mock), 1);
    }

    #[test]
    fn adiv6_reads_address_size_from_dpidr1() {
        let mock = MockJtagDp::adiv6().with_dpidr1(0x40);
        let (mut dap, mut engine) = setup(&mock);

        dap.connect(&mut engine, None).unwrap();

        assert_eq!(dap.asize(), 64);
        assert!(mock
            .transactions()
            .contains(&MockTransaction::dp_read(0x10)));
    }

    #[test]
    fn adiv5_address_size_is_32() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);

        dap.connect(&mut engine, None).unwrap();

        assert_eq!(dap.asize(), 32);
    }

    #[test]
    fn declared_version_skips_dpidr() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);

        let version = dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        assert_eq!(version, AdiVersion::V5);
        assert!(mock.transactions().is_empty());
    }

    #[test]
    fn declared_adiv6_reads_only_dpidr1() {
        let mock = MockJtagDp::adiv6().with_dpidr1(0x20);
        let (mut dap, mut engine) = setup(&mock);

        dap.connect(&mut engine, Some(AdiVersion::V6)).unwrap();

        assert_eq!(dpidr_reads(&mock), 0);
        assert_eq!(dap.asize(), 32);
    }

    #[test]
    fn failed_dpidr_read_fails_negotiation() {
        let mock = MockJtagDp::adiv6();
        let probe = mock.probe().fail_at_call(1);
        let mut engine = JtagEngine::new(Box::new(probe));
        let mut dap = Dap::new("cpu.dap", "cpu.tap", single_tap());

        let err = dap.connect(&mut engine, None).unwrap_err();

        assert!(matches!(
            err,
            DapError::NegotiationFailed {
                register: "DPIDR",
                ..
            }
        ));
        assert_eq!(dap.version(), None);
    }

    #[test]
    fn adiv5_connection_rejects_adiv6_ok() {
        let mock = MockJtagDp::adiv6();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        let err = dap.read_dp_register::<Ctrl>(&mut engine).unwrap_err();

        assert!(matches!(err, DapError::NoAcknowledge(0b100)));
    }

    #[test]
    fn queueing_before_connect_fails() {
        let mut dap = Dap::new("cpu.dap", "cpu.tap", single_tap());

        assert!(matches!(
            dap.queue_ap_read(0, ApRegister::Idr),
            Err(DapError::NotConnected)
        ));
    }

    #[test]
    fn reads_complete_in_queue_order() {
        let mock = MockJtagDp::adiv5()
            .with_ap_register(0x0_00FC, 0x2477_0011)
            .with_ap_register(0x1_0000, 0xA200_0002);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        let idr = dap.queue_ap_read(0, ApRegister::Idr).unwrap();
        let csw = dap.queue_ap_read(1, ApRegister::Csw).unwrap();
        let dpidr = dap.queue_dp_read(DPIDR::register_address()).unwrap();

        assert!(matches!(dap.read_result(idr), Err(DapError::StaleResult)));

        dap.run(&mut engine).unwrap();

        assert_eq!(dap.read_result(idr).unwrap(), 0x2477_0011);
        assert_eq!(dap.read_result(csw).unwrap(), 0xA200_0002);
        assert_eq!(dap.read_result(dpidr).unwrap(), ADIV5_DPIDR);
        assert_eq!(dap.pending(), 0);
    }

    #[test]
    fn results_expire_with_the_next_run() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        let read = dap.queue_dp_read(DPIDR::register_address()).unwrap();
        dap.run(&mut engine).unwrap();
        dap.run(&mut engine).unwrap();

        assert!(matches!(dap.read_result(read), Err(DapError::StaleResult)));
    }

    #[test]
    fn every_run_checks_ctrl_stat() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        dap.queue_ap_write(0, ApRegister::Tar, 0x2000_0000).unwrap();
        dap.run(&mut engine).unwrap();

        assert_eq!(
            mock.transactions(),
            vec![
                MockTransaction::dp_write(0x08, 0x0000_0000),
                MockTransaction::ap_write(0x0_0004, 0x2000_0000),
                MockTransaction::dp_read(0x04),
                MockTransaction::dp_read(0x0C),
            ]
        );
    }

    #[test]
    fn select_is_only_written_when_it_changes() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        dap.queue_ap_read(3, ApRegister::Csw).unwrap();
        dap.queue_ap_read(3, ApRegister::Tar).unwrap();
        dap.queue_ap_read(3, ApRegister::Idr).unwrap();
        dap.run(&mut engine).unwrap();

        let selects: Vec<_> = mock
            .transactions()
            .into_iter()
            .filter(|t| matches!(t, MockTransaction::Dp { address: 0x08, .. }))
            .collect();
        assert_eq!(
            selects,
            vec![
                MockTransaction::dp_write(0x08, 0x0300_0000),
                MockTransaction::dp_write(0x08, 0x0300_00F0),
            ]
        );
    }

    #[test]
    fn adiv6_ap_registers_are_memory_mapped() {
        let mock = MockJtagDp::adiv6()
            .with_dpidr1(0x20)
            .with_ap_register(0x2_0DFC, 0x1234_5678);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, None).unwrap();

        let idr = dap.read_ap_register(&mut engine, 2, ApRegister::Idr).unwrap();

        assert_eq!(idr, 0x1234_5678);
        assert!(mock
            .transactions()
            .contains(&MockTransaction::dp_write(0x08, 0x0002_0DF0)));
    }

    #[test]
    fn adiv6_large_addresses_use_select1() {
        let mock = MockJtagDp::adiv6()
            .with_dpidr1(0x40)
            .with_ap_register(0x1_0000_0D00, 0xCAFE);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, None).unwrap();
        dap.access_port_mut(0).set_base(0x1_0000_0000).unwrap();

        let csw = dap.read_ap_register(&mut engine, 0, ApRegister::Csw).unwrap();

        assert_eq!(csw, 0xCAFE);
        assert!(mock
            .transactions()
            .contains(&MockTransaction::dp_write(0x54, 0x1)));
    }

    #[test]
    fn sticky_error_fails_the_run_and_is_cleared() {
        let mock = MockJtagDp::adiv5().with_fault_at(0x0_000C);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        let read = dap.queue_ap_read(0, ApRegister::Drw).unwrap();
        let err = dap.run(&mut engine).unwrap_err();

        assert!(matches!(err, DapError::FaultResponse));
        assert!(matches!(dap.read_result(read), Err(DapError::StaleResult)));
        assert!(!Ctrl::from(mock.ctrl()).sticky_err());

        // The cache was dropped, so the next access selects the AP again.
        mock.clear_transactions();
        dap.read_ap_register(&mut engine, 0, ApRegister::Csw).unwrap();
        assert_eq!(
            mock.transactions()[0],
            MockTransaction::dp_write(0x08, 0x0000_0000)
        );
    }

    #[test]
    fn wait_is_reported_not_retried() {
        let mock = MockJtagDp::adiv5().with_wait_responses(1);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        let err = dap.read_dp_register::<Ctrl>(&mut engine).unwrap_err();

        assert!(matches!(err, DapError::WaitResponse));
    }

    #[test]
    fn memory_accesses_add_idle_clocks() {
        let mock = MockJtagDp::adiv5();
        let probe = mock.probe();
        let log = probe.operations();
        let mut engine = JtagEngine::new(Box::new(probe));
        let mut dap = Dap::new("cpu.dap", "cpu.tap", single_tap());
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();
        dap.access_port_mut(0).set_memaccess_tck(8).unwrap();

        dap.queue_ap_read(0, ApRegister::Drw).unwrap();
        dap.run(&mut engine).unwrap();

        assert!(log.snapshot().iter().any(|op| matches!(
            op,
            crate::probe::fake_probe::Operation::IdleClocks { cycles: 8, .. }
        )));
    }

    #[test]
    fn power_up_waits_for_acknowledges() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        dap.power_up(&mut engine).unwrap();

        let ctrl = Ctrl::from(mock.ctrl());
        assert!(ctrl.cdbgpwrupreq() && ctrl.csyspwrupreq());
    }

    #[test]
    fn missing_syspwrupack_fails_unless_ignored() {
        let mock = MockJtagDp::adiv5().without_syspwrupack();
        let (mut dap, mut engine) = setup(&mock);
        dap.set_power_up_timeout(Duration::from_millis(5));
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();

        assert!(matches!(
            dap.power_up(&mut engine),
            Err(DapError::TargetPowerUpFailed)
        ));

        let mut dap = Dap::new("cpu.dap", "cpu.tap", single_tap()).with_ignore_syspwrupack(true);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();
        dap.power_up(&mut engine).unwrap();
    }

    #[test]
    fn abort_shifts_dapabort_and_discards_queue() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, Some(AdiVersion::V5)).unwrap();
        let read = dap.queue_ap_read(0, ApRegister::Idr).unwrap();

        dap.abort(&mut engine).unwrap();

        assert_eq!(mock.aborts(), 1);
        assert_eq!(dap.pending(), 0);
        dap.run(&mut engine).unwrap();
        assert!(matches!(dap.read_result(read), Err(DapError::StaleResult)));
    }

    #[test]
    fn scans_are_padded_for_other_taps() {
        let chain = ScanChain::new(vec![
            TapConfig::new("fpga.tap", 6),
            TapConfig::new("cpu.tap", 4),
        ]);
        let params = chain.chain_params(1).unwrap();
        let mock = MockJtagDp::adiv5().with_chain(params);
        let mut engine = JtagEngine::new(Box::new(mock.probe()));
        let mut dap = Dap::new("cpu.dap", "cpu.tap", params);

        dap.connect(&mut engine, None).unwrap();

        assert_eq!(dap.version(), Some(AdiVersion::V5));
        assert_eq!(dpidr_reads(&mock), 1);
    }

    #[test]
    fn init_keeps_configured_ap_base() {
        let mock = MockJtagDp::adiv5();
        let (mut dap, mut engine) = setup(&mock);
        dap.access_port_mut(4).set_base(0x8000).unwrap();
        dap.access_port_mut(5).cfg_reg = Some(2);

        dap.init(&mut engine).unwrap();

        assert_eq!(dap.access_port(4).base(), 0x8000);
        assert_eq!(dap.access_port(5).cfg_reg, None);
        assert_eq!(dap.version(), Some(AdiVersion::V5));
    }

    #[test]
    fn init_leaves_debug_power_alone() {
        let mock = MockJtagDp::adiv6().without_power_up_acks();
        let (mut dap, mut engine) = setup(&mock);
        dap.set_power_up_timeout(Duration::from_millis(5));

        assert_eq!(dap.init(&mut engine).unwrap(), AdiVersion::V6);
        assert!(!Ctrl::from(mock.ctrl()).cdbgpwrupreq());

        assert!(matches!(
            dap.power_up(&mut engine),
            Err(DapError::TargetPowerUpFailed)
        ));
    }

    #[test]
    fn pending_counts_only_queued_accesses() {
        let mock = MockJtagDp::adiv6().with_dpidr1(0x40);
        let (mut dap, mut engine) = setup(&mock);
        dap.connect(&mut engine, None).unwrap();
        dap.access_port_mut(1).set_base(0x1_0000_0000).unwrap();

        // Needs both SELECT and SELECT1.
        dap.queue_ap_write(1, ApRegister::Tar, 0x2000_0000).unwrap();
        assert_eq!(dap.pending(), 1);

        dap.queue_dp_read(Ctrl::register_address()).unwrap();
        assert_eq!(dap.pending(), 2);

        dap.run(&mut engine).unwrap();
        assert_eq!(dap.pending(), 0);
    }
}
