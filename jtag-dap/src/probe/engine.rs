//! Executes [`CommandQueue`]s against one backend.

use std::{thread, time::Duration};

use bitvec::prelude::*;

use super::{
    BatchExecutionError, CommandQueue, CommandResult, DebugProbeError, DeferredResultSet,
    JtagBackend, JtagCommand, JtagError, LastInstruction, RawScan, ScanCommand, ScanRegister,
    ScanType, TapState, TapStateMachine,
};

/// Owns one backend together with the TAP state and the last shifted
/// instruction for the chain behind it.
#[derive(Debug)]
pub struct JtagEngine {
    backend: Box<dyn JtagBackend>,
    tap: TapStateMachine,
    last_ir: Option<LastInstruction>,
}

impl JtagEngine {
    pub fn new(backend: Box<dyn JtagBackend>) -> Self {
        Self {
            backend,
            tap: TapStateMachine::new(),
            last_ir: None,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// The tracked TAP state.
    pub fn tap_state(&self) -> TapState {
        self.tap.current()
    }

    /// The end state of the most recent scan or run-test.
    pub fn end_state(&self) -> TapState {
        self.tap.end_state()
    }

    /// Whether the tracked TAP state can be relied on.
    pub fn is_state_trusted(&self) -> bool {
        self.tap.is_trusted()
    }

    /// The instruction most recently shifted into the IR.
    pub fn last_ir(&self) -> Option<&LastInstruction> {
        self.last_ir.as_ref()
    }

    /// Programs the TCK frequency and returns the frequency actually in use.
    pub fn set_speed(&mut self, hz: u32) -> Result<u32, DebugProbeError> {
        let actual = self.backend.set_speed(hz)?;
        tracing::info!("TCK set to {} Hz (requested {} Hz)", actual, hz);
        Ok(actual)
    }

    pub fn speed(&mut self) -> Result<u32, DebugProbeError> {
        self.backend.speed()
    }

    /// Executes all commands of `queue` in order.
    ///
    /// Execution stops at the first failing command. The returned error carries
    /// its index and the results of the commands executed before it.
    #[tracing::instrument(skip_all, fields(commands = queue.len()))]
    pub fn execute(
        &mut self,
        queue: &CommandQueue,
    ) -> Result<DeferredResultSet<CommandResult>, BatchExecutionError> {
        let mut results = DeferredResultSet::new();

        for (index, (result_index, command)) in queue.entries().enumerate() {
            match self.execute_command(command) {
                Ok(result) => {
                    if let CommandResult::Captured(_) = result {
                        if result_index.should_capture() {
                            results.push(result_index, result);
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!("{} command {} failed: {}", command.name(), index, error);
                    return Err(BatchExecutionError::new(error, index, results));
                }
            }
        }

        Ok(results)
    }

    fn execute_command(&mut self, command: &JtagCommand) -> Result<CommandResult, JtagError> {
        match command {
            JtagCommand::Scan(scan) => self.scan(scan),
            JtagCommand::Reset { trst, srst } => {
                self.reset(*trst, *srst)?;
                Ok(CommandResult::None)
            }
            JtagCommand::RunTest { cycles, end_state } => {
                self.run_test(*cycles, *end_state)?;
                Ok(CommandResult::None)
            }
            JtagCommand::StableClocks { cycles } => {
                self.run_test(*cycles, TapState::Idle)?;
                Ok(CommandResult::None)
            }
            JtagCommand::Sleep { micros } => {
                tracing::debug!("sleep {} us", micros);
                thread::sleep(Duration::from_micros(*micros));
                Ok(CommandResult::None)
            }
            JtagCommand::Tms { bits } => {
                self.clock_tms(bits)?;
                Ok(CommandResult::None)
            }
            JtagCommand::PathMove { .. } => Err(JtagError::Unsupported("PathMove")),
        }
    }

    /// Moves the TAP to the stable state `goal`.
    ///
    /// An unstable goal is rejected without touching the backend or the
    /// tracked state. While the state is untrusted only Test-Logic-Reset can
    /// be reached, by clocking TMS high five times, or through
    /// [`JtagBackend::reset_tap`] on backends that advertise
    /// [`set_state`](crate::probe::BackendCapabilities::set_state).
    pub fn move_to(&mut self, goal: TapState) -> Result<(), JtagError> {
        if !goal.is_stable() {
            return Err(JtagError::UnstableEndState(goal));
        }

        if !self.tap.is_trusted() {
            if goal != TapState::Reset {
                return Err(JtagError::StateUntrusted);
            }
            // Backends with direct state moves may not clock TMS at all.
            if self.backend.capabilities().set_state {
                return self.reset_tap().map_err(|e| self.backend_failed(e));
            }
            return self.clock_tms(bits![u8, Lsb0; 1; 5]);
        }

        let from = self.tap.current();
        if from == goal {
            return Ok(());
        }

        tracing::debug!("move {} -> {}", from, goal);

        if self.backend.capabilities().set_state {
            if let Err(e) = self.backend.set_state(goal) {
                return Err(self.backend_failed(e));
            }
            self.tap.set_current(goal);
            return Ok(());
        }

        let path = from.path_to(goal)?;
        self.clock_tms(&path)
    }

    fn clock_tms(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<(), JtagError> {
        for tms in bits.iter().by_vals() {
            if let Err(e) = self.backend.clock_tms(tms) {
                return Err(self.backend_failed(e));
            }
            self.tap.apply_tms(tms);
        }
        Ok(())
    }

    fn scan(&mut self, scan: &ScanCommand) -> Result<CommandResult, JtagError> {
        if scan.is_empty() {
            return Ok(CommandResult::None);
        }

        let end_state = scan.end_state();
        if !end_state.is_stable() {
            return Err(JtagError::UnstableEndState(end_state));
        }
        if !self.tap.is_trusted() {
            return Err(JtagError::StateUntrusted);
        }

        let len = scan.len();
        let mut bits = match scan.out() {
            Some(out) => out.to_bitvec(),
            None => bitvec![u8, Lsb0; 0; len],
        };
        bits.set_uninitialized(false);
        let mut data = bits.into_vec();

        tracing::debug!(
            "{} scan, {} bits, {:?}, end in {}",
            scan.register(),
            len,
            scan.scan_type(),
            end_state
        );
        tracing::trace!("out: {:02x?}", data);

        let result = self.backend.scan(RawScan {
            register: scan.register(),
            scan_type: scan.scan_type(),
            data: &mut data,
            bits: len,
            end_state,
        });
        if let Err(e) = result {
            return Err(self.backend_failed(e));
        }

        self.tap.set_current(end_state);
        self.tap.set_end_state(end_state)?;

        if scan.register() == ScanRegister::Ir {
            if let Some(out) = scan.out() {
                self.last_ir = Some(LastInstruction::new(out.to_bitvec()));
            }
        }

        match scan.scan_type() {
            ScanType::Out => Ok(CommandResult::None),
            ScanType::In | ScanType::Duplex => {
                tracing::trace!("in: {:02x?}", data);
                let mut captured = BitVec::<u8, Lsb0>::from_vec(data);
                captured.truncate(len);
                Ok(CommandResult::Captured(captured))
            }
        }
    }

    fn reset(&mut self, trst: bool, srst: bool) -> Result<(), JtagError> {
        tracing::debug!("reset trst: {} srst: {}", trst, srst);

        let trst_error = if trst { self.reset_tap().err() } else { None };

        let srst_error = if srst {
            self.backend.reset_system().err()
        } else {
            None
        };

        match (trst_error, srst_error) {
            (None, None) => Ok(()),
            (trst, srst) => {
                tracing::error!("Reset failed (TRST: {:?}, SRST: {:?})", trst, srst);
                Err(JtagError::Reset { trst, srst })
            }
        }
    }

    fn reset_tap(&mut self) -> Result<(), DebugProbeError> {
        let state = match self.backend.reset_tap() {
            Ok(state) => state,
            Err(e) => {
                self.tap.invalidate();
                return Err(e);
            }
        };
        self.tap.reset_to(state);

        if self.backend.capabilities().stale_capture_after_reset {
            // The first capture after the reset returns stale data, read and drop it.
            let mut data = [0u8];
            let result = self.backend.scan(RawScan {
                register: ScanRegister::Dr,
                scan_type: ScanType::In,
                data: &mut data,
                bits: 1,
                end_state: TapState::Reset,
            });
            if let Err(e) = result {
                self.tap.invalidate();
                return Err(e);
            }
            self.tap.set_current(TapState::Reset);
        }

        Ok(())
    }

    fn run_test(&mut self, cycles: u32, end_state: TapState) -> Result<(), JtagError> {
        if !end_state.is_stable() {
            return Err(JtagError::UnstableEndState(end_state));
        }

        self.move_to(TapState::Idle)?;

        tracing::debug!("runtest {} cycles, end in {}", cycles, end_state);
        if let Err(e) = self.backend.idle_clocks(cycles, self.last_ir.as_ref()) {
            return Err(self.backend_failed(e));
        }

        self.move_to(end_state)?;
        self.tap.set_end_state(end_state)
    }

    fn backend_failed(&mut self, error: DebugProbeError) -> JtagError {
        tracing::error!("{} backend failed: {}", self.backend.name(), error);
        self.tap.invalidate();
        JtagError::Probe(error)
    }
}
