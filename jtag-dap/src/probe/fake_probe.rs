use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{
    BackendCapabilities, DebugProbeError, JtagBackend, LastInstruction, RawScan, ScanRegister,
    TapState,
};

/// One call made to a [`FakeProbe`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operation {
    Scan {
        register: ScanRegister,
        bits: usize,
        /// The outgoing bytes as handed to the backend.
        data: Vec<u8>,
        end_state: TapState,
    },
    ResetTap,
    ResetSystem,
    IdleClocks {
        cycles: u32,
        last_ir: Option<Vec<u8>>,
    },
    Tms(bool),
    SetState(TapState),
    SetSpeed(u32),
}

/// Shared view of the operations a [`FakeProbe`] performed.
///
/// The probe is usually moved into an engine, this handle stays with the test.
#[derive(Clone, Default, Debug)]
pub struct OperationLog(Arc<Mutex<Vec<Operation>>>);

impl OperationLog {
    fn lock(&self) -> MutexGuard<'_, Vec<Operation>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, operation: Operation) -> usize {
        let mut log = self.lock();
        log.push(operation);
        log.len() - 1
    }

    pub fn snapshot(&self) -> Vec<Operation> {
        self.lock().clone()
    }

    /// Only the scans, in order.
    pub fn scans(&self) -> Vec<Operation> {
        self.lock()
            .iter()
            .filter(|op| matches!(op, Operation::Scan { .. }))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Answers a scan by rewriting the buffer with the captured bits.
pub type ScanHandler =
    Box<dyn FnMut(ScanRegister, &mut [u8], usize) -> Result<(), DebugProbeError> + Send>;

/// This is a mock backend which can be used for mocking things in tests or for dry runs.
///
/// Without a scan handler it is a loopback: every scan captures exactly the
/// bits that were shifted in.
pub struct FakeProbe {
    operations: OperationLog,
    capabilities: BackendCapabilities,
    scan_handler: Option<ScanHandler>,
    fail_at: Option<usize>,
    system_reset: bool,
    speed_hz: u32,
}

impl Debug for FakeProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProbe")
            .field("capabilities", &self.capabilities)
            .field("fail_at", &self.fail_at)
            .field("system_reset", &self.system_reset)
            .field("speed_hz", &self.speed_hz)
            .finish_non_exhaustive()
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            operations: OperationLog::default(),
            capabilities: BackendCapabilities::default(),
            scan_handler: None,
            fail_at: None,
            system_reset: false,
            speed_hz: 1_000_000,
        }
    }
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the operations performed so far.
    pub fn operations(&self) -> OperationLog {
        self.operations.clone()
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_scan_handler(mut self, handler: ScanHandler) -> Self {
        self.scan_handler = Some(handler);
        self
    }

    /// Makes the `call`-th backend call (counting from zero) fail after it is recorded.
    pub fn fail_at_call(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Accepts SRST instead of reporting it as unsupported.
    pub fn with_system_reset(mut self) -> Self {
        self.system_reset = true;
        self
    }

    fn perform(&mut self, operation: Operation) -> Result<(), DebugProbeError> {
        let call = self.operations.record(operation);
        if self.fail_at == Some(call) {
            tracing::debug!("FakeProbe: failing call {}", call);
            return Err(DebugProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected failure",
            )));
        }
        Ok(())
    }
}

impl JtagBackend for FakeProbe {
    fn name(&self) -> &str {
        "Mock probe for testing"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn scan(&mut self, scan: RawScan<'_>) -> Result<(), DebugProbeError> {
        self.perform(Operation::Scan {
            register: scan.register,
            bits: scan.bits,
            data: scan.data.to_vec(),
            end_state: scan.end_state,
        })?;

        if let Some(handler) = self.scan_handler.as_mut() {
            handler(scan.register, scan.data, scan.bits)?;
        }
        Ok(())
    }

    fn reset_tap(&mut self) -> Result<TapState, DebugProbeError> {
        self.perform(Operation::ResetTap)?;
        Ok(TapState::Reset)
    }

    fn reset_system(&mut self) -> Result<(), DebugProbeError> {
        self.perform(Operation::ResetSystem)?;
        if self.system_reset {
            Ok(())
        } else {
            Err(DebugProbeError::NotSupported("system reset (SRST)"))
        }
    }

    fn idle_clocks(
        &mut self,
        cycles: u32,
        last_ir: Option<&LastInstruction>,
    ) -> Result<(), DebugProbeError> {
        self.perform(Operation::IdleClocks {
            cycles,
            last_ir: last_ir.map(LastInstruction::to_bytes),
        })
    }

    fn clock_tms(&mut self, tms: bool) -> Result<(), DebugProbeError> {
        self.perform(Operation::Tms(tms))
    }

    fn set_state(&mut self, state: TapState) -> Result<(), DebugProbeError> {
        self.perform(Operation::SetState(state))
    }

    fn set_speed(&mut self, hz: u32) -> Result<u32, DebugProbeError> {
        self.perform(Operation::SetSpeed(hz))?;
        self.speed_hz = hz;
        Ok(hz)
    }

    fn speed(&mut self) -> Result<u32, DebugProbeError> {
        Ok(self.speed_hz)
    }
}
