use core::fmt;
use std::{collections::HashMap, sync::Arc};

use bitvec::prelude::*;

use super::{JtagError, ScanRegister, TapState};

/// Direction of the data moved by a scan.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanType {
    /// Only the captured bits matter, zeros are shifted in.
    In,
    /// Only the shifted bits matter, the capture is dropped.
    Out,
    /// Bits are shifted in and the capture is returned.
    Duplex,
}

/// An IR or DR scan.
///
/// The scan type follows from what was populated: outgoing bits make it
/// [`ScanType::Out`], a capture request alone makes it [`ScanType::In`],
/// both make it [`ScanType::Duplex`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ScanCommand {
    register: ScanRegister,
    len: usize,
    out: Option<BitVec<u8, Lsb0>>,
    capture: bool,
    end_state: TapState,
}

impl ScanCommand {
    /// Shifts `bits` into the instruction register.
    pub fn ir(bits: BitVec<u8, Lsb0>) -> Self {
        Self::write(ScanRegister::Ir, bits)
    }

    /// Shifts `bits` into a data register.
    pub fn dr(bits: BitVec<u8, Lsb0>) -> Self {
        Self::write(ScanRegister::Dr, bits)
    }

    /// Captures `len` bits from a data register while shifting in zeros.
    pub fn read_dr(len: usize) -> Self {
        Self {
            register: ScanRegister::Dr,
            len,
            out: None,
            capture: true,
            end_state: TapState::Idle,
        }
    }

    /// Shifts the low `len` bits of `data` into the given register.
    pub fn from_bytes(register: ScanRegister, data: &[u8], len: usize) -> Self {
        let available = data.view_bits::<Lsb0>();
        let mut bits = available[..len.min(available.len())].to_bitvec();
        bits.resize(len, false);
        Self::write(register, bits)
    }

    fn write(register: ScanRegister, bits: BitVec<u8, Lsb0>) -> Self {
        Self {
            register,
            len: bits.len(),
            out: Some(bits),
            capture: false,
            end_state: TapState::Idle,
        }
    }

    /// Also returns the captured bits.
    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// The state the TAP is left in after the scan. Defaults to Run-Test/Idle.
    pub fn with_end_state(mut self, end_state: TapState) -> Self {
        self.end_state = end_state;
        self
    }

    pub fn register(&self) -> ScanRegister {
        self.register
    }

    /// Number of bits shifted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end_state(&self) -> TapState {
        self.end_state
    }

    /// The outgoing bits, if any were set.
    pub fn out(&self) -> Option<&BitSlice<u8, Lsb0>> {
        self.out.as_deref()
    }

    pub fn scan_type(&self) -> ScanType {
        match (&self.out, self.capture) {
            (Some(_), true) => ScanType::Duplex,
            (None, true) => ScanType::In,
            (_, false) => ScanType::Out,
        }
    }
}

/// A command queued in a [`CommandQueue`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum JtagCommand {
    Scan(ScanCommand),
    /// Asserts TRST and/or SRST.
    Reset { trst: bool, srst: bool },
    /// Moves to Run-Test/Idle, clocks `cycles` times, then moves to `end_state`.
    RunTest { cycles: u32, end_state: TapState },
    /// A run-test that stays in Run-Test/Idle.
    StableClocks { cycles: u32 },
    /// Waits without touching the backend.
    Sleep { micros: u64 },
    /// Clocks the given TMS values, one TCK per bit.
    Tms { bits: BitVec<u8, Lsb0> },
    /// Waypoint moves are queued but rejected on execution.
    PathMove { path: Vec<TapState> },
}

impl JtagCommand {
    pub fn name(&self) -> &'static str {
        match self {
            JtagCommand::Scan(_) => "scan",
            JtagCommand::Reset { .. } => "reset",
            JtagCommand::RunTest { .. } => "runtest",
            JtagCommand::StableClocks { .. } => "stableclocks",
            JtagCommand::Sleep { .. } => "sleep",
            JtagCommand::Tms { .. } => "tms",
            JtagCommand::PathMove { .. } => "pathmove",
        }
    }
}

impl From<ScanCommand> for JtagCommand {
    fn from(scan: ScanCommand) -> Self {
        JtagCommand::Scan(scan)
    }
}

/// The result of one executed command.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CommandResult {
    None,
    Captured(BitVec<u8, Lsb0>),
}

impl CommandResult {
    /// The captured bits, if the command captured any.
    pub fn into_bits(self) -> Option<BitVec<u8, Lsb0>> {
        match self {
            CommandResult::Captured(bits) => Some(bits),
            CommandResult::None => None,
        }
    }
}

/// An error that occurred during execution of a [`CommandQueue`].
///
/// Commands after `index` were not attempted.
#[derive(thiserror::Error, Debug)]
pub struct BatchExecutionError {
    /// The error raised by the failing command.
    #[source]
    pub error: JtagError,

    /// Position of the failing command in the queue.
    pub index: usize,

    /// The results of the commands that were executed before the error occurred.
    pub results: DeferredResultSet<CommandResult>,
}

impl BatchExecutionError {
    pub(crate) fn new(
        error: JtagError,
        index: usize,
        results: DeferredResultSet<CommandResult>,
    ) -> Self {
        BatchExecutionError {
            error,
            index,
            results,
        }
    }
}

impl fmt::Display for BatchExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error cause was {}. Successful command count {}",
            self.error, self.index
        )
    }
}

/// The set of results returned by executing a batched command.
pub struct DeferredResultSet<T>(HashMap<DeferredResultIndex, T>);

impl<T: fmt::Debug> fmt::Debug for DeferredResultSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredResultSet").field(&self.0).finish()
    }
}

impl<T> Default for DeferredResultSet<T> {
    fn default() -> Self {
        Self(HashMap::default())
    }
}

impl<T> DeferredResultSet<T> {
    /// Creates a new empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, idx: &DeferredResultIndex, result: T) {
        self.0.insert(idx.clone(), result);
    }

    /// Returns the number of results in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Takes a result from the set.
    pub fn take(&mut self, index: DeferredResultIndex) -> Result<T, DeferredResultIndex> {
        self.0.remove(&index).ok_or(index)
    }
}

/// An index type used to retrieve the result of a deferred command.
///
/// This type can detect if the result of a command is not used.
#[derive(Eq)]
pub struct DeferredResultIndex(Arc<()>);

impl PartialEq for DeferredResultIndex {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DeferredResultIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredResultIndex")
            .field(&self.id())
            .finish()
    }
}

impl DeferredResultIndex {
    // Intentionally private. User code must not be able to create these.
    fn new() -> Self {
        Self(Arc::new(()))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn should_capture(&self) -> bool {
        // The queue holds one reference. If the caller dropped theirs, nobody
        // can read the result and it does not need to be kept.
        Arc::strong_count(&self.0) > 1
    }

    // Intentionally private. User code must not be able to clone these.
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::hash::Hash for DeferredResultIndex {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

/// An ordered list of JTAG commands, executed in insertion order by
/// [`JtagEngine::execute`](super::JtagEngine::execute).
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<(DeferredResultIndex, JtagCommand)>,
}

impl CommandQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a command for later execution.
    ///
    /// Returns a token value that can be used to retrieve the result of the command.
    pub fn schedule(&mut self, command: impl Into<JtagCommand>) -> DeferredResultIndex {
        let index = DeferredResultIndex::new();
        self.commands.push((index.clone(), command.into()));
        index
    }

    /// Returns the number of commands in the queue.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JtagCommand> {
        self.commands.iter().map(|(_, command)| command)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &(DeferredResultIndex, JtagCommand)> {
        self.commands.iter()
    }

    /// Removes all commands.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
