//! The IEEE 1149.1 TAP controller state machine.

use std::fmt;

use bitvec::prelude::*;

use super::JtagError;

/// The position inside one of the two register columns of the TAP graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RegisterState {
    Select,
    Capture,
    Shift,
    Exit1,
    Pause,
    Exit2,
    Update,
}

impl RegisterState {
    /// The TMS value that moves one step closer to `target` within the same column.
    ///
    /// Only called for the states between Capture and Exit2, the column entry and
    /// exit are handled by [`TapState::step_toward`].
    fn step_toward(self, target: Self) -> bool {
        match self {
            Self::Capture if target == Self::Shift => false,
            Self::Exit1 if matches!(target, Self::Pause | Self::Shift) => false,
            Self::Exit2 if target == Self::Shift => false,
            _ => true,
        }
    }

    fn update(self, tms: bool) -> Self {
        if tms {
            match self {
                Self::Capture | Self::Shift => Self::Exit1,
                Self::Exit1 | Self::Exit2 => Self::Update,
                Self::Pause => Self::Exit2,
                // Select and Update leave the column and are handled by `TapState`.
                Self::Select | Self::Update => self,
            }
        } else {
            match self {
                Self::Select => Self::Capture,
                Self::Capture | Self::Shift | Self::Exit2 => Self::Shift,
                Self::Exit1 | Self::Pause => Self::Pause,
                Self::Update => self,
            }
        }
    }
}

/// One of the 16 TAP controller states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TapState {
    /// Test-Logic-Reset.
    Reset,
    /// Run-Test/Idle.
    Idle,
    /// One of the data register states.
    Dr(RegisterState),
    /// One of the instruction register states.
    Ir(RegisterState),
}

impl TapState {
    pub const DR_SHIFT: TapState = TapState::Dr(RegisterState::Shift);
    pub const DR_PAUSE: TapState = TapState::Dr(RegisterState::Pause);
    pub const IR_SHIFT: TapState = TapState::Ir(RegisterState::Shift);
    pub const IR_PAUSE: TapState = TapState::Ir(RegisterState::Pause);

    /// All 16 states, in the order of the Linux JTAG `jtag_tapstate` enumeration.
    pub const ALL: [TapState; 16] = [
        TapState::Reset,
        TapState::Idle,
        TapState::Dr(RegisterState::Select),
        TapState::Dr(RegisterState::Capture),
        TapState::Dr(RegisterState::Shift),
        TapState::Dr(RegisterState::Exit1),
        TapState::Dr(RegisterState::Pause),
        TapState::Dr(RegisterState::Exit2),
        TapState::Dr(RegisterState::Update),
        TapState::Ir(RegisterState::Select),
        TapState::Ir(RegisterState::Capture),
        TapState::Ir(RegisterState::Shift),
        TapState::Ir(RegisterState::Exit1),
        TapState::Ir(RegisterState::Pause),
        TapState::Ir(RegisterState::Exit2),
        TapState::Ir(RegisterState::Update),
    ];

    /// The states a scan or a run-test may end in.
    pub const STABLE: [TapState; 6] = [
        TapState::Reset,
        TapState::Idle,
        TapState::DR_SHIFT,
        TapState::DR_PAUSE,
        TapState::IR_SHIFT,
        TapState::IR_PAUSE,
    ];

    /// The state reached by clocking TCK once with the given TMS value.
    pub fn transition(self, tms: bool) -> TapState {
        match self {
            Self::Reset if tms => Self::Reset,
            Self::Reset => Self::Idle,
            Self::Idle if tms => Self::Dr(RegisterState::Select),
            Self::Idle => Self::Idle,
            Self::Dr(RegisterState::Select) if tms => Self::Ir(RegisterState::Select),
            Self::Ir(RegisterState::Select) if tms => Self::Reset,
            Self::Dr(RegisterState::Update) | Self::Ir(RegisterState::Update) => {
                if tms {
                    Self::Dr(RegisterState::Select)
                } else {
                    Self::Idle
                }
            }
            Self::Dr(state) => Self::Dr(state.update(tms)),
            Self::Ir(state) => Self::Ir(state.update(tms)),
        }
    }

    /// Whether a scan or run-test may end in this state.
    pub fn is_stable(self) -> bool {
        Self::STABLE.contains(&self)
    }

    fn stable_index(self) -> Option<usize> {
        Self::STABLE.iter().position(|s| *s == self)
    }

    /// The TMS value that moves one step closer to `target`, or `None` if already there.
    pub fn step_toward(self, target: Self) -> Option<bool> {
        let tms = match self {
            state if target == state => return None,
            Self::Reset => false,
            Self::Idle => true,
            Self::Dr(RegisterState::Select) => !matches!(target, Self::Dr(_)),
            Self::Ir(RegisterState::Select) => !matches!(target, Self::Ir(_)),
            Self::Dr(RegisterState::Update) | Self::Ir(RegisterState::Update) => {
                target != Self::Idle
            }
            Self::Dr(state) => {
                let next = if let Self::Dr(target) = target {
                    target
                } else {
                    RegisterState::Update
                };
                state.step_toward(next)
            }
            Self::Ir(state) => {
                let next = if let Self::Ir(target) = target {
                    target
                } else {
                    RegisterState::Update
                };
                state.step_toward(next)
            }
        };
        Some(tms)
    }

    /// The TMS sequence that moves the TAP from `self` to the stable state `goal`.
    ///
    /// Between two stable states the sequence comes from a fixed table. Any path
    /// into Test-Logic-Reset is five TMS high clocks. Starting from an unstable
    /// state the path is walked with [`TapState::step_toward`].
    pub fn path_to(self, goal: TapState) -> Result<BitVec<u8, Lsb0>, JtagError> {
        let Some(to) = goal.stable_index() else {
            return Err(JtagError::UnstableEndState(goal));
        };

        if let Some(from) = self.stable_index() {
            let (bits, len) = TMS_PATHS[from][to];
            let mut path = BitVec::<u8, Lsb0>::with_capacity(len);
            path.extend((0..len).map(|i| bits & (1 << i) != 0));
            return Ok(path);
        }

        let mut path = BitVec::new();
        let mut state = self;
        while let Some(tms) = state.step_toward(goal) {
            path.push(tms);
            state = state.transition(tms);
        }
        Ok(path)
    }
}

/// TMS paths between stable states, as `(bits, length)` shifted out LSB first.
///
/// Rows and columns follow [`TapState::STABLE`].
#[rustfmt::skip]
const TMS_PATHS: [[(u8, usize); 6]; 6] = [
    // RESET        IDLE         DRSHIFT        DRPAUSE          IRSHIFT           IRPAUSE
    [(0b11111, 5), (0b0, 1),   (0b0010, 4),  (0b01010, 5),   (0b00110, 5),   (0b010110, 6)],  // RESET
    [(0b11111, 5), (0b0, 0),   (0b001, 3),   (0b0101, 4),    (0b0011, 4),    (0b01011, 5)],   // IDLE
    [(0b11111, 5), (0b011, 3), (0b0, 0),     (0b01, 2),      (0b001111, 6),  (0b0101111, 7)], // DRSHIFT
    [(0b11111, 5), (0b011, 3), (0b01, 2),    (0b0, 0),       (0b001111, 6),  (0b0101111, 7)], // DRPAUSE
    [(0b11111, 5), (0b011, 3), (0b00111, 5), (0b010111, 6),  (0b0, 0),       (0b01, 2)],      // IRSHIFT
    [(0b11111, 5), (0b011, 3), (0b00111, 5), (0b010111, 6),  (0b01, 2),      (0b0, 0)],       // IRPAUSE
];

impl fmt::Display for TapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TapState::Reset => "RESET",
            TapState::Idle => "RUN/IDLE",
            TapState::Dr(RegisterState::Select) => "DRSELECT",
            TapState::Dr(RegisterState::Capture) => "DRCAPTURE",
            TapState::Dr(RegisterState::Shift) => "DRSHIFT",
            TapState::Dr(RegisterState::Exit1) => "DREXIT1",
            TapState::Dr(RegisterState::Pause) => "DRPAUSE",
            TapState::Dr(RegisterState::Exit2) => "DREXIT2",
            TapState::Dr(RegisterState::Update) => "DRUPDATE",
            TapState::Ir(RegisterState::Select) => "IRSELECT",
            TapState::Ir(RegisterState::Capture) => "IRCAPTURE",
            TapState::Ir(RegisterState::Shift) => "IRSHIFT",
            TapState::Ir(RegisterState::Exit1) => "IREXIT1",
            TapState::Ir(RegisterState::Pause) => "IRPAUSE",
            TapState::Ir(RegisterState::Exit2) => "IREXIT2",
            TapState::Ir(RegisterState::Update) => "IRUPDATE",
        };
        f.write_str(name)
    }
}

/// Tracks the current and end state of one TAP controller.
///
/// After a backend failure the tracked state is no longer trusted. Trust is
/// restored by a TRST reset or by five consecutive TMS high clocks.
#[derive(Debug, Clone)]
pub struct TapStateMachine {
    current: TapState,
    end_state: TapState,
    trusted: bool,
    consecutive_tms_high: u8,
}

impl Default for TapStateMachine {
    fn default() -> Self {
        // A TAP powers up in Test-Logic-Reset.
        Self {
            current: TapState::Reset,
            end_state: TapState::Reset,
            trusted: true,
            consecutive_tms_high: 0,
        }
    }
}

impl TapStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> TapState {
        self.current
    }

    pub fn end_state(&self) -> TapState {
        self.end_state
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Records the end state for the next scan or run-test.
    pub fn set_end_state(&mut self, state: TapState) -> Result<(), JtagError> {
        if !state.is_stable() {
            return Err(JtagError::UnstableEndState(state));
        }
        self.end_state = state;
        Ok(())
    }

    /// Records one TCK clock with the given TMS value.
    pub fn apply_tms(&mut self, tms: bool) {
        self.current = self.current.transition(tms);

        self.consecutive_tms_high = if tms {
            self.consecutive_tms_high.saturating_add(1)
        } else {
            0
        };

        if !self.trusted && self.consecutive_tms_high >= 5 {
            tracing::debug!("Five TMS high clocks seen, TAP state is known again");
            self.current = TapState::Reset;
            self.trusted = true;
        }
    }

    /// Records that the backend moved the TAP to `state`.
    pub fn set_current(&mut self, state: TapState) {
        self.current = state;
        self.consecutive_tms_high = 0;
    }

    /// Records a successful Test-Logic-Reset (or other reset the backend reported).
    pub fn reset_to(&mut self, state: TapState) {
        self.set_current(state);
        self.trusted = true;
    }

    /// Marks the tracked state as unknown.
    pub fn invalidate(&mut self) {
        self.trusted = false;
        self.consecutive_tms_high = 0;
    }
}
