//! Session/Council state machine
//!
//! One [`Session`] per debate council or swarm assembly. The session owns its
//! rounds and outcome exclusively; nothing outside the engine that created it
//! mutates it.
//!
//! # Phase Flow
//!
//! ```text
//! Debate:    Forming → Opening → Debating → Voting → Concluded → Archived
//!                         └─────(no rounds)──┘
//! Assembly:  Forming → Executing → Concluded → Archived
//!
//! Any non-terminal phase → Error (absorbing, no outcome)
//! ```

pub(crate) mod driver;
pub mod round;
pub mod state;

pub use round::{Round, RoundOutcome, Turn, TurnContent, TurnStatus};
pub use state::{
    FailureReason, Session, SessionKind, SessionPhase, Transition, TransitionError,
};
