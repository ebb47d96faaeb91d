//! Debate councils — opening statements, discussion, and a weighted vote.
//!
//! # Debate Flow
//!
//! ```text
//! Forming → Opening → Debating ──┬─ max rounds ────────┐
//!   │         │          │       └─ early stop ────────┤
//!   │         │          │                             ▼
//!   │         └──────────┼──(max_rounds = 0)──────→ Voting → Concluded → Archived
//!   │                    │                             │          │
//!   └────────────────────┴─────────────────────────────┴──────────┴──→ Error
//! ```
//!
//! Opening and voting rounds dispatch every participant concurrently.
//! Discussion rounds run in registration order so each speaker sees the
//! earlier speakers, or concurrently ("blind") when configured.

pub mod engine;
pub mod estimate;

pub use engine::DebateEngine;
pub use estimate::{ConsensusEstimate, EarlyStop};
