//! Event-driven observation of council sessions
//!
//! Engines publish a [`CouncilEvent`] for every phase transition, recorded
//! turn, discarded arrival, closed round and final outcome. Subscribers
//! (presentation, persistence, tests) listen on a broadcast channel.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │    Engine    │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::{CouncilEvent, EventId};
