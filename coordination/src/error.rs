//! Top-level error taxonomy.
//!
//! Engines never return these for a session that ran: a failed session is a
//! [`SessionRecord`](crate::transcript::SessionRecord) in the `error` phase
//! carrying a [`FailureReason`](crate::session::FailureReason). `EngineError`
//! covers everything around a run: configuration, loading, registration,
//! sinks.

use crate::agent::ProviderError;
use crate::assembly::AssemblyError;
use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::selection::SelectionError;
use crate::session::TransitionError;
use crate::tally::TallyError;
use crate::transcript::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Tally(#[from] TallyError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type EngineResult<T> = Result<T, EngineError>;
