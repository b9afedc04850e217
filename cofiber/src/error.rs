//! Error types shared across the crate.

use thiserror::Error;

use crate::fiber::State;

#[derive(Debug, Error)]
pub enum FiberError {
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAlloc { size: usize },

    #[error("requested stack size {size} is below the minimum of {min} bytes")]
    StackTooSmall { size: usize, min: usize },

    #[error("cannot {op} fiber {id} in state {state}")]
    InvalidState {
        op: &'static str,
        id: u64,
        state: State,
    },

    #[error("fiber {id} owns no stack")]
    NoStack { id: u64 },

    #[error("fiber {id} can only be resumed from the main fiber, but fiber {current} is running")]
    NotOnMainFiber { id: u64, current: u64 },

    #[error("fiber {id} cannot yield while fiber {current} is running")]
    NotRunning { id: u64, current: u64 },

    #[error("the main fiber {id} cannot yield")]
    MainFiberYield { id: u64 },

    #[error("fiber {id} has no saved execution context")]
    MissingContext { id: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config name `{0}`")]
    InvalidName(String),

    #[error("config `{name}` is already registered with a different type")]
    TypeMismatch { name: String },

    #[error("cannot parse `{value}` for config `{name}`")]
    Parse { name: String, value: String },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
