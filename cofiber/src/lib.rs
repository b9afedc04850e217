//! Cofiber is a stackful, cooperative fiber engine.
//! Fibers run on their own stacks and switch only when they call `yield`; a thread's main fiber
//! drives them one at a time through `resume`.

pub mod config;
pub mod diag;
pub mod error;
pub mod fiber;
mod runtime;
pub mod stack;
pub mod thread;

pub use cofiber_macros::main;
pub use config::{Config, ConfigVar};
pub use error::{ConfigError, FiberError};
pub use fiber::{Fiber, State};
