//! `steps` crate: the `StepHandler` trait and helpers for writing steps.
//!
//! Every step of a workflow carries a [`StepHandler`] trait object. The
//! engine crate dispatches execution through it and never looks inside.

pub mod error;
pub mod traits;
pub mod func;
pub mod mock;

pub use error::StepError;
pub use traits::{StepContext, StepHandler};
pub use func::{handler_fn, FnStep};
