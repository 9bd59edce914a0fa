//! Workflow abstractions
//!
//! Workflows are deterministic state machines. The engine feeds them recorded
//! events and persists the actions they return before performing any effect.

mod action;
mod definition;
mod event;
mod signal;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::{TimeoutType, WorkflowEvent};
pub use signal::{signal_types, SignalChannel, WorkflowSignal};
