//! Dispatch orchestration: one offer at a time per request, with decline,
//! timeout, disconnect and cancel handling.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{DispatchCollaborators, Dispatcher, RideRequestTicket};
pub use state::{DispatchState, PendingSnapshot};
