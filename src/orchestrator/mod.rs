//! Migration orchestration components.
//!
//! Four narrow components, lowest first: [`token_manager`] owns the
//! authorization token, [`session_manager`] owns sessions bound to a
//! validated token, [`snapshot_orchestrator`] creates, uploads and cancels
//! snapshots, and [`run_tracker`] drives background runs over them.

pub mod context;
pub mod locks;
pub mod run_tracker;
pub mod session_manager;
pub mod snapshot_orchestrator;
pub mod token_manager;

pub use context::CallContext;
