//! Domain model module declarations.

pub mod resource;
pub mod run;
pub mod session;
pub mod snapshot;
pub mod token;
pub mod user;
