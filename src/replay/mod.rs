//! rr replay session controller over GDB/MI

pub mod correlator;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod parser;
pub mod session;
pub mod types;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use correlator::CompletionPredicate;
pub use error::ControllerError;
pub use manager::SessionManager;
pub use types::*;
