//! RFC 3261 SIP dialog and transaction management core.
//!
//! This crate owns dialog/transaction *state*: identifiers, the dialog and
//! transaction state machines, the registry indexing both, and the executor
//! serializing work per dialog. It never opens a socket -- [`transport`]
//! defines the collaborator interfaces a host binary implements to actually
//! put bytes on a wire.

pub mod config;
pub mod dialog;
pub mod error;
pub mod events;
pub mod identifiers;
pub mod registry;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::{Error, Result};
