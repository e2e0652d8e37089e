//! Auth-domain identifiers and secret-redaction wrappers.

pub mod id;
pub mod secret;

pub use id::*;
pub use secret::*;
