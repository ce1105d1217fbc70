//! Transports. Any `AsyncRead`/`AsyncWrite` pair carries the protocol;
//! [`Link`] opens the concrete ones.

pub mod link;

pub use link::{Endpoint, Link};
