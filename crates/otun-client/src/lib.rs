//! otun tunnel agent.
//!
//! The agent dials the edge server, establishes a multiplexed session,
//! registers a tunnel on the control channel and then serves every stream
//! the edge opens by proxying it to a local service. Transient failures
//! are retried with exponential backoff; permanent ones (auth rejection,
//! subdomain collision, shutdown) end the run.

pub mod backoff;
pub mod config;
mod client;
mod errors;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{Client, Registration};
pub use errors::{is_permanent, is_transient, ClientError};
