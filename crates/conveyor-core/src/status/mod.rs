//! Status reporting: client, transports and the push wire format.

pub mod client;
mod error;
pub mod local;
pub mod remote;
pub mod transport;
pub mod wire;

pub use client::{DONE_STATUS, LogLine, STARTED_MESSAGE, StatusClient};
pub use error::StatusError;
pub use local::{LocalTransport, expand_reference};
pub use remote::RemoteTransport;
pub use transport::{DetachedTransport, StatusTransport};
