//! # warpflow-transport
//!
//! One streaming upstream request per call: writes the opaque request
//! payload, reads the server-sent-event response, and decodes each frame
//! through the [`EventCodec`] boundary into typed [`WarpEvent`]s.
//!
//! The returned stream is lazy, finite, and non-restartable. Network
//! errors mid-stream surface as a [`WarpEvent::Error`] and terminate the
//! stream; dropping the consumer drops the underlying connection.

pub mod codec;
pub mod errors;
pub mod events;
pub mod sse;
pub mod transport;

pub use codec::{EventCodec, JsonEventCodec};
pub use errors::TransportError;
pub use events::{EventStream, WarpEvent};
pub use transport::{TransportConfig, UpstreamTransport};
