//! Peer session plumbing for the decai messaging layer
//!
//! A session owns one reliable bidirectional byte stream:
//!
//! ```text
//!   producer ──push──▶ OutboundQueue ──▶ writer task ──▶ write half
//!   read half ──▶ InboundDispatcher ──▶ EnvelopeHandler (one task each)
//!                                             │
//!                                             └──reply──▶ OutboundQueue
//! ```
//!
//! Streams start with a protocol negotiation that also exchanges peer ids.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod queue;
pub mod session;
pub mod transport;

// Re-export main types
pub use dispatcher::{
    DispatchState, DispatchSummary, EnvelopeHandler, InboundContext, InboundDispatcher,
};
pub use error::SessionError;
pub use handshake::{negotiate, read_frame, Negotiated};
pub use queue::{run_writer, OutboundQueue, OutboundReceiver, WriterSummary};
pub use session::{PeerSession, SessionConfig, SessionEvent};
pub use transport::{connect_tcp, listen_tcp, PeerStream};
