#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! Deferred-send scheduling for rate-limited OSCAR connections.
//!
//! The `rate` crate answers "how long until this command is safe to send";
//! this crate does the holding. Each attached connection gets one FIFO
//! queue per advertised rate class and a dedicated worker thread
//! ([`QueueRunner`]) that flushes queues the moment their class turns safe
//! and sleeps precisely until the next deadline. Workers idle out after
//! [`DEFAULT_IDLE_TIMEOUT`] and restart transparently on the next enqueue;
//! no command is ever lost across the transition.
//!
//! [`RateLimitingQueueMgr`] is the embedding client's single entry point:
//! one instance per session, one attached transport per OSCAR connection.
//!
//! ```
//! use queue::RateLimitingQueueMgr;
//! use snac::{CmdType, OutgoingSnac, SnacTransport, family};
//! use std::sync::Arc;
//!
//! struct Wire;
//!
//! impl SnacTransport for Wire {
//!     fn send_now(&self, snac: Box<dyn OutgoingSnac>) {
//!         println!("sending {}", snac.cmd_type());
//!     }
//! }
//!
//! struct SetIdle;
//!
//! impl OutgoingSnac for SetIdle {
//!     fn cmd_type(&self) -> CmdType {
//!         CmdType::new(family::OSERVICE, 0x0011)
//!     }
//! }
//!
//! let scheduler = RateLimitingQueueMgr::new();
//! let conn = scheduler.attach(Arc::new(Wire));
//! // No rate snapshot has arrived yet, so this goes straight to the wire.
//! scheduler.queue_snac(conn, Box::new(SetIdle))?;
//! scheduler.detach(conn)?;
//! # Ok::<(), queue::QueueError>(())
//! ```

mod connection;
mod error;
mod manager;
mod rate_queue;
mod runner;

pub use connection::QueueStats;
pub use error::QueueError;
pub use manager::{ConnectionId, RateLimitingQueueMgr};
pub use runner::{DEFAULT_IDLE_TIMEOUT, FutureEventQueue, QueueRunner};

// Target for this crate's tracing output.
pub(crate) const TRACE_TARGET: &str = "oscar::queue";
