#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! SNAC command identity and the transport seam of the OSCAR client stack.
//!
//! Every command on an OSCAR connection is a SNAC, identified by a
//! `(family, subtype)` pair; the server's rate-limiting machinery is keyed on
//! exactly that pair. This crate holds the identity type shared by the rate
//! and queue layers together with the two traits that connect the scheduler
//! to the rest of a client: [`OutgoingSnac`] (a command awaiting
//! transmission) and [`SnacTransport`] (the wire it eventually goes out on).
//!
//! Byte layout is deliberately out of scope. FLAP framing and SNAC
//! encoding live with the transport; the scheduler only ever classifies
//! commands and hands them back untouched.
//!
//! ```
//! use snac::{CmdType, family};
//!
//! let outgoing_im = CmdType::new(family::ICBM, 0x0006);
//! assert_eq!(outgoing_im.family(), 0x0004);
//! assert_eq!(outgoing_im.to_string(), "0x0004/0x0006");
//! ```

mod cmd_type;
mod request;
mod transport;

pub use cmd_type::{CmdType, family, oservice};
pub use request::OutgoingSnac;
pub use transport::SnacTransport;
