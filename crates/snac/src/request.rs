//! Outgoing command abstraction.

use crate::CmdType;

/// An outbound SNAC command awaiting transmission.
///
/// The scheduler never inspects a command beyond its [`CmdType`]: the pair
/// decides which rate class the command counts against, and the boxed value
/// travels through the queues untouched until the transport takes it back.
pub trait OutgoingSnac: Send {
    /// Returns the `(family, subtype)` pair used for rate classification.
    fn cmd_type(&self) -> CmdType;
}

impl<T: OutgoingSnac + ?Sized> OutgoingSnac for Box<T> {
    fn cmd_type(&self) -> CmdType {
        (**self).cmd_type()
    }
}
