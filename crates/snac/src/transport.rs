//! The wire side of the scheduler.

use crate::OutgoingSnac;

/// Something that can put a SNAC on the connection right now.
///
/// `send_now` is fire-and-forget from the scheduler's perspective:
/// implementations own their write failures and report them through their own
/// channels. After a successful write the transport reports the send, with
/// the actual transmission timestamp, back to the rate bookkeeping so the
/// locally tracked running averages stay aligned with what the server saw.
pub trait SnacTransport: Send + Sync {
    /// Hands one command directly to the wire.
    fn send_now(&self, snac: Box<dyn OutgoingSnac>);
}
