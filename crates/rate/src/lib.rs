#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! Client-side mirror of OSCAR's server-side rate limiting.
//!
//! OSCAR servers meter each connection with a windowed running average of
//! the gaps between commands: every send folds its gap into the average,
//! and once the average dips below a class's limit threshold the server
//! starts dropping commands. The parameters all arrive on the wire, so a
//! client can run the same arithmetic locally and know, before sending,
//! exactly how long to hold a command for the average to stay safe.
//!
//! [`RateMonitor`] tracks every rate class the server advertises for one
//! connection. Each class gets a [`RateClassMonitor`] that replays the
//! server's average, answers "is it safe right now", and computes the
//! minimal wait when it is not.
//!
//! ```
//! use rate::{RateClassId, RateClassInfo, RateMonitor, RateState};
//! use snac::{CmdType, family};
//!
//! let monitor = RateMonitor::new();
//! monitor.set_rate_classes(vec![RateClassInfo {
//!     id: RateClassId(1),
//!     window_size: 80,
//!     clear_avg: 2500,
//!     warn_avg: 2250,
//!     limited_avg: 2000,
//!     disconnect_avg: 1500,
//!     current_avg: 6000,
//!     max: 6000,
//!     server_state: RateState::Normal,
//!     commands: Vec::new(),
//! }]);
//!
//! let class = monitor
//!     .monitor_for(CmdType::new(family::ICBM, 0x0006))
//!     .expect("the empty command list makes class 1 the default");
//! assert!(class.safe_to_send_now());
//! ```

mod average;
mod change;
mod error;
mod events;
mod info;
mod monitor;
mod rate_monitor;

pub use average::{average_after_send, wait_until_average};
pub use change::RateChangeCode;
pub use error::RateError;
pub use events::{ListenerId, RateEvent, RateListener};
pub use info::{RateClassId, RateClassInfo, RateState};
pub use monitor::{INHERIT_ERROR_MARGIN, RateClassMonitor};
pub use rate_monitor::{DEFAULT_ERROR_MARGIN_MS, RateMonitor};

// Target for this crate's tracing output.
pub(crate) const TRACE_TARGET: &str = "oscar::rate";
