//! One state machine per logical exchange with the peripheral.
//!
//! Machines are plain synchronous types fed by the session: text lines from
//! the notification router, the deadline timer and link loss. Whatever input
//! first produces a terminal outcome wins; every later input returns `None`.

pub mod address;
pub mod configure;
pub mod scan;
pub mod settle;

pub use address::AddressRetrieval;
pub use configure::WifiConfiguration;
pub use scan::WifiScan;
pub use settle::Settle;

use std::fmt;

/// Kinds of exchange; at most one of each may be in flight per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    AddressRetrieval,
    WifiScan,
    WifiConfiguration,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::AddressRetrieval => "address retrieval",
            OperationKind::WifiScan => "WiFi scan",
            OperationKind::WifiConfiguration => "WiFi configuration",
        };
        f.write_str(name)
    }
}

/// Terminal result of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome<T> {
    Success(T),
    TimedOut,
    Failed(String),
}

/// Reason recorded when the link drops under a running exchange.
pub const LINK_LOST_REASON: &str = "peripheral disconnected";

/// A request/response exchange over the shared notification stream.
pub trait Exchange: Send + 'static {
    type Output: Send + 'static;

    const KIND: OperationKind;

    /// Frames to write, in order. The session pauses for the settle interval
    /// between consecutive frames.
    fn requests(&self) -> Vec<String>;

    /// The listener is registered and the first frame is about to go out.
    fn start(&mut self);

    /// Every frame has been written.
    fn on_sent(&mut self) {}

    /// One inbound line. Lines that belong to other exchanges must be ignored.
    fn on_line(&mut self, line: &str) -> Option<OperationOutcome<Self::Output>>;

    /// The deadline elapsed.
    fn on_deadline(&mut self) -> Option<OperationOutcome<Self::Output>>;

    /// The connection dropped.
    fn on_link_lost(&mut self) -> Option<OperationOutcome<Self::Output>>;

    fn is_finished(&self) -> bool;
}
