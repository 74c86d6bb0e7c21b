use std::io::{self, ErrorKind};

use tracing::{debug, warn};

use crate::registry::ConnectionId;

/// Where a broadcast is written to, and how a failed target is dropped.
pub trait Delivery {
    /// Writes `payload` to `target`. A missing target is reported as an error.
    fn deliver(&self, target: ConnectionId, payload: &[u8]) -> io::Result<()>;

    /// Removes `target` as though it had disconnected.
    fn evict(&self, target: ConnectionId);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Targets whose send buffer was full; they stay registered.
    pub skipped: usize,
    pub evicted: usize,
}

/// `"<name> says: <text>"`
pub fn format_message(sender: &str, text: &str) -> String {
    format!("{sender} says: {text}")
}

/// Best-effort fan-out of `message` to every target.
///
/// A failing target is evicted and the loop moves on; nothing is retried and
/// nothing is reported back to the sender.
pub fn broadcast<D>(message: &str, targets: &[ConnectionId], delivery: &D) -> BroadcastReport
where
    D: Delivery + ?Sized,
{
    let payload = message.as_bytes();
    let mut report = BroadcastReport::default();

    for &target in targets {
        match delivery.deliver(target, payload) {
            Ok(()) => report.delivered += 1,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                warn!(%target, "send buffer full, message dropped for target");
                report.skipped += 1;
            }
            Err(err) => {
                debug!(%target, error = ?err, "write failed, dropping target");
                delivery.evict(target);
                report.evicted += 1;
            }
        }
    }

    report
}
