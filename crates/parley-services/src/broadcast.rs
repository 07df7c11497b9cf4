//! Fan-out of one envelope to every other online session.

use bytes::Bytes;

use parley_core::{DecodeError, Envelope};

use crate::registry::{Delivery, SessionRegistry};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Encode `envelope` once and queue it for every session except `excluded`.
pub async fn relay(
    registry: &SessionRegistry,
    envelope: &Envelope,
    excluded: &str,
) -> Result<RelayReport, DecodeError> {
    let frame = envelope.to_frame()?;
    Ok(relay_frame(registry, frame, excluded).await)
}

/// Queue an already-encoded frame for every session except `excluded`.
///
/// Never waits on a recipient. A recipient whose queue is full is evicted;
/// its own handler removes it from the registry.
pub async fn relay_frame(registry: &SessionRegistry, frame: Bytes, excluded: &str) -> RelayReport {
    let mut report = RelayReport::default();

    registry
        .for_each_except(excluded, |username, handle| {
            match handle.try_deliver(frame.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Full => {
                    tracing::warn!(
                        username,
                        conn_id = %handle.id(),
                        "outbound queue full, evicting slow session"
                    );
                    handle.evict();
                    report.dropped += 1;
                }
                Delivery::Closed => {
                    tracing::debug!(username, conn_id = %handle.id(), "session already closing");
                    report.dropped += 1;
                }
            }
        })
        .await;

    report
}
