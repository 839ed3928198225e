//! Outgoing Queue
//!
//! Holds caller requests until a channel can take them. A request leaves the
//! queue only after its send succeeded, so nothing is dropped and nothing is
//! sent twice.

use crate::transport::{FrameSink, TransportError};
use chatstream_core::PendingRequest;
use std::collections::VecDeque;
use tracing::debug;

/// Result of one flush: what went out, and why it stopped early if it did.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub sent: Vec<PendingRequest>,
    pub stopped: Option<TransportError>,
}

#[derive(Debug, Default)]
pub struct OutgoingQueue {
    pending: VecDeque<PendingRequest>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
        debug!(queued = self.pending.len(), "request queued");
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops everything still waiting. Returns how many requests were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Sends queued requests in order until the queue is empty or a send fails.
    /// The failing request and everything behind it stay queued.
    pub async fn flush<S>(&mut self, sink: &mut S) -> FlushReport
    where
        S: FrameSink + ?Sized,
    {
        let mut report = FlushReport::default();
        while let Some(next) = self.pending.front() {
            if let Err(e) = sink.send(&next.encoded).await {
                debug!(error = %e, remaining = self.pending.len(), "flush stopped");
                report.stopped = Some(e);
                break;
            }
            if let Some(sent) = self.pending.pop_front() {
                report.sent.push(sent);
            }
        }
        report
    }
}
