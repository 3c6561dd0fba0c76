//! Where a run's output events go.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::OutputEvent;

/// The consumer went away. The run treats this like a cancellation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Ordered consumer of output events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: OutputEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<OutputEvent> {
    async fn send(&self, event: OutputEvent) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, event).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<OutputEvent> {
    async fn send(&self, event: OutputEvent) -> Result<(), SinkClosed> {
        mpsc::UnboundedSender::send(self, event).map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventClock, OutputEventKind};

    #[tokio::test]
    async fn sender_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut clock = EventClock::new();
        tokio_test::assert_ok!(
            EventSink::send(&tx, clock.stamp(OutputEventKind::run_started("t", "r"))).await
        );
        drop(rx);
        let err = tokio_test::assert_err!(
            EventSink::send(&tx, clock.stamp(OutputEventKind::run_started("t", "r"))).await
        );
        assert_eq!(err, SinkClosed);
    }
}
