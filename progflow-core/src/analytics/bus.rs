use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use crate::analytics::types::TraceEvent;

/// Live fan-out of trace events to any number of subscribers. Slow
/// subscribers lag and lose events; publishing never waits.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TraceEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: TraceEvent) {
        let _ = self.sender.send(event);
    }

    /// Every event of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.sender.subscribe()
    }

    /// Only the events of `run_id`. Subscribe before the run starts to see
    /// its `run_started` event.
    pub fn subscribe_run(&self, run_id: impl Into<String>) -> RunEvents {
        RunEvents {
            run_id: run_id.into(),
            receiver: self.sender.subscribe(),
            lagged: 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Trace events of a single run.
pub struct RunEvents {
    run_id: String,
    receiver: broadcast::Receiver<TraceEvent>,
    lagged: u64,
}

impl RunEvents {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Events lost because this subscriber fell behind. Counts events of
    /// all runs, since the bus is shared.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Next event of the run, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TraceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id == self.run_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event of the run, without waiting.
    pub fn try_recv(&mut self) -> Option<TraceEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.run_id == self.run_id => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lagged += skipped;
        warn!(run_id = %self.run_id, skipped, "trace subscriber fell behind");
    }
}
