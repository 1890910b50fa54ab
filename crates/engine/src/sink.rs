//! Output sinks.

use std::sync::Mutex;

use objwatch_core::OutputEvent;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// Receives batches of change events. A batch is one initial list or one watch event.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, batch: Vec<OutputEvent>) -> Result<(), SinkError>;
}

/// Forwards batches into a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<OutputEvent>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Vec<OutputEvent>>) -> Self {
        Self { tx }
    }

    pub fn channel(cap: usize) -> (Self, mpsc::Receiver<Vec<OutputEvent>>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, batch: Vec<OutputEvent>) -> Result<(), SinkError> {
        self.tx.send(batch).await.map_err(|_| SinkError::Closed)
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<OutputEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Drain what has been collected so far.
    pub fn take(&self) -> Vec<OutputEvent> {
        self.events.lock().map(|mut v| std::mem::take(&mut *v)).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl EventSink for CollectingSink {
    async fn deliver(&self, batch: Vec<OutputEvent>) -> Result<(), SinkError> {
        let mut events = self.events.lock().map_err(|_| SinkError::Other("collector lock poisoned".into()))?;
        events.extend(batch);
        Ok(())
    }
}
