//! Record source adapters (pull side of the dispatcher)
//!
//! The dispatcher never waits on a source: `next_pending` returns
//! immediately with the oldest unclaimed record, or `None`.

use super::types::Record;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// All producers are gone and nothing is left to route
    #[error("record source disconnected")]
    Disconnected,
}

/// Non-blocking pull interface over pending records
pub trait RecordSource: Send {
    /// Remove and return the oldest unclaimed record
    fn next_pending(&mut self) -> Result<Option<Record>, SourceError>;

    /// Return a record that could not be routed this tick (back of the queue)
    fn requeue(&mut self, record: Record);

    /// Records currently waiting to be claimed
    fn pending_len(&self) -> usize;
}

impl RecordSource for VecDeque<Record> {
    fn next_pending(&mut self) -> Result<Option<Record>, SourceError> {
        Ok(self.pop_front())
    }

    fn requeue(&mut self, record: Record) {
        self.push_back(record);
    }

    fn pending_len(&self) -> usize {
        self.len()
    }
}

/// Source fed by producers over an mpsc channel
///
/// Records received from the channel are moved into a local backlog, so a
/// requeued record is ordered behind everything already delivered.
pub struct ChannelSource {
    rx: mpsc::Receiver<Record>,
    backlog: VecDeque<Record>,
    closed: bool,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Record>) -> Self {
        Self {
            rx,
            backlog: VecDeque::new(),
            closed: false,
        }
    }

    /// Move everything currently buffered in the channel into the backlog
    fn drain_channel(&mut self) {
        if self.closed {
            return;
        }

        loop {
            match self.rx.try_recv() {
                Ok(record) => self.backlog.push_back(record),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("⚠️  Record channel closed, no more records will arrive");
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl RecordSource for ChannelSource {
    fn next_pending(&mut self) -> Result<Option<Record>, SourceError> {
        self.drain_channel();

        match self.backlog.pop_front() {
            Some(record) => Ok(Some(record)),
            None if self.closed => Err(SourceError::Disconnected),
            None => Ok(None),
        }
    }

    fn requeue(&mut self, record: Record) {
        self.backlog.push_back(record);
    }

    fn pending_len(&self) -> usize {
        self.backlog.len() + self.rx.len()
    }
}
