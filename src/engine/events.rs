#![forbid(unsafe_code)]

use tokio::sync::mpsc;

use crate::engine::TaskSnapshot;
use crate::task::executor::ExecutionResult;

/// Presenter -> consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start(usize),
    Shutdown,
}

/// Worker -> consumer. One per launch.
#[derive(Debug)]
pub enum WorkerEvent {
    Finished(ExecutionResult),
}

/// Consumer -> presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    /// A task's phase or last message changed.
    Changed(TaskSnapshot),
    /// Animation frame for a running task. Display only.
    Tick {
        index: usize,
        frame: u64,
        symbol: char,
    },
}

/// Sending half of an event channel. Sends never block; once the receiver
/// is gone events are dropped.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EventSender<T> {
    /// Returns `false` if the receiver has been dropped.
    pub fn emit(&self, event: T) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventReceiver<T> {
    /// Waits for the next event; `None` once every sender is gone and the
    /// queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(ev) = self.try_recv() {
            out.push(ev);
        }
        out
    }
}

#[must_use]
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}
