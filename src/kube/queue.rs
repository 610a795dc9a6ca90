// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::strng::Strng;

pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("queue {0} did not close within {1:?}")]
    CloseTimeout(Strng, Duration),
    #[error("queue {0} is already running")]
    AlreadyRunning(Strng),
}

/// Queue runs pushed tasks one at a time, in submission order.
///
/// Tasks can be pushed at any point; they only execute once [Queue::run] is called. A failed task
/// is logged and the queue moves on.
pub struct Queue {
    id: Strng,
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    closed: watch::Sender<bool>,
}

impl Queue {
    pub fn new(id: Strng) -> Queue {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Queue {
            id,
            tx,
            rx: Mutex::new(Some(rx)),
            closed,
        }
    }

    pub fn push<F>(&self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        // The receiver is only dropped once the queue has stopped; late work is discarded.
        if self.tx.send(Box::new(task)).is_err() {
            debug!(queue=%self.id, "dropping task pushed after close");
        }
    }

    /// Processes tasks until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), Error> {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::AlreadyRunning(self.id.clone()))?;
        debug!(queue=%self.id, "queue started");
        loop {
            let task = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            if let Err(e) = task() {
                warn!(queue=%self.id, "work item handle failed: {e}");
            }
        }
        rx.close();
        self.closed.send_replace(true);
        info!(queue=%self.id, "queue closed");
        Ok(())
    }

    pub fn closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits for [Queue::run] to return, giving up after `timeout`.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.closed.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|closed| *closed))
            .await
            .map(|_| ())
            .map_err(|_| Error::CloseTimeout(self.id.clone(), timeout))
    }

    /// Waits until every task pushed before this call has run.
    #[cfg(any(test, feature = "testing"))]
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.push(move || {
            let _ = tx.send(());
            Ok(())
        });
        let _ = rx.await;
    }
}
