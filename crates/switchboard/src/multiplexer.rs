//! Per connection fan-out from the orchestrator to one client.
//!
//! The queue is bounded. Heartbeats are the only events ever dropped; when
//! content needs room and none can be evicted, the sender waits.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::content::Content;
use crate::models::delta::Delta;
use crate::providers::base::Usage;

/// Events delivered to the client, in order. Every turn ends with exactly one
/// of `Done`, `Error` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Delta {
        delta: Delta,
    },
    ToolResult {
        id: String,
        name: String,
        content: Vec<Content>,
        is_error: bool,
    },
    Heartbeat,
    Done {
        stop_reason: Option<String>,
        usage: Usage,
    },
    Error {
        code: String,
        message: String,
    },
    Cancelled,
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientEvent::Done { .. } | ClientEvent::Error { .. } | ClientEvent::Cancelled
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ClientEvent::Heartbeat)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxError {
    #[error("Client disconnected")]
    Disconnected,

    #[error("Stream already terminated")]
    Terminated,
}

struct Inner {
    queue: VecDeque<ClientEvent>,
    receiver_alive: bool,
    terminated: bool,
    terminal_delivered: bool,
    senders: usize,
    last_activity: Instant,
}

struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create a multiplexer for one client connection. Dropping the receiver
/// before it has seen a terminal event cancels `cancel`.
///
/// Must be called from within a tokio runtime; it spawns the heartbeat ticker.
pub fn channel(
    capacity: usize,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) -> (MuxSender, MuxReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::new(),
            receiver_alive: true,
            terminated: false,
            terminal_delivered: false,
            senders: 1,
            last_activity: Instant::now(),
        }),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
        cancel,
    });

    tokio::spawn(heartbeat(Arc::downgrade(&shared), heartbeat_interval));

    (
        MuxSender {
            shared: shared.clone(),
        },
        MuxReceiver { shared },
    )
}

async fn heartbeat(shared: Weak<Shared>, interval: Duration) {
    let interval = interval.max(Duration::from_millis(1));
    loop {
        let wait = match shared.upgrade() {
            Some(shared) => interval.saturating_sub(shared.lock().last_activity.elapsed()),
            None => return,
        };
        tokio::time::sleep(wait.max(Duration::from_millis(1))).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        {
            let mut inner = shared.lock();
            if !inner.receiver_alive || inner.terminated {
                return;
            }
            if inner.last_activity.elapsed() < interval {
                continue;
            }
            inner.last_activity = Instant::now();
            if inner.queue.len() >= shared.capacity {
                continue;
            }
            inner.queue.push_back(ClientEvent::Heartbeat);
        }
        shared.readable.notify_one();
    }
}

/// Orchestrator side. Cloning adds a sender; the receiver sees the end of the
/// stream once every sender is gone.
pub struct MuxSender {
    shared: Arc<Shared>,
}

impl MuxSender {
    /// Queue an event, waiting for room if the queue is full of content
    pub async fn send(&self, event: ClientEvent) -> Result<(), MuxError> {
        let mut event = Some(event);
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                if !inner.receiver_alive {
                    return Err(MuxError::Disconnected);
                }
                if inner.terminated {
                    return Err(MuxError::Terminated);
                }
                if inner.queue.len() >= self.shared.capacity {
                    if let Some(position) = inner.queue.iter().position(ClientEvent::is_heartbeat) {
                        inner.queue.remove(position);
                    }
                }
                if inner.queue.len() < self.shared.capacity {
                    if let Some(event) = event.take() {
                        inner.terminated = event.is_terminal();
                        inner.queue.push_back(event);
                        inner.last_activity = Instant::now();
                    }
                    drop(inner);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.shared.lock();
        !inner.receiver_alive || inner.terminated
    }
}

impl Clone for MuxSender {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for MuxSender {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.shared.lock();
            inner.senders -= 1;
            inner.senders == 0
        };
        if last {
            self.shared.readable.notify_one();
        }
    }
}

/// Client side of the multiplexer
pub struct MuxReceiver {
    shared: Arc<Shared>,
}

impl MuxReceiver {
    /// Next event, or `None` once the terminal event has been delivered or
    /// every sender is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                if let Some(event) = inner.queue.pop_front() {
                    inner.terminal_delivered |= event.is_terminal();
                    drop(inner);
                    self.shared.writable.notify_waiters();
                    return Some(event);
                }
                if inner.terminated || inner.senders == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = ClientEvent> + Send + 'static {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
    }
}

impl Drop for MuxReceiver {
    fn drop(&mut self) {
        let delivered = {
            let mut inner = self.shared.lock();
            inner.receiver_alive = false;
            inner.queue.clear();
            inner.terminal_delivered
        };
        if !delivered {
            tracing::debug!("client went away before the turn finished");
            self.shared.cancel.cancel();
        }
        self.shared.writable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_secs(3600);

    fn text(s: &str) -> ClientEvent {
        ClientEvent::Delta {
            delta: Delta::text(s),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_and_end_after_terminal() {
        let (sender, mut receiver) = channel(8, QUIET, CancellationToken::new());
        sender.send(text("a")).await.unwrap();
        sender.send(text("b")).await.unwrap();
        sender.send(ClientEvent::Cancelled).await.unwrap();
        assert_eq!(sender.send(text("c")).await, Err(MuxError::Terminated));

        assert_eq!(receiver.recv().await, Some(text("a")));
        assert_eq!(receiver.recv().await, Some(text("b")));
        assert_eq!(receiver.recv().await, Some(ClientEvent::Cancelled));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_heartbeat_during_silence() {
        let (sender, mut receiver) = channel(8, Duration::from_millis(20), CancellationToken::new());
        let event = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ClientEvent::Heartbeat));
        drop(sender);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (sender, mut receiver) = channel(2, QUIET, CancellationToken::new());
        sender.send(text("1")).await.unwrap();
        sender.send(text("2")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sender.send(text("3"))).await;
        assert!(blocked.is_err());

        assert_eq!(receiver.recv().await, Some(text("1")));
        sender.send(text("3")).await.unwrap();
        assert_eq!(receiver.recv().await, Some(text("2")));
        assert_eq!(receiver.recv().await, Some(text("3")));
    }

    #[tokio::test]
    async fn test_heartbeat_is_evicted_for_content() {
        let (sender, mut receiver) = channel(1, Duration::from_millis(10), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(80)).await;

        tokio::time::timeout(Duration::from_millis(500), sender.send(text("content")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receiver.recv().await, Some(text("content")));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_turn() {
        let cancel = CancellationToken::new();
        let (sender, receiver) = channel(4, QUIET, cancel.clone());
        sender.send(text("a")).await.unwrap();
        drop(receiver);

        assert!(cancel.is_cancelled());
        assert!(sender.is_closed());
        assert_eq!(sender.send(text("b")).await, Err(MuxError::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_after_terminal_does_not_cancel() {
        let cancel = CancellationToken::new();
        let (sender, mut receiver) = channel(4, QUIET, cancel.clone());
        sender
            .send(ClientEvent::Done {
                stop_reason: None,
                usage: Usage::default(),
            })
            .await
            .unwrap();
        assert!(receiver.recv().await.unwrap().is_terminal());
        drop(receiver);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_drop() {
        let (sender, mut receiver) = channel(4, QUIET, CancellationToken::new());
        let other = sender.clone();
        drop(sender);
        other.send(text("x")).await.unwrap();
        drop(other);
        assert_eq!(receiver.recv().await, Some(text("x")));
        assert_eq!(receiver.recv().await, None);
    }

    #[test]
    fn test_client_event_wire_format() {
        let value = serde_json::to_value(ClientEvent::Error {
            code: "provider_auth".to_string(),
            message: "bad key".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["code"], "provider_auth");

        let value = serde_json::to_value(text("hi")).unwrap();
        assert_eq!(value["event"], "delta");
        assert_eq!(value["delta"]["type"], "text");
    }
}
