use futures_util::future::join_all;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Hot broadcast that replays the latest value to every new subscriber.
///
/// Each subscriber owns an unbounded queue, so a slow reader sees every value published after
/// it subscribed. Closing drops all listener queues: their streams end once drained, and later
/// subscribers still receive the final value before their stream ends.
pub struct Multicast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

struct Shared<T> {
    latest: Option<T>,
    listeners: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                latest: None,
                listeners: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn with_latest(value: T) -> Self {
        let multicast = Self::new();
        multicast.lock().latest = Some(value);
        multicast
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.lock();
        if let Some(latest) = &shared.latest {
            let _ = tx.send(latest.clone());
        }
        if !shared.closed {
            shared.listeners.push(tx);
        }
        Subscription { rx }
    }

    /// Delivers `value` to every live listener and returns how many received it.
    pub fn publish(&self, value: T) -> usize {
        let mut shared = self.lock();
        if shared.closed {
            return 0;
        }
        shared
            .listeners
            .retain(|listener| listener.send(value.clone()).is_ok());
        shared.latest = Some(value);
        shared.listeners.len()
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    pub fn listener_count(&self) -> usize {
        let mut shared = self.lock();
        shared.listeners.retain(|listener| !listener.is_closed());
        shared.listeners.len()
    }

    pub fn close(&self) {
        let mut shared = self.lock();
        shared.closed = true;
        shared.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Forgets the replay value. Listeners already subscribed keep what they were sent.
    pub fn clear_latest(&self) {
        self.lock().latest = None;
    }

    /// Resolves once no listener is left.
    pub async fn idle(&self) {
        loop {
            let listeners = {
                let mut shared = self.lock();
                shared.listeners.retain(|listener| !listener.is_closed());
                shared.listeners.clone()
            };
            if listeners.is_empty() {
                return;
            }
            join_all(listeners.iter().map(|listener| listener.closed())).await;
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Multicast<T> {
    /// Publishes only when `value` differs from the latest one.
    pub fn publish_if_changed(&self, value: T) -> bool {
        if self.lock().latest.as_ref() == Some(&value) {
            return false;
        }
        self.publish(value);
        true
    }
}

/// Raises a boolean flag for as long as it lives, including when the owning future is dropped.
pub(crate) struct FlagGuard<'a> {
    flag: &'a Multicast<bool>,
}

impl<'a> FlagGuard<'a> {
    pub(crate) fn raise(flag: &'a Multicast<bool>) -> Self {
        flag.publish_if_changed(true);
        Self { flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.publish_if_changed(false);
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drains everything queued so far and returns the newest value.
    pub fn latest_queued(&mut self) -> Option<T> {
        let mut newest = None;
        while let Ok(value) = self.rx.try_recv() {
            newest = Some(value);
        }
        newest
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
