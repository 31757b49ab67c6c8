//! Change Notification
//!
//! Each storage utility instance owns one [`ChangeNotifier`]. Mutations
//! publish a [`ChangeEvent`] to every live [`Subscription`].
//!
//! ## Delivery
//!
//! - A new subscriber first receives the most recently published event (if
//!   any), then every later event, in order.
//! - Publishing is synchronous: the event is queued on every subscriber's
//!   channel before the mutating call returns. Nothing is coalesced.
//! - Dropped subscriptions are pruned on the next publish.
//!
//! ```text
//!   publish(e1)          subscribe()           publish(e2)
//!  ─────────────> last=e1 ──────────> [e1] ───────────────> [e1, e2]
//! ```

use crate::settings::StorageKind;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// A single store mutation as seen by subscribers.
///
/// Values are the raw stored JSON, envelope included when the item carries
/// a TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// The store that was mutated.
    pub storage: StorageKind,
    /// The stored value before the mutation.
    pub old_value: Option<Value>,
    /// The stored value after the mutation. `None` for removals.
    pub new_value: Option<Value>,
}

#[derive(Debug, Default)]
struct Inner {
    last: Option<ChangeEvent>,
    subscribers: Vec<UnboundedSender<ChangeEvent>>,
}

/// Fan-out of change events with replay of the last event.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    inner: Mutex<Inner>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. The last published event is queued first.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = &inner.last {
            // The receiver is alive, the send cannot fail
            let _ = tx.send(last.clone());
        }
        inner.subscribers.push(tx);

        Subscription { rx }
    }

    /// Records `event` as the latest and delivers it to every subscriber.
    pub fn publish(&self, event: ChangeEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(
            storage = %event.storage,
            subscribers = inner.subscribers.len(),
            "Published change event"
        );
        inner.last = Some(event);
    }

    /// Returns the most recently published event.
    pub fn last(&self) -> Option<ChangeEvent> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.last.clone()
    }

    /// Returns the number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }
}

/// The receiving end of a change subscription.
///
/// Usable synchronously through [`Subscription::try_next`] or asynchronously
/// through [`Subscription::next_event`] and the [`Stream`] impl.
#[derive(Debug)]
pub struct Subscription {
    rx: UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    /// Returns the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits for the next event. Returns `None` once the notifier is gone.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Drains every event queued so far.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
