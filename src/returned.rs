//! Return-kind wrappers for read results.

use crate::settings::ReturnKind;
use futures::future::{self, Ready};
use futures::stream::{self, Once};

/// A read result handed back in the requested [`ReturnKind`].
///
/// The wrapped value is always computed before the wrapper is built, so the
/// deferred forms resolve on their first poll.
#[derive(Debug)]
pub enum Returned<V> {
    Direct(V),
    Deferred(Ready<V>),
    Stream(Once<Ready<V>>),
}

impl<V> Returned<V> {
    /// Wraps `value` in the given kind.
    pub fn wrap(value: V, kind: ReturnKind) -> Self {
        match kind {
            ReturnKind::Direct => Returned::Direct(value),
            ReturnKind::Deferred => Returned::Deferred(future::ready(value)),
            ReturnKind::Stream => Returned::Stream(stream::once(future::ready(value))),
        }
    }

    /// The kind this value was wrapped in.
    pub fn kind(&self) -> ReturnKind {
        match self {
            Returned::Direct(_) => ReturnKind::Direct,
            Returned::Deferred(_) => ReturnKind::Deferred,
            Returned::Stream(_) => ReturnKind::Stream,
        }
    }

    /// Returns the plain value if this is [`Returned::Direct`].
    pub fn into_direct(self) -> Option<V> {
        match self {
            Returned::Direct(value) => Some(value),
            _ => None,
        }
    }

    /// Resolves to the value regardless of kind.
    pub async fn resolve(self) -> V {
        use futures::StreamExt;

        match self {
            Returned::Direct(value) => value,
            Returned::Deferred(fut) => fut.await,
            Returned::Stream(mut once) => match once.next().await {
                Some(value) => value,
                // A Once stream always yields before ending
                None => unreachable!("once stream ended without a value"),
            },
        }
    }
}
