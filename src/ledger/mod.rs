// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Hash256, LedgerAddress, Transaction, TxVerifyErr};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub mod memory;

pub use memory::MemoryLedger;

/// Raw entry as delivered by the ledger's application data stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerItem {
    /// Serialized record payload
    pub payload: Vec<u8>,

    /// Ledger assigned timestamp in milliseconds
    pub timestamp: i64,
}

/// Progress of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubmissionStatus {
    /// Transaction handed to a node
    Submitted,

    /// Transaction stored by the ledger at the given timestamp
    Stored { timestamp: i64 },
}

/// Receipt for a transaction the ledger accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confirmation {
    pub hash: Hash256,
    pub stored_at: Option<i64>,
}

pub type SubmissionProgress = BoxStream<'static, Result<SubmissionStatus, LedgerErr>>;

/// Interface to the underlying ledger network.
///
/// The application data stream of an address replays its history and then
/// follows new entries. It never signals that it has caught up.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Opens a node connection serving the given address.
    async fn open_node_connection(&self, address: &LedgerAddress) -> Result<(), LedgerErr>;

    /// Subscribes to the application data stream of the given address.
    fn subscribe(&self, address: &LedgerAddress, app_id: &str) -> Subscription;

    /// Submits a signed transaction. The returned progress stream completes
    /// once the ledger confirms receipt, or yields an error.
    fn submit_transaction(&self, tx: Transaction) -> SubmissionProgress;
}

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Cloneable handle able to cancel a subscription from outside its consumer.
#[derive(Clone)]
pub struct SubscriptionHandle {
    unsubscribe: Arc<Mutex<Option<UnsubscribeFn>>>,
}

impl SubscriptionHandle {
    /// Cancels the subscription. Subsequent calls do nothing.
    pub fn unsubscribe(&self) {
        let unsubscribe = self.unsubscribe.lock().take();

        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.unsubscribe.lock().is_some()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Live stream of ledger items for one address. Dropping it unsubscribes.
pub struct Subscription {
    stream: BoxStream<'static, Result<LedgerItem, LedgerErr>>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new<F>(stream: BoxStream<'static, Result<LedgerItem, LedgerErr>>, on_unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            stream,
            handle: SubscriptionHandle {
                unsubscribe: Arc::new(Mutex::new(Some(Box::new(on_unsubscribe)))),
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Result<LedgerItem, LedgerErr>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.handle.is_active() {
            return Poll::Ready(None);
        }

        self.stream.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerErr {
    /// No node could be reached
    Unreachable(String),

    /// Transaction failed validation
    Validation(TxVerifyErr),

    /// Transaction rejected by the network
    Rejected(String),

    /// Fault on a live subscription
    Stream(String),
}

impl From<TxVerifyErr> for LedgerErr {
    fn from(other: TxVerifyErr) -> Self {
        Self::Validation(other)
    }
}

impl fmt::Display for LedgerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "ledger unreachable: {reason}"),
            Self::Validation(err) => write!(f, "invalid transaction: {err:?}"),
            Self::Rejected(reason) => write!(f, "transaction rejected: {reason}"),
            Self::Stream(reason) => write!(f, "stream fault: {reason}"),
        }
    }
}
