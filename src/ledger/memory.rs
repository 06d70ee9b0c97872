// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::ledger::{
    Ledger, LedgerErr, LedgerItem, SubmissionProgress, SubmissionStatus, Subscription,
};
use crate::primitives::{LedgerAddress, Transaction};
use async_trait::async_trait;
use chrono::prelude::*;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type ItemSender = mpsc::UnboundedSender<Result<LedgerItem, LedgerErr>>;

/// In-process ledger. Keeps every address history in memory and fans new
/// entries out to live subscribers.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_subscriber_id: AtomicU64,
    connection_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    submit_calls: AtomicUsize,
}

#[derive(Default)]
struct State {
    entries: HashMap<LedgerAddress, Vec<Entry>>,
    subscribers: HashMap<LedgerAddress, Vec<Subscriber>>,
    last_timestamp: i64,
    failing_connections: usize,
    failing_submissions: usize,
}

struct Entry {
    app_id: String,
    item: LedgerItem,
}

struct Subscriber {
    id: u64,
    app_id: String,
    sender: ItemSender,
}

impl State {
    /// Appends an entry and pushes it to every matching live subscriber.
    fn append(&mut self, address: LedgerAddress, app_id: &str, item: LedgerItem) {
        if let Some(subscribers) = self.subscribers.get_mut(&address) {
            subscribers.retain(|s| {
                if s.app_id != app_id {
                    return true;
                }

                s.sender.unbounded_send(Ok(item.clone())).is_ok()
            });
        }

        self.entries.entry(address).or_default().push(Entry {
            app_id: app_id.to_owned(),
            item,
        });
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        timestamp
    }
}

impl Inner {
    fn store(&self, tx: &Transaction) -> Result<SubmissionStatus, LedgerErr> {
        let mut state = self.state.lock();

        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(LedgerErr::Rejected("node refused transaction".to_owned()));
        }

        let timestamp = state.next_timestamp();
        let mut seen = Vec::with_capacity(tx.addresses().len());

        for address in tx.addresses() {
            if seen.contains(address) {
                continue;
            }
            seen.push(*address);

            state.append(
                *address,
                tx.app_id(),
                LedgerItem {
                    payload: tx.payload().to_vec(),
                    timestamp,
                },
            );
        }

        Ok(SubmissionStatus::Stored { timestamp })
    }

    fn unsubscribe(&self, address: &LedgerAddress, id: u64) {
        let mut state = self.state.lock();

        if let Some(subscribers) = state.subscribers.get_mut(address) {
            subscribers.retain(|s| s.id != id);

            if subscribers.is_empty() {
                state.subscribers.remove(address);
            }
        }
    }
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw entry with an explicit ledger timestamp.
    pub fn insert_at(
        &self,
        address: &LedgerAddress,
        app_id: &str,
        payload: &serde_json::Value,
        timestamp: i64,
    ) {
        let payload = payload.to_string().into_bytes();
        let mut state = self.inner.state.lock();
        state.last_timestamp = state.last_timestamp.max(timestamp);
        state.append(*address, app_id, LedgerItem { payload, timestamp });
    }

    /// Appends a raw entry stamped with the next ledger timestamp.
    pub fn insert(&self, address: &LedgerAddress, app_id: &str, payload: &serde_json::Value) {
        let payload = payload.to_string().into_bytes();
        let mut state = self.inner.state.lock();
        let timestamp = state.next_timestamp();
        state.append(*address, app_id, LedgerItem { payload, timestamp });
    }

    /// Appends raw bytes that may not be a valid record.
    pub fn insert_raw(&self, address: &LedgerAddress, app_id: &str, payload: Vec<u8>) {
        let mut state = self.inner.state.lock();
        let timestamp = state.next_timestamp();
        state.append(*address, app_id, LedgerItem { payload, timestamp });
    }

    /// Pushes a stream fault to every live subscriber of the address.
    pub fn inject_stream_error(&self, address: &LedgerAddress, err: LedgerErr) {
        let mut state = self.inner.state.lock();

        if let Some(subscribers) = state.subscribers.get_mut(address) {
            subscribers.retain(|s| s.sender.unbounded_send(Err(err.clone())).is_ok());
        }
    }

    /// Terminates every live stream of the address.
    pub fn close_streams(&self, address: &LedgerAddress) {
        self.inner.state.lock().subscribers.remove(address);
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connections(&self, count: usize) {
        self.inner.state.lock().failing_connections = count;
    }

    /// The next `count` submissions are rejected.
    pub fn fail_next_submissions(&self, count: usize) {
        self.inner.state.lock().failing_submissions = count;
    }

    /// Stored items at the address, in ledger order
    #[must_use]
    pub fn items(&self, address: &LedgerAddress) -> Vec<LedgerItem> {
        self.inner
            .state
            .lock()
            .entries
            .get(address)
            .map(|entries| entries.iter().map(|e| e.item.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_subscriptions(&self, address: &LedgerAddress) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .get(address)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn connection_calls(&self) -> usize {
        self.inner.connection_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn submit_calls(&self) -> usize {
        self.inner.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn open_node_connection(&self, address: &LedgerAddress) -> Result<(), LedgerErr> {
        self.inner.connection_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock();

        if state.failing_connections > 0 {
            state.failing_connections -= 1;
            return Err(LedgerErr::Unreachable(format!("no node serving {address}")));
        }

        Ok(())
    }

    fn subscribe(&self, address: &LedgerAddress, app_id: &str) -> Subscription {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded();

        {
            let mut state = self.inner.state.lock();

            // Replay history first so the subscriber observes it before live entries
            if let Some(entries) = state.entries.get(address) {
                for entry in entries.iter().filter(|e| e.app_id == app_id) {
                    let _ = sender.unbounded_send(Ok(entry.item.clone()));
                }
            }

            state
                .subscribers
                .entry(*address)
                .or_default()
                .push(Subscriber {
                    id,
                    app_id: app_id.to_owned(),
                    sender,
                });
        }

        debug!("Subscribed {} to {}", id, address);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let address = *address;

        Subscription::new(receiver.boxed(), move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe(&address, id);
            }
        })
    }

    fn submit_transaction(&self, tx: Transaction) -> SubmissionProgress {
        self.inner.submit_calls.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = tx.verify() {
            return stream::iter(vec![Err(LedgerErr::Validation(err))]).boxed();
        }

        let inner = self.inner.clone();
        let stored = async move { inner.store(&tx) };

        stream::iter(vec![Ok(SubmissionStatus::Submitted)])
            .chain(stream::once(stored))
            .boxed()
    }
}
