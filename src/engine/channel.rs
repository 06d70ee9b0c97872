// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::engine::TimerRegistry;
use crate::error::PodiumErr;
use crate::ledger::{Ledger, Subscription, SubscriptionHandle};
use crate::primitives::{LedgerAddress, Record};
use futures::channel::mpsc;
use futures::StreamExt;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub type DataCallback = Arc<dyn Fn(Record) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(PodiumErr) + Send + Sync>;

/// Stream error of a channel that had no error handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFault {
    pub address: LedgerAddress,
    pub error: PodiumErr,
}

impl fmt::Display for ChannelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled fault on channel {}: {}", self.address, self.error)
    }
}

/// Durable subscription to the new records of one address.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    address: LedgerAddress,
    lifetime: Option<Duration>,
    subscription: SubscriptionHandle,
    closed: AtomicBool,
}

impl Channel {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn address(&self) -> &LedgerAddress {
        &self.inner.address
    }

    /// Inactivity after which the channel closes itself
    #[must_use]
    pub fn lifetime(&self) -> Option<Duration> {
        self.inner.lifetime
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscription.unsubscribe();
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("open", &self.is_open())
            .finish()
    }
}

struct ChannelEntry {
    channel: Channel,
    task: JoinHandle<()>,
}

/// Process wide table of open channels, at most one per address.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ledger: Arc<dyn Ledger>,
    app_id: String,
    channels: Mutex<HashMap<LedgerAddress, ChannelEntry>>,
    timers: TimerRegistry<LedgerAddress>,
    faults: Mutex<Option<mpsc::UnboundedSender<ChannelFault>>>,
    next_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(ledger: Arc<dyn Ledger>, app_id: &str) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ledger,
                app_id: app_id.to_owned(),
                channels: Mutex::new(HashMap::new()),
                timers: TimerRegistry::new(),
                faults: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Opens a channel to `address`, or returns the one already open.
    ///
    /// `on_data` receives every non placeholder record, starting with the
    /// current history of the address. Without `on_error`, a stream error
    /// closes the channel and is escalated as a [`ChannelFault`]. A non zero
    /// `lifetime` closes the channel after that much inactivity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_channel<F>(
        &self,
        address: &LedgerAddress,
        on_data: F,
        on_error: Option<ErrorCallback>,
        lifetime: Option<Duration>,
    ) -> Channel
    where
        F: Fn(Record) + Send + Sync + 'static,
    {
        let lifetime = lifetime.filter(|l| !l.is_zero());

        if let Some(channel) = self.get(address) {
            return channel;
        }

        // Subscribe outside the table lock, then settle races on insert
        let subscription = self.inner.ledger.subscribe(address, &self.inner.app_id);
        let mut channels = self.inner.channels.lock();

        if let Some(existing) = channels.get(address).map(|e| e.channel.clone()) {
            drop(channels);
            debug!("Channel to {} opened concurrently. Dropping duplicate.", address);
            subscription.unsubscribe();
            return existing;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id,
                address: *address,
                lifetime,
                subscription: subscription.handle(),
                closed: AtomicBool::new(false),
            }),
        };

        if let Some(lifetime) = lifetime {
            let manager = Arc::downgrade(&self.inner);
            let address = *address;

            self.inner.timers.start(address, lifetime, move || {
                if let Some(inner) = manager.upgrade() {
                    debug!("Channel {} inactive. Closing.", address);
                    ChannelManager { inner }.close_if_id(&address, id);
                }
            });
        }

        let task = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            self.inner.ledger.clone(),
            channel.clone(),
            subscription,
            Arc::new(on_data),
            on_error,
        ));

        channels.insert(
            *address,
            ChannelEntry {
                channel: channel.clone(),
                task,
            },
        );
        drop(channels);

        debug!("Opened channel {} to {}", id, address);
        channel
    }

    /// Closes the channel of `address`. Does nothing if there is none.
    pub fn close_channel(&self, address: &LedgerAddress) {
        let entry = {
            let mut channels = self.inner.channels.lock();
            let entry = channels.remove(address);

            if entry.is_some() {
                self.inner.timers.stop(address);
            }

            entry
        };

        if let Some(entry) = entry {
            release(entry);
        }
    }

    /// Closes every tracked channel.
    pub fn close_all_channels(&self) {
        let entries: Vec<_> = {
            let mut channels = self.inner.channels.lock();
            let entries: Vec<_> = channels.drain().collect();

            for (address, _) in &entries {
                self.inner.timers.stop(address);
            }

            entries
        };

        for (_, entry) in entries {
            release(entry);
        }
    }

    /// Closes every channel and cancels every pending timer.
    pub fn clean_up(&self) {
        self.close_all_channels();
        self.inner.timers.stop_all();
    }

    #[must_use]
    pub fn get(&self, address: &LedgerAddress) -> Option<Channel> {
        self.inner
            .channels
            .lock()
            .get(address)
            .map(|e| e.channel.clone())
    }

    #[must_use]
    pub fn is_open(&self, address: &LedgerAddress) -> bool {
        self.inner.channels.lock().contains_key(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.channels.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn timers(&self) -> &TimerRegistry<LedgerAddress> {
        &self.inner.timers
    }

    /// Stream of unhandled channel faults. Only the first caller receives it.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ChannelFault>> {
        let mut faults = self.inner.faults.lock();

        if faults.is_some() {
            return None;
        }

        let (sender, receiver) = mpsc::unbounded();
        *faults = Some(sender);
        Some(receiver)
    }

    /// Closes the channel of `address` only if it is still channel `id`.
    fn close_if_id(&self, address: &LedgerAddress, id: u64) {
        let entry = {
            let mut channels = self.inner.channels.lock();

            match channels.get(address) {
                Some(entry) if entry.channel.id() == id => {}
                _ => return,
            }

            self.inner.timers.stop(address);
            channels.remove(address)
        };

        if let Some(entry) = entry {
            release(entry);
        }
    }

    fn escalate(&self, fault: ChannelFault) {
        error!("{}", fault);
        let faults = self.inner.faults.lock();

        if let Some(sender) = faults.as_ref() {
            let _ = sender.unbounded_send(fault);
        }
    }
}

fn release(entry: ChannelEntry) {
    debug!("Closing channel {}", entry.channel.address());
    entry.channel.close();
    entry.task.abort();
}

/// Drives one channel until its stream ends or the channel is closed.
async fn pump(
    manager: Weak<ManagerInner>,
    ledger: Arc<dyn Ledger>,
    channel: Channel,
    mut subscription: Subscription,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
) {
    let address = *channel.address();

    if let Err(err) = ledger.open_node_connection(&address).await {
        warn!("Could not open node connection for {}: {}", address, err);
    }

    while let Some(item) = subscription.next().await {
        if !channel.is_open() {
            return;
        }

        let Some(inner) = manager.upgrade() else {
            return;
        };
        let owner = ChannelManager { inner };

        match item {
            Ok(item) => {
                if channel.lifetime().is_some() {
                    owner.inner.timers.reset(&address);
                }

                match Record::from_item(&item) {
                    Ok(record) => {
                        debug!("Received item on channel {}: {:?}", address, record.fields);

                        if !record.is_placeholder() {
                            on_data(record);
                        }
                    }
                    Err(err) => warn!("Skipping malformed record on {}: {}", address, err),
                }
            }
            Err(err) => {
                let error = PodiumErr::Stream(err);

                match &on_error {
                    Some(on_error) => on_error(error),
                    None => {
                        owner.close_if_id(&address, channel.id());
                        owner.escalate(ChannelFault { address, error });
                        return;
                    }
                }
            }
        }
    }

    if let Some(inner) = manager.upgrade() {
        debug!("Stream of channel {} ended", address);
        ChannelManager { inner }.close_if_id(&address, channel.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerErr, MemoryLedger, SubmissionProgress};
    use crate::primitives::Transaction;
    use async_trait::async_trait;
    use quickcheck::quickcheck;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::time::{sleep, Instant};

    const APP: &str = "podium-test";

    type SubscribeHook = Box<dyn FnOnce() + Send>;

    /// Ledger running a one shot hook before its next subscription.
    #[derive(Default)]
    struct HookedLedger {
        inner: MemoryLedger,
        hook: Mutex<Option<SubscribeHook>>,
    }

    impl HookedLedger {
        fn set_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
            *self.hook.lock() = Some(Box::new(hook));
        }
    }

    #[async_trait]
    impl Ledger for HookedLedger {
        async fn open_node_connection(&self, address: &LedgerAddress) -> Result<(), LedgerErr> {
            self.inner.open_node_connection(address).await
        }

        fn subscribe(&self, address: &LedgerAddress, app_id: &str) -> Subscription {
            let hook = self.hook.lock().take();

            if let Some(hook) = hook {
                hook();
            }

            self.inner.subscribe(address, app_id)
        }

        fn submit_transaction(&self, tx: Transaction) -> SubmissionProgress {
            self.inner.submit_transaction(tx)
        }
    }

    fn manager() -> (MemoryLedger, ChannelManager) {
        let ledger = MemoryLedger::new();
        let manager = ChannelManager::new(Arc::new(ledger.clone()), APP);
        (ledger, manager)
    }

    fn collector() -> (
        mpsc::UnboundedReceiver<Record>,
        impl Fn(Record) + Send + Sync + 'static,
    ) {
        let (sender, receiver) = mpsc::unbounded();
        (receiver, move |record| {
            let _ = sender.unbounded_send(record);
        })
    }

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_address_shares_one_channel() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");

        let first = manager.open_channel(&address, |_| {}, None, None);
        let second = manager.open_channel(&address, |_| {}, None, None);

        assert_eq!(first, second);
        assert_eq!(first.id(), second.id());
        assert_eq!(ledger.subscribe_calls(), 1);
        assert_eq!(ledger.active_subscriptions(&address), 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_records_but_never_placeholders() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        ledger.insert(&address, APP, &crate::primitives::placeholder_payload());
        ledger.insert(&address, APP, &json!({"n": 1}));

        let (mut received, on_data) = collector();
        manager.open_channel(&address, on_data, None, None);
        ledger.insert(&address, APP, &crate::primitives::placeholder_payload());
        ledger.insert(&address, APP, &json!({"n": 2}));
        settle().await;

        assert_eq!(received.next().await.unwrap().get("n"), Some(&json!(1)));
        assert_eq!(received.next().await.unwrap().get("n"), Some(&json!(2)));
        assert!(received.try_next().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_twice_is_a_no_op() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        let channel = manager.open_channel(&address, |_| {}, None, Some(Duration::from_secs(5)));

        manager.close_channel(&address);
        manager.close_channel(&address);

        assert!(!channel.is_open());
        assert!(!manager.is_open(&address));
        assert!(!manager.timers().is_active(&address));
        assert_eq!(ledger.active_subscriptions(&address), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_creates_a_fresh_channel() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        let first = manager.open_channel(&address, |_| {}, None, None);
        manager.close_channel(&address);
        let second = manager.open_channel(&address, |_| {}, None, None);

        assert_ne!(first, second);
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(ledger.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_closes_channel() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        let channel = manager.open_channel(&address, |_| {}, None, Some(Duration::from_secs(10)));

        sleep(Duration::from_secs(6)).await;
        ledger.insert(&address, APP, &json!({"n": 1}));
        sleep(Duration::from_secs(6)).await;
        assert!(channel.is_open());
        assert!(manager.is_open(&address));

        sleep(Duration::from_secs(5)).await;
        assert!(!channel.is_open());
        assert!(!manager.is_open(&address));
        assert_eq!(ledger.active_subscriptions(&address), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_lifetime_never_expires() {
        let (_, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        manager.open_channel(&address, |_| {}, None, Some(Duration::ZERO));

        sleep(Duration::from_secs(3600)).await;
        assert!(manager.is_open(&address));
        assert!(manager.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_error_closes_and_escalates() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        let mut faults = manager.take_faults().unwrap();
        assert!(manager.take_faults().is_none());

        let channel = manager.open_channel(&address, |_| {}, None, Some(Duration::from_secs(30)));
        settle().await;
        ledger.inject_stream_error(&address, LedgerErr::Stream("reset".to_owned()));

        let fault = faults.next().await.unwrap();
        assert_eq!(fault.address, address);
        assert_eq!(
            fault.error,
            PodiumErr::Stream(LedgerErr::Stream("reset".to_owned()))
        );
        assert!(!channel.is_open());
        assert!(!manager.is_open(&address));
        assert!(!manager.timers().is_active(&address));
    }

    #[tokio::test(start_paused = true)]
    async fn handled_error_keeps_channel_open() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        let (sender, mut errors) = mpsc::unbounded();
        let on_error: ErrorCallback = Arc::new(move |err| {
            let _ = sender.unbounded_send(err);
        });

        manager.open_channel(&address, |_| {}, Some(on_error), None);
        settle().await;
        ledger.inject_stream_error(&address, LedgerErr::Stream("reset".to_owned()));

        assert!(matches!(errors.next().await, Some(PodiumErr::Stream(_))));
        assert!(manager.is_open(&address));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_closes_channel() {
        let (ledger, manager) = manager();
        let address = LedgerAddress::from_seed("a");
        manager.open_channel(&address, |_| {}, None, None);
        settle().await;

        ledger.close_streams(&address);
        settle().await;
        assert!(!manager.is_open(&address));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_up_closes_everything() {
        let (ledger, manager) = manager();
        let addresses: Vec<_> = (0..4)
            .map(|n| LedgerAddress::from_seed(&n.to_string()))
            .collect();

        for address in &addresses {
            manager.open_channel(address, |_| {}, None, Some(Duration::from_secs(5)));
        }
        assert_eq!(manager.len(), 4);
        assert_eq!(manager.timers().len(), 4);

        manager.clean_up();
        assert!(manager.is_empty());
        assert!(manager.timers().is_empty());

        for address in &addresses {
            assert_eq!(ledger.active_subscriptions(address), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_outside_the_table_lock() {
        let ledger = Arc::new(HookedLedger::default());
        let manager = ChannelManager::new(ledger.clone(), APP);
        let address = LedgerAddress::from_seed("a");
        let unlocked = Arc::new(AtomicBool::new(false));

        let (observer, flag) = (manager.clone(), unlocked.clone());
        ledger.set_hook(move || {
            let free = observer.inner.channels.try_lock().is_some();
            flag.store(free, Ordering::SeqCst);
        });

        manager.open_channel(&address, |_| {}, None, None);
        assert!(unlocked.load(Ordering::SeqCst));
        assert!(manager.is_open(&address));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_open_keeps_single_subscription() {
        let ledger = Arc::new(HookedLedger::default());
        let manager = ChannelManager::new(ledger.clone(), APP);
        let address = LedgerAddress::from_seed("a");
        let opened_first: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));

        // Another caller wins the race while this one is subscribing
        let (rival, slot) = (manager.clone(), opened_first.clone());
        ledger.set_hook(move || {
            *slot.lock() = Some(rival.open_channel(&address, |_| {}, None, None));
        });

        let channel = manager.open_channel(&address, |_| {}, None, None);
        let winner = opened_first.lock().clone().unwrap();

        assert_eq!(channel, winner);
        assert!(channel.is_open());
        assert_eq!(manager.len(), 1);
        assert_eq!(ledger.inner.subscribe_calls(), 2);
        assert_eq!(ledger.inner.active_subscriptions(&address), 1);
    }

    quickcheck! {
        fn operations_on_one_address_never_disturb_another(ops: Vec<(u8, u8)>) -> bool {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async move {
                let (ledger, manager) = manager();
                let addresses: Vec<_> = (0..4u8)
                    .map(|n| LedgerAddress::from_seed(&format!("addr-{n}")))
                    .collect();

                // Open addresses with their expiry instant, if any
                let mut model: HashMap<usize, Option<Instant>> = HashMap::new();
                let mut handles: HashMap<usize, Channel> = HashMap::new();

                for (slot, op) in ops {
                    let slot = usize::from(slot % 4);
                    let address = &addresses[slot];

                    match op % 4 {
                        0 | 1 => {
                            // Half second offsets keep expiries off the one second steps
                            let lifetime = (op % 4 == 1)
                                .then(|| Duration::from_millis(slot as u64 * 1000 + 1500));
                            let channel = manager.open_channel(address, |_| {}, None, lifetime);

                            if !model.contains_key(&slot) {
                                model.insert(slot, lifetime.map(|l| Instant::now() + l));
                                handles.insert(slot, channel.clone());
                            }

                            if handles.get(&slot) != Some(&channel) {
                                return false;
                            }
                        }
                        2 => {
                            manager.close_channel(address);
                            model.remove(&slot);
                        }
                        _ => {
                            sleep(Duration::from_secs(1)).await;
                            let now = Instant::now();
                            model.retain(|_, expiry| expiry.map_or(true, |e| e > now));
                        }
                    }

                    let open: HashSet<usize> = model.keys().copied().collect();

                    for (n, address) in addresses.iter().enumerate() {
                        let expected = open.contains(&n);

                        if manager.is_open(address) != expected
                            || ledger.active_subscriptions(address) != usize::from(expected)
                        {
                            return false;
                        }

                        if let Some(channel) = handles.get(&n) {
                            if expected && !channel.is_open() {
                                return false;
                            }
                        }
                    }
                }

                true
            })
        }
    }
}
