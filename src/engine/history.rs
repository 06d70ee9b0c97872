// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::engine::timer::deadline_after;
use crate::error::PodiumErr;
use crate::ledger::{Ledger, LedgerItem};
use crate::primitives::{LedgerAddress, Record};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(1);

/// Reconstructs the record set of an address from its live data stream.
///
/// The ledger never signals that a stream has caught up, so a read is
/// considered complete after `quiet_period` without new items. An address
/// that stays silent for that long and is written to later resolves early
/// and misses the later entries.
#[derive(Clone)]
pub struct HistoryAggregator {
    ledger: Arc<dyn Ledger>,
    app_id: String,
    quiet_period: Duration,
}

/// Accumulated state of one history read.
#[derive(Default)]
struct HistorySession {
    records: Vec<Record>,
    received: bool,
}

impl HistorySession {
    fn push(&mut self, item: &LedgerItem) {
        debug!("Received item: {}", String::from_utf8_lossy(&item.payload));
        self.received = true;

        match Record::from_item(item) {
            Ok(record) if record.is_placeholder() => {}
            Ok(record) => self.records.push(record),
            Err(err) => warn!("Skipping malformed record: {}", err),
        }
    }

    fn into_sorted(mut self) -> Vec<Record> {
        self.records.sort_by_key(|r| r.created_at);
        self.records
    }

    /// Outcome when the session ends without a quiet period.
    fn expire(self) -> Result<Vec<Record>, PodiumErr> {
        if self.received {
            debug!("Timed out. Resolving with current history.");
            Ok(self.into_sorted())
        } else {
            debug!("Timed out. No history received.");
            Err(PodiumErr::Timeout)
        }
    }
}

impl HistoryAggregator {
    pub fn new(ledger: Arc<dyn Ledger>, app_id: &str) -> Self {
        Self {
            ledger,
            app_id: app_id.to_owned(),
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }

    #[must_use]
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Every record currently stored at `address`, ascending by creation time.
    ///
    /// `timeout` bounds the read. With `None` or a zero duration the read only
    /// ends through the quiet period, the stream ending, or a stream error.
    pub async fn get_history(
        &self,
        address: &LedgerAddress,
        timeout: Option<Duration>,
    ) -> Result<Vec<Record>, PodiumErr> {
        let timeout = timeout.filter(|t| !t.is_zero());
        debug!("Fetching history of {} (timeout: {:?})", address, timeout);

        let mut connection = self.ledger.open_node_connection(address);
        let mut connecting = true;
        let mut subscription = self.ledger.subscribe(address, &self.app_id);
        let mut session = HistorySession::default();

        let deadline = sleep(timeout.unwrap_or_default());
        let quiet = sleep(self.quiet_period);
        tokio::pin!(deadline, quiet);
        let mut quiet_armed = false;

        let outcome = loop {
            tokio::select! {
                result = &mut connection, if connecting => {
                    connecting = false;

                    if let Err(err) = result {
                        warn!("Could not open node connection for {}: {}", address, err);

                        // Connection latency must not be mistaken for an empty address
                        if let Some(timeout) = timeout {
                            deadline.as_mut().reset(deadline_after(timeout));
                        }
                    }
                }
                item = subscription.next() => match item {
                    Some(Ok(item)) => {
                        session.push(&item);
                        quiet.as_mut().reset(deadline_after(self.quiet_period));
                        quiet_armed = true;
                    }
                    Some(Err(err)) => break Err(PodiumErr::Stream(err)),
                    None => break session.expire(),
                },
                () = &mut quiet, if quiet_armed => {
                    debug!("No record received for {:?}. Resolving early.", self.quiet_period);
                    break Ok(session.into_sorted());
                }
                () = &mut deadline, if timeout.is_some() => break session.expire(),
            }
        };

        subscription.unsubscribe();
        outcome
    }

    /// Most recent record at `address`, `None` if it holds only placeholders.
    pub async fn get_latest(
        &self,
        address: &LedgerAddress,
        timeout: Option<Duration>,
    ) -> Result<Option<Record>, PodiumErr> {
        let history = self.get_history(address, timeout).await?;
        Ok(history.into_iter().max_by_key(|r| r.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerErr, MemoryLedger, SubmissionProgress, Subscription};
    use crate::primitives::Transaction;
    use async_trait::async_trait;
    use quickcheck::quickcheck;
    use serde_json::json;
    use tokio::time::Instant;

    const APP: &str = "podium-test";

    fn aggregator() -> (MemoryLedger, HistoryAggregator) {
        let ledger = MemoryLedger::new();
        let aggregator = HistoryAggregator::new(Arc::new(ledger.clone()), APP);
        (ledger, aggregator)
    }

    /// Ledger whose node connections fail after a delay.
    struct SlowConnectionLedger {
        inner: MemoryLedger,
        delay: Duration,
    }

    #[async_trait]
    impl Ledger for SlowConnectionLedger {
        async fn open_node_connection(&self, _address: &LedgerAddress) -> Result<(), LedgerErr> {
            sleep(self.delay).await;
            Err(LedgerErr::Unreachable("node offline".to_owned()))
        }

        fn subscribe(&self, address: &LedgerAddress, app_id: &str) -> Subscription {
            self.inner.subscribe(address, app_id)
        }

        fn submit_transaction(&self, tx: Transaction) -> SubmissionProgress {
            self.inner.submit_transaction(tx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_address_times_out_at_deadline() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("empty");
        let start = Instant::now();

        let result = aggregator
            .get_history(&address, Some(Duration::from_secs(5)))
            .await;

        assert_eq!(result, Err(PodiumErr::Timeout));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(ledger.active_subscriptions(&address), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_record_resolves_after_quiet_period() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("one");
        ledger.insert(&address, APP, &json!({"record": "profile", "id": "alice"}));
        let start = Instant::now();

        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].get_str("id"), Some("alice"));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_is_configurable() {
        let (ledger, aggregator) = aggregator();
        let aggregator = aggregator.with_quiet_period(Duration::from_millis(200));
        let address = LedgerAddress::from_seed("one");
        ledger.insert(&address, APP, &json!({"n": 1}));
        let start = Instant::now();

        let history = aggregator.get_history(&address, None).await.unwrap();

        assert_eq!(history.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn placeholders_count_as_received_but_are_hidden() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("posts");
        ledger.insert(&address, APP, &crate::primitives::placeholder_payload());

        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(history.is_empty());

        let latest = aggregator
            .get_latest(&address, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_are_skipped() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("mixed");
        ledger.insert_raw(&address, APP, b"not json".to_vec());
        ledger.insert(&address, APP, &json!({"n": 1}));

        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_is_greatest_creation_time() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("latest");
        ledger.insert_at(&address, APP, &json!({"n": 2}), 200);
        ledger.insert_at(&address, APP, &json!({"n": 3}), 300);
        ledger.insert_at(&address, APP, &json!({"n": 1}), 100);

        let latest = aggregator
            .get_latest(&address, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.created_at, 300);
        assert_eq!(latest.get("n"), Some(&json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_rejects() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("faulty");
        let ledger_clone = ledger.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            ledger_clone.inject_stream_error(&address, LedgerErr::Stream("reset".to_owned()));
        });

        let result = aggregator
            .get_history(&address, Some(Duration::from_secs(5)))
            .await;
        assert_eq!(
            result,
            Err(PodiumErr::Stream(LedgerErr::Stream("reset".to_owned())))
        );
        assert_eq!(ledger.active_subscriptions(&address), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_without_records_times_out() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("closed");
        let ledger_clone = ledger.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            ledger_clone.close_streams(&address);
        });

        let result = aggregator.get_history(&address, None).await;
        assert_eq!(result, Err(PodiumErr::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_resolves_at_deadline() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("busy");
        let ledger_clone = ledger.clone();

        tokio::spawn(async move {
            for n in 0..10 {
                ledger_clone.insert(&address, APP, &json!({ "n": n }));
                sleep(Duration::from_millis(500)).await;
            }
        });

        let start = Instant::now();
        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2500));
        assert!(history.len() >= 4);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connection_extends_deadline_once() {
        let ledger = SlowConnectionLedger {
            inner: MemoryLedger::new(),
            delay: Duration::from_secs(2),
        };
        let aggregator = HistoryAggregator::new(Arc::new(ledger), APP);
        let start = Instant::now();

        let result = aggregator
            .get_history(&LedgerAddress::from_seed("x"), Some(Duration::from_secs(5)))
            .await;

        assert_eq!(result, Err(PodiumErr::Timeout));
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_survives_failed_connection() {
        let (ledger, aggregator) = aggregator();
        let address = LedgerAddress::from_seed("far");
        ledger.fail_next_connections(1);
        ledger.insert(&address, APP, &json!({"n": 1}));

        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(ledger.connection_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_quiet_period_falls_back_to_deadline() {
        let (ledger, aggregator) = aggregator();
        let aggregator = aggregator.with_quiet_period(Duration::MAX);
        let address = LedgerAddress::from_seed("far");
        ledger.insert(&address, APP, &json!({"n": 1}));
        let start = Instant::now();

        let history = aggregator
            .get_history(&address, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    quickcheck! {
        fn history_is_sorted_and_complete(entries: Vec<(u32, bool)>) -> bool {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async move {
                let (ledger, aggregator) = aggregator();
                let address = LedgerAddress::from_seed("prop");
                let mut expected = vec![];

                for (n, (timestamp, placeholder)) in entries.iter().enumerate() {
                    let payload = if *placeholder {
                        crate::primitives::placeholder_payload()
                    } else {
                        expected.push((i64::from(*timestamp), n as u64));
                        json!({ "n": n })
                    };
                    ledger.insert_at(&address, APP, &payload, i64::from(*timestamp));
                }

                let history = match aggregator
                    .get_history(&address, Some(Duration::from_secs(5)))
                    .await
                {
                    Ok(history) => history,
                    Err(PodiumErr::Timeout) => return entries.is_empty(),
                    Err(_) => return false,
                };

                let sorted = history.windows(2).all(|w| w[0].created_at <= w[1].created_at);
                let mut got: Vec<(i64, u64)> = history
                    .iter()
                    .map(|r| (r.created_at, r.get("n").and_then(|n| n.as_u64()).unwrap_or(u64::MAX)))
                    .collect();
                got.sort_unstable();
                expected.sort_unstable();

                sorted && got == expected
            })
        }
    }
}
