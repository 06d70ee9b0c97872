// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::error::PodiumErr;
use crate::ledger::{Confirmation, Ledger, LedgerErr, SubmissionStatus};
use crate::primitives::{Hash256, LedgerAddress, Transaction};
use crate::wallet::Identity;
use futures::future::join_all;
use futures::StreamExt;
use log::debug;
use serde_json::Value;
use std::sync::Arc;

/// Payload submitted to a set of addresses as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub addresses: Vec<LedgerAddress>,
    pub payload: Value,
}

impl PendingWrite {
    #[must_use]
    pub fn new(addresses: Vec<LedgerAddress>, payload: Value) -> Self {
        Self { addresses, payload }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub addresses: Vec<LedgerAddress>,
    pub result: Result<Confirmation, PodiumErr>,
}

/// Per write outcome of a multi write call, in submission order.
///
/// Writes are independent transactions. Some may be committed while others
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    outcomes: Vec<WriteOutcome>,
}

impl WriteReport {
    #[must_use]
    pub fn outcomes(&self) -> &[WriteOutcome] {
        &self.outcomes
    }

    /// True if every write was confirmed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &WriteOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Collapses the report. Fails with the first error in submission order.
    pub fn into_result(self) -> Result<Vec<Confirmation>, PodiumErr> {
        self.outcomes.into_iter().map(|o| o.result).collect()
    }
}

/// Submits records to the ledger as signed transactions.
#[derive(Clone)]
pub struct RecordWriter {
    ledger: Arc<dyn Ledger>,
    app_id: String,
}

impl RecordWriter {
    pub fn new(ledger: Arc<dyn Ledger>, app_id: &str) -> Self {
        Self {
            ledger,
            app_id: app_id.to_owned(),
        }
    }

    /// Dispatches every write concurrently under `identity` and waits for all
    /// of them to settle.
    ///
    /// Fails with `EmptyTarget` without contacting the ledger if there is
    /// nothing to write or any write has no destination address.
    pub async fn write(
        &self,
        identity: &Identity,
        targets: Vec<PendingWrite>,
    ) -> Result<WriteReport, PodiumErr> {
        if targets.is_empty() || targets.iter().any(|t| t.addresses.is_empty()) {
            return Err(PodiumErr::EmptyTarget);
        }

        let submissions = targets.into_iter().map(|target| async move {
            let result = self
                .submit(identity, &target.addresses, &target.payload)
                .await;

            WriteOutcome {
                addresses: target.addresses,
                result,
            }
        });

        Ok(WriteReport {
            outcomes: join_all(submissions).await,
        })
    }

    async fn submit(
        &self,
        identity: &Identity,
        addresses: &[LedgerAddress],
        payload: &Value,
    ) -> Result<Confirmation, PodiumErr> {
        let payload = serde_json::to_vec(payload)?;
        debug!(
            "Writing to {} ledger paths: {}",
            addresses.len(),
            String::from_utf8_lossy(&payload)
        );

        let mut tx = Transaction::new_payload(addresses.to_vec(), &self.app_id, payload);
        tx.sign(identity);
        let hash = tx.hash().copied().unwrap_or_else(Hash256::zero);
        let mut progress = self.ledger.submit_transaction(tx);
        let mut stored_at = None;

        while let Some(status) = progress.next().await {
            match status {
                Ok(status) => {
                    debug!(" > {:?} {:?}", hash, status);

                    if let SubmissionStatus::Stored { timestamp } = status {
                        stored_at = Some(timestamp);
                    }
                }
                Err(err @ LedgerErr::Unreachable(_)) => return Err(PodiumErr::Connection(err)),
                Err(err) => return Err(PodiumErr::Submission(err)),
            }
        }

        Ok(Confirmation { hash, stored_at })
    }
}
