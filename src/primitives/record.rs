// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::ledger::LedgerItem;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key marking index-seeding entries that must never reach callers.
pub const PLACEHOLDER_KEY: &str = "placeholder";

/// One payload entry observed at an address.
///
/// The payload is free-form; `record` and `type` discriminate its shape for
/// downstream interpreters. Timestamps are milliseconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Ledger assigned timestamp. Monotonic per address only.
    #[serde(rename = "createdAt")]
    pub created_at: i64,

    /// Local wall clock time at which this process observed the record.
    #[serde(rename = "receivedAt")]
    pub received_at: i64,

    /// Payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Parses a ledger item and stamps it with its creation and receipt times.
    pub fn from_item(item: &LedgerItem) -> Result<Self, serde_json::Error> {
        let fields: Map<String, Value> = serde_json::from_slice(&item.payload)?;

        Ok(Self {
            created_at: item.timestamp,
            received_at: Utc::now().timestamp_millis(),
            fields,
        })
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self.fields.get(PLACEHOLDER_KEY), Some(Value::Bool(true)))
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Value of the `record` discriminator
    #[must_use]
    pub fn record(&self) -> Option<&str> {
        self.get_str("record")
    }

    /// Value of the `type` discriminator
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.get_str("type")
    }
}

/// Payload written to seed an otherwise empty address.
#[must_use]
pub fn placeholder_payload() -> Value {
    serde_json::json!({ "placeholder": true })
}
