// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Roughly 30 years, used in place of deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Instant `duration` from now, saturating at a far future instant.
pub(crate) fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Keyed table of expiring callbacks.
///
/// Every operation acts only on the entry of the id it is given. Callbacks
/// run on the tokio runtime, outside of the table lock, and may freely call
/// back into the registry.
pub struct TimerRegistry<K> {
    table: Arc<Mutex<TimerTable<K>>>,
}

struct TimerTable<K> {
    entries: HashMap<K, TimerEntry>,
    next_generation: u64,
}

struct TimerEntry {
    duration: Duration,
    callback: TimerCallback,
    generation: u64,
    task: JoinHandle<()>,
}

impl<K> Clone for TimerRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<K> Default for TimerRegistry<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                entries: HashMap::new(),
                next_generation: 0,
            })),
        }
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run once after `duration`, replacing any timer
    /// already registered under `id`.
    pub fn start<F>(&self, id: K, duration: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: TimerCallback = Arc::new(callback);
        let mut table = self.table.lock();
        let generation = table.bump_generation();
        let task = self.schedule(id.clone(), duration, generation);
        let entry = TimerEntry {
            duration,
            callback,
            generation,
            task,
        };

        if let Some(old) = table.entries.insert(id, entry) {
            old.task.abort();
        }
    }

    /// Restarts the countdown of `id` with its original duration. Returns
    /// `false` and does nothing when `id` has no live timer.
    pub fn reset(&self, id: &K) -> bool {
        let mut table = self.table.lock();

        let Some(duration) = table.entries.get(id).map(|e| e.duration) else {
            return false;
        };

        let generation = table.bump_generation();
        let task = self.schedule(id.clone(), duration, generation);

        if let Some(entry) = table.entries.get_mut(id) {
            entry.task.abort();
            entry.task = task;
            entry.generation = generation;
        }

        true
    }

    /// Cancels and removes the timer of `id`. Returns `false` if there was none.
    pub fn stop(&self, id: &K) -> bool {
        let removed = self.table.lock().entries.remove(id);

        match removed {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels and removes every timer.
    pub fn stop_all(&self) {
        let entries: Vec<_> = self.table.lock().entries.drain().collect();

        for (id, entry) in entries {
            debug!("Stopping timer {:?}", id);
            entry.task.abort();
        }
    }

    #[must_use]
    pub fn is_active(&self, id: &K) -> bool {
        self.table.lock().entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule(&self, id: K, duration: Duration, generation: u64) -> JoinHandle<()> {
        let table = Arc::downgrade(&self.table);
        let deadline = deadline_after(duration);

        tokio::spawn(async move {
            sleep_until(deadline).await;
            fire(&table, &id, generation);
        })
    }
}

impl<K> TimerTable<K> {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

fn fire<K>(table: &Weak<Mutex<TimerTable<K>>>, id: &K, generation: u64)
where
    K: Eq + Hash + Debug,
{
    let Some(table) = table.upgrade() else {
        return;
    };

    let callback = {
        let mut table = table.lock();

        // Superseded by a reset or a new start
        match table.entries.get(id) {
            Some(entry) if entry.generation == generation => {}
            _ => return,
        }

        table.entries.remove(id).map(|entry| entry.callback)
    };

    if let Some(callback) = callback {
        debug!("Timer {:?} fired", id);
        callback();
    }
}
