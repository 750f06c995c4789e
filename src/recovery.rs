use std::collections::HashSet;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache::CacheState;
use crate::cache::OrderCache;
use crate::error::StoreError;
use crate::traits::RecordStore;
use crate::types::OrderKey;

/// Outcome of [`OrderCache::recover()`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Cache log rows replayed.
    pub rows:     usize,
    /// Distinct records loaded into memory.
    pub restored: usize,
    /// Keys whose record couldn't be fetched. They keep their queue slot but have no entry.
    pub skipped:  Vec<OrderKey>,
    /// Cursor position after recovery.
    pub cursor:   usize,
}

impl RecoveryReport {
    pub fn is_cold_start(&self) -> bool {
        self.rows == 0
    }
}

// Two-pointer swap from both ends, bounded by len/2.
pub(crate) fn reverse_in_place<T>(items: &mut [T]) {
    let len = items.len();
    let mut head = 0;
    while head < len / 2 {
        items.swap(head, len - 1 - head);
        head += 1;
    }
}

impl<S> OrderCache<S>
where
    S: RecordStore,
{
    /// Rebuild the cache from this instance's cache log. Must run before the cache starts serving.
    ///
    /// The log is read newest first, up to capacity rows, and installed oldest first with the cursor right after
    /// the newest key. An empty log is a cold start, not an error. Only a failure of the log query itself is
    /// returned as an error; in that case the cache is left as it was.
    #[instrument(level = "trace", skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        let capacity = self.capacity();

        if capacity == 0 {
            debug!("Cache is disabled, nothing to recover");
            return Ok(report);
        }

        let rows = self.store().fetch_recent_cache_log(self.instance_key(), capacity).await?;

        if rows.is_empty() {
            info!("Cache log of '{}' is empty, starting with a cold cache", self.instance_key());
            if let Some(observer) = self.observer() {
                observer.on_recovered(&report).await;
            }
            return Ok(report);
        }

        let mut state = CacheState::new(capacity);
        let mut keys = Vec::with_capacity(capacity);
        let mut failed = HashSet::new();

        for row in rows.iter().take(capacity) {
            keys.push(row.key);

            if state.entries.contains_key(&row.key) || failed.contains(&row.key) {
                continue;
            }

            match self.store().fetch_order(row.key).await {
                Ok(record) => {
                    state.entries.insert(row.key, record);
                }
                Err(err) => {
                    warn!("Order #{} from the cache log is not restored: {err}", row.key);
                    failed.insert(row.key);
                    report.skipped.push(row.key);
                }
            }
        }

        reverse_in_place(&mut keys);

        let count = keys.len();
        for (slot, key) in keys.into_iter().enumerate() {
            state.queue[slot] = Some(key);
        }
        state.pos = count % capacity;

        report.rows = count;
        report.restored = state.entries.len();
        report.cursor = state.pos;

        self.replace_state(state);

        info!(
            "Cache of '{}' recovered: {} log rows, {} records, {} skipped",
            self.instance_key(),
            report.rows,
            report.restored,
            report.skipped.len()
        );

        if let Some(observer) = self.observer() {
            observer.on_recovered(&report).await;
        }

        Ok(report)
    }
}
