//! Durable store primitives used by the queue.
//!
//! `QueueStore` is the narrow set of list, key and scripted operations the
//! dispatch engine needs from a Redis-compatible store. Every operation that
//! touches more than one key is atomic: `RedisStore` runs it as a Lua script
//! or a MULTI pipeline, `MemoryStore` runs it under a single lock.
//!
//! List orientation follows Redis: index 0 is the left end, producers push on
//! the left and consumers pop from the right.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::QueueError;

/// A serialized job plus the status record written alongside it.
#[derive(Debug, Clone)]
pub struct EnqueueEntry {
    pub payload: String,
    pub status_key: String,
    pub status: String,
}

/// Values written when a stale Running record is reconciled.
#[derive(Debug, Clone)]
pub struct OrphanRequeue {
    /// The job as it was serialized when it was dispatched.
    pub dispatched_payload: String,
    /// The entry to push when the job is in neither list.
    pub requeue_payload: String,
    /// Status written after pushing `requeue_payload`.
    pub requeued_status: String,
    /// Status written when the job is already waiting on the queue.
    pub queued_status: String,
}

/// Outcome of reconciling one stale Running record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanCheck {
    /// The job was in no list and has been pushed back onto the queue.
    Requeued,
    /// The job was already waiting on the queue; only its status was refreshed.
    AlreadyQueued,
    /// The job is still on the processing list and was left alone.
    InFlight,
}

/// Store operations backing the queue, processing list and status records.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// LPUSHes every payload onto `queue` and writes each status record with
    /// `ttl`, all in one transaction.
    async fn enqueue(
        &self,
        queue: &str,
        entries: &[EnqueueEntry],
        ttl: Duration,
    ) -> Result<(), QueueError>;

    /// Atomically moves up to `count` entries from the right of `source` to
    /// the left of `destination`, returning them in pop order.
    async fn move_batch(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> Result<Vec<String>, QueueError>;

    /// Removes one occurrence of `raw` from `source` and, if it was present,
    /// RPUSHes it onto `destination`.
    async fn move_entry(&self, source: &str, destination: &str, raw: &str)
        -> Result<bool, QueueError>;

    /// Repeats RPOPLPUSH from `source` to `destination` until `source` is
    /// empty. Returns the number of entries moved.
    async fn drain(&self, source: &str, destination: &str) -> Result<usize, QueueError>;

    /// LPOS: index of the first occurrence of `raw` in `list`.
    async fn position(&self, list: &str, raw: &str) -> Result<Option<usize>, QueueError>;

    async fn len(&self, list: &str) -> Result<usize, QueueError>;

    /// Removes one occurrence of `raw` from `list` and writes the status
    /// record, in one transaction.
    async fn finish(
        &self,
        list: &str,
        raw: &str,
        status_key: &str,
        status: &str,
        ttl: Duration,
    ) -> Result<(), QueueError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Reads many keys in one round trip.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, QueueError>;

    /// One SCAN page. A returned cursor of 0 ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), QueueError>;

    /// `SET key token PX ttl NX`.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, QueueError>;

    /// Deletes `key` only if it still holds `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, QueueError>;

    /// Reconciles one stale Running record against both lists atomically.
    async fn requeue_orphan(
        &self,
        queue: &str,
        processing: &str,
        status_key: &str,
        orphan: &OrphanRequeue,
        ttl: Duration,
    ) -> Result<OrphanCheck, QueueError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Option<Instant>)>,
    /// Open scan cursors, each holding the last key its page returned.
    scan_cursors: HashMap<u64, String>,
    last_cursor: u64,
}

impl MemoryState {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|(value, _)| value)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.values
            .insert(key.to_string(), (value.to_string(), deadline));
    }

    fn lpush(&mut self, list: &str, raw: &str) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_front(raw.to_string());
    }

    fn rpush(&mut self, list: &str, raw: &str) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_back(raw.to_string());
    }

    fn rpop(&mut self, list: &str) -> Option<String> {
        let entries = self.lists.get_mut(list)?;
        let popped = entries.pop_back();
        if entries.is_empty() {
            self.lists.remove(list);
        }
        popped
    }

    fn lpos(&self, list: &str, raw: &str) -> Option<usize> {
        self.lists
            .get(list)
            .and_then(|entries| entries.iter().position(|entry| entry == raw))
    }

    fn lrem_one(&mut self, list: &str, raw: &str) -> bool {
        let Some(index) = self.lpos(list, raw) else {
            return false;
        };
        if let Some(entries) = self.lists.get_mut(list) {
            entries.remove(index);
            if entries.is_empty() {
                self.lists.remove(list);
            }
        }
        true
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> Option<String> {
        let raw = self.rpop(source)?;
        self.lpush(destination, &raw);
        Some(raw)
    }
}

/// In-process store with the same atomicity guarantees as `RedisStore`.
///
/// All lists and keys live behind one mutex, so every operation is a single
/// critical section. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list, left to right.
    pub async fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .lists
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pushes raw entries onto the left of a list, bypassing job encoding.
    pub async fn push_raw(&self, key: &str, raw: &str) {
        self.state.lock().await.lpush(key, raw);
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(
        &self,
        queue: &str,
        entries: &[EnqueueEntry],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        for entry in entries {
            state.lpush(queue, &entry.payload);
            state.set(&entry.status_key, &entry.status, Some(ttl));
        }
        Ok(())
    }

    async fn move_batch(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut state = self.state.lock().await;
        let mut moved = Vec::new();
        while moved.len() < count {
            match state.rpoplpush(source, destination) {
                Some(raw) => moved.push(raw),
                None => break,
            }
        }
        Ok(moved)
    }

    async fn move_entry(
        &self,
        source: &str,
        destination: &str,
        raw: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if !state.lrem_one(source, raw) {
            return Ok(false);
        }
        state.rpush(destination, raw);
        Ok(true)
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let mut moved = 0;
        while state.rpoplpush(source, destination).is_some() {
            moved += 1;
        }
        Ok(moved)
    }

    async fn position(&self, list: &str, raw: &str) -> Result<Option<usize>, QueueError> {
        Ok(self.state.lock().await.lpos(list, raw))
    }

    async fn len(&self, list: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn finish(
        &self,
        list: &str,
        raw: &str,
        status_key: &str,
        status: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.lrem_one(list, raw);
        state.set(status_key, status, Some(ttl));
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.state.lock().await.set(key, value, Some(ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.state.lock().await.live_value(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(keys
            .iter()
            .map(|key| state.live_value(key).cloned())
            .collect())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state
            .values
            .retain(|_, (_, deadline)| deadline.map_or(true, |deadline| deadline > now));

        // A cursor resumes after the last key it returned, not at an index.
        let resume_after = match cursor {
            0 => None,
            cursor => match state.scan_cursors.remove(&cursor) {
                Some(key) => Some(key),
                None => return Ok((0, Vec::new())),
            },
        };

        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.lists.keys())
            .filter(|key| resume_after.as_ref().map_or(true, |after| key.as_str() > after.as_str()))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();

        let page_size = count.max(1);
        let has_more = keys.len() > page_size;
        keys.truncate(page_size);

        let next_cursor = match keys.last() {
            Some(last) if has_more => {
                state.last_cursor += 1;
                let id = state.last_cursor;
                state.scan_cursors.insert(id, last.clone());
                id
            }
            _ => 0,
        };

        let page = keys
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .collect();
        Ok((next_cursor, page))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state.set(key, token, Some(ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.live_value(key).map(String::as_str) != Some(token) {
            return Ok(false);
        }
        state.values.remove(key);
        Ok(true)
    }

    async fn requeue_orphan(
        &self,
        queue: &str,
        processing: &str,
        status_key: &str,
        orphan: &OrphanRequeue,
        ttl: Duration,
    ) -> Result<OrphanCheck, QueueError> {
        let mut state = self.state.lock().await;
        if state.lpos(processing, &orphan.dispatched_payload).is_some() {
            return Ok(OrphanCheck::InFlight);
        }
        if state.lpos(queue, &orphan.dispatched_payload).is_some() {
            state.set(status_key, &orphan.queued_status, Some(ttl));
            return Ok(OrphanCheck::AlreadyQueued);
        }
        state.lpush(queue, &orphan.requeue_payload);
        state.set(status_key, &orphan.requeued_status, Some(ttl));
        Ok(OrphanCheck::Requeued)
    }
}

/// Redis-style glob matching supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
