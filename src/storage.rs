/*!
 * In-Memory Storage Implementation
 *
 * This module provides the Store: one key space split into three typed
 * containers (strings, lists, hashes) plus an expiry table, all guarded by
 * a single mutex. Every public operation takes the lock for its whole
 * duration, so no caller ever observes a partial mutation.
 *
 * A key lives in at most one container. Mutators that establish a key as
 * one type first evict it from the other two.
 */

use crate::persist::{self, Record};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

// AHash is considerably faster than SipHash for short keys
type AHash = BuildHasherDefault<ahash::AHasher>;

pub type Map<V> = HashMap<Bytes, V, AHash>;

/// Field -> value mapping stored under a hash key
pub type Hash = Map<Bytes>;

/// Deadline used when `now + seconds` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The type a key currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    String,
    List,
    Hash,
    None,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Hash => "hash",
            KeyType::None => "none",
        }
    }
}

/// The unlocked key space. Only reachable through the Store's mutex.
#[derive(Default)]
pub(crate) struct Keyspace {
    pub(crate) strings: Map<Bytes>,
    pub(crate) lists: Map<VecDeque<Bytes>>,
    pub(crate) hashes: Map<Hash>,
    pub(crate) expires: Map<Instant>,
}

impl Keyspace {
    fn contains(&self, k: &[u8]) -> bool {
        self.strings.contains_key(k) || self.lists.contains_key(k) || self.hashes.contains_key(k)
    }

    /// Remove `k` from every container; the expiry record is left alone
    fn evict(&mut self, k: &[u8]) -> bool {
        let mut removed = self.strings.remove(k).is_some();
        removed |= self.lists.remove(k).is_some();
        removed |= self.hashes.remove(k).is_some();
        removed
    }

    fn clear(&mut self) {
        self.strings.clear();
        self.lists.clear();
        self.hashes.clear();
        self.expires.clear();
    }

    /// Drop every key whose deadline is at or before `now`.
    /// Callers must already hold the Store lock.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let due: Vec<Bytes> = self
            .expires
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for k in &due {
            self.evict(k);
            self.expires.remove(k);
        }
        due.len()
    }

    fn list_entry(&mut self, k: Bytes) -> &mut VecDeque<Bytes> {
        if !self.lists.contains_key(&k) {
            self.strings.remove(&k);
            self.hashes.remove(&k);
        }
        self.lists.entry(k).or_default()
    }

    fn hash_entry(&mut self, k: Bytes) -> &mut Hash {
        if !self.hashes.contains_key(&k) {
            self.strings.remove(&k);
            self.lists.remove(&k);
        }
        self.hashes.entry(k).or_default()
    }

    pub(crate) fn apply(&mut self, record: Record) {
        match record {
            Record::Str(k, v) => {
                self.evict(&k);
                self.strings.insert(k, v);
            }
            Record::List(k, items) => {
                self.evict(&k);
                self.lists.insert(k, items);
            }
            Record::Hash(k, fields) => {
                self.evict(&k);
                self.hashes.insert(k, fields);
            }
        }
    }
}

/// Resolve a (possibly negative) list index against `len`
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { len + index } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn deadline(now: Instant, seconds: i64) -> Instant {
    if seconds >= 0 {
        now.checked_add(Duration::from_secs(seconds as u64))
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    } else {
        now.checked_sub(Duration::from_secs(seconds.unsigned_abs()))
            .unwrap_or(now)
    }
}

/// Thread-safe key space shared by every connection and the dump scheduler
///
/// Construct one per server and hand it out behind an `Arc`.
#[derive(Default)]
pub struct Store {
    inner: Mutex<Keyspace>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key and every expiry record
    pub fn flush_all(&self) {
        self.inner.lock().clear();
    }

    /// Set `k` to the string `v`, replacing a list or hash held under `k`.
    /// An existing expiry record is kept.
    pub fn set(&self, k: Bytes, v: Bytes) {
        let mut ks = self.inner.lock();
        ks.lists.remove(&k);
        ks.hashes.remove(&k);
        ks.strings.insert(k, v);
    }

    /// Get the string stored at `k`; lists, hashes and missing keys give `None`
    pub fn get(&self, k: &[u8]) -> Option<Bytes> {
        self.inner.lock().strings.get(k).cloned()
    }

    /// All keys, strings first, then lists, then hashes.
    ///
    /// Does not purge: a key past its deadline is still listed until the
    /// next purge runs.
    pub fn keys(&self) -> Vec<Bytes> {
        let ks = self.inner.lock();
        let mut out = Vec::with_capacity(ks.strings.len() + ks.lists.len() + ks.hashes.len());
        out.extend(ks.strings.keys().cloned());
        out.extend(ks.lists.keys().cloned());
        out.extend(ks.hashes.keys().cloned());
        out
    }

    pub fn key_type(&self, k: &[u8]) -> KeyType {
        let ks = self.inner.lock();
        if ks.strings.contains_key(k) {
            KeyType::String
        } else if ks.lists.contains_key(k) {
            KeyType::List
        } else if ks.hashes.contains_key(k) {
            KeyType::Hash
        } else {
            KeyType::None
        }
    }

    /// Delete `k` whatever its type. Returns `true` if anything was removed.
    pub fn del(&self, k: &[u8]) -> bool {
        let mut ks = self.inner.lock();
        ks.expires.remove(k);
        ks.evict(k)
    }

    /// Set `k` to expire `seconds` from now.
    ///
    /// Already-expired keys are purged first, so an expired key counts as
    /// missing. Zero or negative `seconds` makes the key due immediately.
    pub fn expire(&self, k: &[u8], seconds: i64) -> bool {
        let mut ks = self.inner.lock();
        let now = Instant::now();
        ks.purge_expired(now);
        if !ks.contains(k) {
            return false;
        }
        ks.expires.insert(Bytes::copy_from_slice(k), deadline(now, seconds));
        true
    }

    /// Time left before `k` expires, `None` if it has no expiry record
    pub fn ttl_remaining(&self, k: &[u8]) -> Option<Duration> {
        let ks = self.inner.lock();
        ks.expires
            .get(k)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Remove every key whose deadline has passed. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.lock().purge_expired(Instant::now());
        if purged > 0 {
            log::debug!("purged {} expired keys", purged);
        }
        purged
    }

    /// Move `from` (value and expiry) to `to`, replacing whatever `to` held.
    /// Returns `false` if `from` does not exist.
    pub fn rename(&self, from: &[u8], to: Bytes) -> bool {
        let mut ks = self.inner.lock();
        if !ks.contains(from) {
            return false;
        }
        if from == &to[..] {
            return true;
        }

        ks.evict(&to);
        ks.expires.remove(&to);

        if let Some(v) = ks.strings.remove(from) {
            ks.strings.insert(to.clone(), v);
        }
        if let Some(l) = ks.lists.remove(from) {
            ks.lists.insert(to.clone(), l);
        }
        if let Some(h) = ks.hashes.remove(from) {
            ks.hashes.insert(to.clone(), h);
        }
        if let Some(at) = ks.expires.remove(from) {
            ks.expires.insert(to, at);
        }
        true
    }

    //
    // List operations
    //

    /// Length of the list at `k`, 0 if there is none
    pub fn llen(&self, k: &[u8]) -> usize {
        self.inner.lock().lists.get(k).map_or(0, VecDeque::len)
    }

    /// Insert `v` at the head of the list at `k`, creating it if needed
    pub fn lpush(&self, k: Bytes, v: Bytes) -> usize {
        let mut ks = self.inner.lock();
        let list = ks.list_entry(k);
        list.push_front(v);
        list.len()
    }

    /// Append `v` to the tail of the list at `k`, creating it if needed
    pub fn rpush(&self, k: Bytes, v: Bytes) -> usize {
        let mut ks = self.inner.lock();
        let list = ks.list_entry(k);
        list.push_back(v);
        list.len()
    }

    /// Pop the head. An emptied list stays in place with zero elements.
    pub fn lpop(&self, k: &[u8]) -> Option<Bytes> {
        self.inner.lock().lists.get_mut(k)?.pop_front()
    }

    /// Pop the tail. An emptied list stays in place with zero elements.
    pub fn rpop(&self, k: &[u8]) -> Option<Bytes> {
        self.inner.lock().lists.get_mut(k)?.pop_back()
    }

    /// Remove occurrences of `v` from the list at `k`.
    ///
    /// * `count == 0` removes all of them
    /// * `count > 0` removes up to `count`, scanning head to tail
    /// * `count < 0` removes up to `|count|`, scanning tail to head
    ///
    /// Returns the number removed.
    pub fn lrem(&self, k: &[u8], count: i64, v: &[u8]) -> usize {
        let mut ks = self.inner.lock();
        let Some(list) = ks.lists.get_mut(k) else {
            return 0;
        };

        let before = list.len();
        if count == 0 {
            list.retain(|item| item != v);
            return before - list.len();
        }

        let limit = count.unsigned_abs() as usize;
        let mut removed = 0;
        if count > 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == v {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == v {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Element at `index`; negative indices count from the tail
    pub fn lindex(&self, k: &[u8], index: i64) -> Option<Bytes> {
        let ks = self.inner.lock();
        let list = ks.lists.get(k)?;
        let i = normalize_index(index, list.len())?;
        list.get(i).cloned()
    }

    /// Overwrite the element at `index`. Out-of-range indices leave the list untouched.
    pub fn lset(&self, k: &[u8], index: i64, v: Bytes) -> bool {
        let mut ks = self.inner.lock();
        let Some(list) = ks.lists.get_mut(k) else {
            return false;
        };
        match normalize_index(index, list.len()) {
            Some(i) => {
                list[i] = v;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the whole list at `k`, `None` if there is no list
    pub fn lrange_all(&self, k: &[u8]) -> Option<Vec<Bytes>> {
        let ks = self.inner.lock();
        ks.lists.get(k).map(|l| l.iter().cloned().collect())
    }

    //
    // Hash operations
    //

    /// Set `field` in the hash at `k`. Returns `true` if the field is new.
    pub fn hset(&self, k: Bytes, field: Bytes, v: Bytes) -> bool {
        let mut ks = self.inner.lock();
        ks.hash_entry(k).insert(field, v).is_none()
    }

    pub fn hget(&self, k: &[u8], field: &[u8]) -> Option<Bytes> {
        self.inner.lock().hashes.get(k)?.get(field).cloned()
    }

    pub fn hdel(&self, k: &[u8], field: &[u8]) -> bool {
        let mut ks = self.inner.lock();
        ks.hashes
            .get_mut(k)
            .map_or(false, |h| h.remove(field).is_some())
    }

    pub fn hlen(&self, k: &[u8]) -> usize {
        self.inner.lock().hashes.get(k).map_or(0, |h| h.len())
    }

    pub fn hgetall(&self, k: &[u8]) -> Vec<(Bytes, Bytes)> {
        let ks = self.inner.lock();
        ks.hashes
            .get(k)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    //
    // Persistence
    //

    /// Write the whole key space to `path`. Expiry records are not saved.
    ///
    /// The lock is held for the full write, blocking every other caller
    /// until the file is on disk.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let ks = self.inner.lock();
        match persist::write_keyspace(&ks, path) {
            Ok(n) => {
                log::debug!("dumped {} keys to {}", n, path.display());
                true
            }
            Err(e) => {
                log::warn!("dump to {} failed: {}", path.display(), e);
                false
            }
        }
    }

    /// Replace the whole key space with the contents of `path`.
    ///
    /// Returns `false` only if the file cannot be opened; unreadable lines
    /// are skipped.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let mut ks = self.inner.lock();
        match load_into(&mut ks, path) {
            Ok((loaded, skipped)) => {
                if skipped > 0 {
                    log::warn!("skipped {} malformed records in {}", skipped, path.display());
                }
                log::debug!("loaded {} records from {}", loaded, path.display());
                true
            }
            Err(e) => {
                log::warn!("load from {} failed: {}", path.display(), e);
                false
            }
        }
    }
}

fn load_into(ks: &mut Keyspace, path: &Path) -> io::Result<(usize, usize)> {
    let reader = persist::open_dump(path)?;
    ks.clear();
    persist::read_records(reader, |record| ks.apply(record))
}
