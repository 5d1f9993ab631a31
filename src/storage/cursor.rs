//! Ordered iteration over the chunks of a shard.
//!
//! [`MergeIterator`] combines sorted sources that are given oldest first.
//! When several sources hold the same key, the newest one wins and the
//! others are skipped. It yields tombstones so the merger can see them;
//! [`Cursor`] hides them for readers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use super::chunk::MemoChunk;
use super::types::Entry;
use crate::error::{Error, Result};

pub type EntryIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    source: usize,
    iterator: EntryIter,
}

impl fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("tombstone", &self.value.is_none())
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: smallest key first, newest source first
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.source.cmp(&other.source),
            other => other.reverse(),
        }
    }
}

#[derive(Debug)]
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    latest_key: Option<Vec<u8>>,
    error: Option<Error>,
}

impl MergeIterator {
    /// `sources` are ordered oldest first.
    pub fn new(sources: Vec<EntryIter>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            latest_key: None,
            error: None,
        };
        for (source, iterator) in sources.into_iter().enumerate() {
            merge.refill(source, iterator);
        }
        merge
    }

    fn refill(&mut self, source: usize, mut iterator: EntryIter) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.error.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.refill(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            if let Some(e) = self.error.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            return Some(Ok((key, value)));
        }
    }
}

/// Walks a frozen memo chunk without borrowing it, re-seeking after each
/// key.
pub struct MemoSource {
    memo: Arc<MemoChunk>,
    lower: Bound<Vec<u8>>,
    upper: Vec<u8>,
}

impl MemoSource {
    /// Entries with `lower <= key < upper`; an empty `upper` is unbounded.
    pub fn new(memo: Arc<MemoChunk>, lower: &[u8], upper: &[u8]) -> Self {
        Self {
            memo,
            lower: Bound::Included(lower.to_vec()),
            upper: upper.to_vec(),
        }
    }
}

impl Iterator for MemoSource {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let upper = if self.upper.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(self.upper.as_slice())
        };
        let lower = match &self.lower {
            Bound::Included(key) => Bound::Included(key.as_slice()),
            Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u)) = (lower, upper) {
            if l >= u {
                return None;
            }
        }
        let (key, value) = self.memo.range(lower, upper).next()?;
        let entry = (key.to_vec(), value.map(<[u8]>::to_vec));
        self.lower = Bound::Excluded(entry.0.clone());
        Some(Ok(entry))
    }
}

/// Snapshot of part of the active memo chunk, taken when a cursor opens so
/// later writes do not disturb it.
pub fn memo_snapshot(memo: &MemoChunk, lower: &[u8], upper: &[u8]) -> EntryIter {
    if !upper.is_empty() && lower >= upper {
        return Box::new(std::iter::empty());
    }
    let upper = if upper.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(upper)
    };
    let entries: Vec<Entry> = memo
        .range(Bound::Included(lower), upper)
        .map(|(key, value)| (key.to_vec(), value.map(<[u8]>::to_vec)))
        .collect();
    Box::new(entries.into_iter().map(Ok))
}

/// Live key-value pairs of a shard in key order.
pub struct Cursor {
    merge: MergeIterator,
}

impl Cursor {
    pub fn new(sources: Vec<EntryIter>) -> Self {
        Self {
            merge: MergeIterator::new(sources),
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.merge.next()? {
                Ok((key, Some(value))) => return Some(Ok((key, value))),
                Ok((_, None)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
