//! Per-connection correlation table from numeric id to in-flight response handle.
//!
//! HTTP/1 connections reuse small ids: allocation wraps and skips ids that are
//! still live. HTTP/2 connections hand out odd client-initiated stream ids in
//! strictly increasing order and never reuse them.
//!
//! The owning connection task and pool eviction or close paths may race on the
//! same entry; every removal goes through the lock, so exactly one caller gets
//! the handle back.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Largest client-initiated stream id.
const MAX_STREAM_ID: u32 = (1 << 31) - 1;

#[derive(Debug)]
pub(crate) struct HandleRegistry<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<u32, T>,
    mode: IdMode,
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdMode {
    Reuse,
    Stream,
}

impl<T: Clone> HandleRegistry<T> {
    /// A registry for HTTP/1: ids start at 0 and are reused once released.
    pub(crate) fn reusing() -> Self {
        Self { inner: Mutex::new(Inner { entries: HashMap::with_capacity(1), mode: IdMode::Reuse, next: 0 }) }
    }

    /// A registry for HTTP/2 starting at the odd stream id `first`.
    pub(crate) fn streams(first: u32) -> Self {
        Self { inner: Mutex::new(Inner { entries: HashMap::new(), mode: IdMode::Stream, next: first | 1 }) }
    }

    /// Register `value` under a fresh id, `None` once stream ids are exhausted.
    pub(crate) fn put(&self, value: T) -> Option<u32> {
        let mut inner = self.inner.lock();
        let id = inner.allocate()?;
        inner.entries.insert(id, value);
        Some(id)
    }

    /// Register `value` and run `f` with its id while still holding the lock,
    /// so ids reach `f` in allocation order. The entry is removed again if `f` fails.
    pub(crate) fn put_with<E>(&self, value: T, exhausted: E, f: impl FnOnce(u32) -> Result<(), E>) -> Result<u32, E> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.allocate() else {
            return Err(exhausted);
        };
        inner.entries.insert(id, value);
        if let Err(e) = f(id) {
            inner.entries.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) fn get(&self, id: u32) -> Option<T> {
        self.inner.lock().entries.get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub(crate) fn remove(&self, id: u32) -> Option<T> {
        self.inner.lock().entries.remove(&id)
    }

    /// Remove the entry only if it still satisfies `predicate`, e.g. it is the same handle.
    pub(crate) fn remove_if(&self, id: u32, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.entries.get(&id).is_some_and(predicate) {
            return inner.entries.remove(&id);
        }
        None
    }

    /// Remove every entry whose id matches `predicate`.
    pub(crate) fn remove_where(&self, mut predicate: impl FnMut(u32) -> bool) -> Vec<(u32, T)> {
        let mut inner = self.inner.lock();
        let ids: Vec<u32> = inner.entries.keys().copied().filter(|id| predicate(*id)).collect();
        ids.into_iter().filter_map(|id| inner.entries.remove(&id).map(|value| (id, value))).collect()
    }

    /// Take every entry out and visit it outside the lock.
    pub(crate) fn drain(&self, mut visitor: impl FnMut(u32, T)) {
        let entries: Vec<(u32, T)> = self.inner.lock().entries.drain().collect();
        for (id, value) in entries {
            visitor(id, value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// The next stream id that would be allocated.
    pub(crate) fn next_id(&self) -> u32 {
        self.inner.lock().next
    }
}

impl<T> Inner<T> {
    fn allocate(&mut self) -> Option<u32> {
        match self.mode {
            IdMode::Stream => {
                if self.next > MAX_STREAM_ID {
                    return None;
                }
                let id = self.next;
                self.next = self.next.saturating_add(2);
                Some(id)
            }
            IdMode::Reuse => {
                // at most `entries.len() + 1` probes
                loop {
                    let id = self.next;
                    self.next = self.next.wrapping_add(1);
                    if !self.entries.contains_key(&id) {
                        return Some(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn put_then_remove_each() {
        let registry = HandleRegistry::reusing();
        let ids: Vec<u32> = (0..16).map(|n| registry.put(n).unwrap()).collect();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 16);

        for id in &ids {
            assert!(registry.remove(*id).is_some());
            assert!(registry.get(*id).is_none());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn reused_ids_skip_live_entries() {
        let registry = HandleRegistry::reusing();
        registry.inner.lock().next = u32::MAX;

        assert_eq!(registry.put("a"), Some(u32::MAX));
        assert_eq!(registry.put("b"), Some(0));
        registry.inner.lock().next = u32::MAX;
        // u32::MAX and 0 are live, allocation wraps past both
        assert_eq!(registry.put("c"), Some(1));
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let registry = HandleRegistry::streams(3);
        assert_eq!(registry.put(()), Some(3));
        assert_eq!(registry.put(()), Some(5));
        registry.remove(3);
        assert_eq!(registry.put(()), Some(7));

        registry.inner.lock().next = MAX_STREAM_ID;
        assert_eq!(registry.put(()), Some(MAX_STREAM_ID));
        assert_eq!(registry.put(()), None);
    }

    #[test]
    fn failed_put_with_leaves_no_entry() {
        let registry = HandleRegistry::streams(1);
        let result = registry.put_with("x", "exhausted", |_| Err("send failed"));
        assert_eq!(result, Err("send failed"));
        assert!(registry.is_empty());

        let result = registry.put_with("y", "exhausted", |id| if id == 3 { Ok(()) } else { Err("wrong id") });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn remove_if_and_remove_where() {
        let registry = HandleRegistry::streams(1);
        for n in 0..5 {
            registry.put(n);
        }
        assert!(registry.remove_if(1, |value| *value == 1).is_none());
        assert_eq!(registry.remove_if(1, |value| *value == 0), Some(0));

        let removed = registry.remove_where(|id| id > 5);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 2);

        let mut drained = Vec::new();
        registry.drain(|id, _| drained.push(id));
        drained.sort_unstable();
        assert_eq!(drained, vec![3, 5]);
    }

    #[test]
    fn concurrent_put_get_remove() {
        let registry = Arc::new(HandleRegistry::reusing());
        std::thread::scope(|scope| {
            for thread in 0..8u32 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for n in 0..1000u32 {
                        let value = thread * 10_000 + n;
                        let id = registry.put(value).unwrap();
                        assert_eq!(registry.get(id), Some(value));
                        assert_eq!(registry.remove(id), Some(value));
                    }
                });
            }
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn racing_removals_have_one_winner() {
        let registry = Arc::new(HandleRegistry::reusing());
        let id = registry.put(42).unwrap();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || usize::from(registry.remove(id).is_some()))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }
}
