use crate::model::RequestId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Holds the caller context of each in-flight request until the matching
/// asynchronous response arrives. Entries are consumed on retrieval, so a
/// response is delivered to exactly one caller even under concurrent access.
///
/// The protocol offers no signal that a response will never arrive, so by
/// default unmatched entries live forever. A `max_pending` bound makes that
/// leak visible instead: the oldest entry is evicted with a warning once the
/// bound is hit.
pub struct PendingStore<T> {
    inner: Mutex<Inner<T>>,
    max_pending: Option<usize>,
}

struct Inner<T> {
    entries: HashMap<String, T>,
    order: VecDeque<String>,
}

impl<T: Clone> PendingStore<T> {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_pending,
        }
    }

    /// Insert (or overwrite) the context for a request id. A missing id is a
    /// no-op. The context is cloned on the way in so later mutation of the
    /// caller's copy is not visible to the eventual retriever.
    pub fn store(&self, request_id: Option<&RequestId>, context: &T) {
        let Some(request_id) = request_id else {
            return;
        };
        let key = request_id.key();
        let mut inner = self.inner.lock().expect("pending store poisoned");
        if inner.entries.insert(key.clone(), context.clone()).is_none() {
            inner.order.push_back(key);
        }
        if let Some(max) = self.max_pending {
            while inner.entries.len() > max {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if inner.entries.remove(&oldest).is_some() {
                    tracing::warn!(key = %oldest, "evicting unmatched pending request");
                }
            }
        }
    }

    /// Remove and return the context for a request id. Absent ids and unknown
    /// keys yield `None` without blocking.
    pub fn retrieve(&self, request_id: Option<&RequestId>) -> Option<T> {
        let request_id = request_id?;
        let key = request_id.key();
        let mut inner = self.inner.lock().expect("pending store poisoned");
        let context = inner.entries.remove(&key)?;
        inner.order.retain(|k| k != &key);
        Some(context)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending store poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
