//! In-memory cache of payment-status snapshots keyed by order id.
//!
//! Only terminal snapshots are stored. A terminal order never changes again,
//! so a cached entry can never go stale and polling clients that keep asking
//! after the outcome is known are answered without touching the database.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use model::PaymentStatusView;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    views: HashMap<Uuid, PaymentStatusView>,
    /// Insertion order, oldest first. Holds exactly the keys of `views`.
    order: VecDeque<Uuid>,
}

/// Thread-safe, size-bounded status cache.
#[derive(Debug, Clone)]
pub struct StatusCache {
    inner: Arc<RwLock<Inner>>,
    capacity: usize,
}

impl StatusCache {
    /// Create a new, empty cache holding at most `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            capacity: capacity.max(1),
        }
    }

    /// Get a cloned snapshot by order id (None if not cached).
    pub async fn get(&self, order_id: &Uuid) -> Option<PaymentStatusView> {
        let inner = self.inner.read().await;
        inner.views.get(order_id).cloned()
    }

    /// Stores `view` if it is terminal. Returns whether it was stored.
    ///
    /// When full, the oldest snapshot is dropped to make room.
    pub async fn put(&self, view: PaymentStatusView) -> bool {
        if !view.is_terminal() {
            return false;
        }
        let mut inner = self.inner.write().await;
        let order_id = view.order_id;
        if inner.views.insert(order_id, view).is_none() {
            inner.order.push_back(order_id);
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.views.remove(&oldest);
                }
            }
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.views.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.views.is_empty()
    }
}
