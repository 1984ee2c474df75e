//! Per-table subscriptions held by a projection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use yrs::Subscription;

use crate::crdt::{TableHelper, Tables, WorkspaceDocument};

struct Attached {
    helper: TableHelper,
    _subscriptions: Vec<Subscription>,
}

/// Tracks which tables a projection observes.
///
/// A table stays attached after it is tombstoned so that a later revival
/// still reaches the projection.
pub(crate) struct TableObservers {
    tables: Tables,
    attached: Mutex<HashMap<String, Attached>>,
    registry: Mutex<Option<Subscription>>,
}

impl TableObservers {
    pub(crate) fn new(document: &WorkspaceDocument) -> Self {
        Self {
            tables: document.tables(),
            attached: Mutex::new(HashMap::new()),
            registry: Mutex::new(None),
        }
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    fn attached(&self) -> MutexGuard<'_, HashMap<String, Attached>> {
        self.attached.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keep the registry subscription alive until [`clear`](Self::clear).
    pub(crate) fn watch_registry(&self, subscription: Subscription) {
        *self.registry.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
    }

    /// Subscribe to `id` with `subscribe` unless already attached.
    /// Returns true when the table was newly attached.
    pub(crate) fn attach<F>(&self, id: &str, subscribe: F) -> bool
    where
        F: FnOnce(&TableHelper) -> Vec<Subscription>,
    {
        let mut attached = self.attached();
        if attached.contains_key(id) {
            return false;
        }
        let helper = self.tables.open_any(id);
        let subscriptions = subscribe(&helper);
        attached.insert(
            id.to_string(),
            Attached {
                helper,
                _subscriptions: subscriptions,
            },
        );
        log::debug!("Observing table {}", id);
        true
    }

    /// Helper for `id`, attached or not.
    pub(crate) fn helper(&self, id: &str) -> TableHelper {
        if let Some(attached) = self.attached().get(id) {
            return attached.helper.clone();
        }
        self.tables.open_any(id)
    }

    /// Drop every subscription.
    pub(crate) fn clear(&self) {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.attached().clear();
    }
}
