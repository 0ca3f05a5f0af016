//! One consumer's set of PV names, kept in sync by diff.

use std::collections::{BTreeMap, BTreeSet};

use super::{PvCallback, SubscriptionHandle, SubscriptionRegistry};

/// A consumer (a table, a panel) whose PV set changes over time.
///
/// [`set_pv_names`](Self::set_pv_names) only subscribes names that were added
/// and releases names that were removed; names present in both sets keep
/// their registration untouched. Dropping the consumer releases everything
/// in one batch.
pub struct ConsumerSubscription {
    registry: SubscriptionRegistry,
    callback: PvCallback,
    handles: BTreeMap<String, SubscriptionHandle>,
}

impl ConsumerSubscription {
    pub fn new(registry: SubscriptionRegistry, callback: PvCallback) -> Self {
        Self {
            registry,
            callback,
            handles: BTreeMap::new(),
        }
    }

    /// Replace the consumer's PV set. Duplicates in `pv_names` are ignored.
    pub fn set_pv_names<I, S>(&mut self, pv_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = pv_names.into_iter().map(Into::into).collect();

        let removed: Vec<String> =
            self.handles.keys().filter(|name| !wanted.contains(*name)).cloned().collect();
        let added: Vec<String> =
            wanted.iter().filter(|name| !self.handles.contains_key(*name)).cloned().collect();

        if removed.is_empty() && added.is_empty() {
            return;
        }
        log::debug!(
            "[pv-link] Consumer PV set changed: +{} -{}",
            added.len(),
            removed.len()
        );

        if !removed.is_empty() {
            let released: Vec<SubscriptionHandle> =
                removed.iter().filter_map(|name| self.handles.remove(name)).collect();
            self.registry.release_all(released);
        }
        if !added.is_empty() {
            let handles = self.registry.subscribe_many(&added, self.callback.clone());
            for handle in handles {
                self.handles.insert(handle.pv_name().to_string(), handle);
            }
        }
    }

    /// The PV names currently held, sorted.
    pub fn pv_names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every name now.
    pub fn clear(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        self.registry.release_all(handles.into_values());
    }
}

impl Drop for ConsumerSubscription {
    fn drop(&mut self) {
        self.clear();
    }
}
