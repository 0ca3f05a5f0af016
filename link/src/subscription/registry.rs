//! `SubscriptionRegistry`: PV name → callbacks, reference counted.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use super::{PvCallback, SubscriptionSink};
use crate::buffer::UpdateBuffer;
use crate::models::PvValue;

type Entries = HashMap<String, Vec<(u64, PvCallback)>>;

struct RegistryInner {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
    sink: Arc<dyn SubscriptionSink>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove callbacks by id; names left without callbacks are sent to the
    /// sink in one unsubscribe request.
    fn release(&self, registrations: &[(String, u64)]) {
        let mut entries = self.lock();
        let mut emptied = Vec::new();
        for (pv_name, id) in registrations {
            let Some(callbacks) = entries.get_mut(pv_name) else {
                continue;
            };
            callbacks.retain(|(cb_id, _)| cb_id != id);
            if callbacks.is_empty() {
                entries.remove(pv_name);
                emptied.push(pv_name.clone());
            }
        }
        if !emptied.is_empty() {
            log::debug!("[pv-link] No consumers left for {} PV(s)", emptied.len());
            self.sink.unsubscribe(emptied);
        }
    }
}

/// Tracks which PV names are of interest and who wants them.
///
/// The first callback registered for a name sends one subscribe request to
/// the sink; releasing the last one sends an unsubscribe. Cloning shares the
/// same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn SubscriptionSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    /// Register `callback` for `pv_name`.
    ///
    /// The returned handle keeps the registration alive; drop it (or call
    /// [`SubscriptionHandle::unsubscribe`]) to release it.
    #[must_use = "dropping the handle unsubscribes immediately"]
    pub fn subscribe<F>(&self, pv_name: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&str, &PvValue) + Send + Sync + 'static,
    {
        let pv_name = pv_name.into();
        let mut handles = self.subscribe_many(std::slice::from_ref(&pv_name), Arc::new(callback));
        // subscribe_many returns exactly one handle per name.
        match handles.pop() {
            Some(handle) => handle,
            None => SubscriptionHandle::detached(pv_name),
        }
    }

    /// Register one callback under several names at once. Names that gain
    /// their first consumer go to the sink in a single subscribe request.
    #[must_use = "dropping the handles unsubscribes immediately"]
    pub fn subscribe_many(&self, pv_names: &[String], callback: PvCallback) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::with_capacity(pv_names.len());
        let mut entries = self.inner.lock();
        let mut first = Vec::new();
        for pv_name in pv_names {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let callbacks = entries.entry(pv_name.clone()).or_default();
            if callbacks.is_empty() {
                first.push(pv_name.clone());
            }
            callbacks.push((id, callback.clone()));
            handles.push(SubscriptionHandle {
                registry: Arc::downgrade(&self.inner),
                pv_name: pv_name.clone(),
                id,
                released: false,
            });
        }
        if !first.is_empty() {
            log::debug!("[pv-link] First consumer for {} PV(s)", first.len());
            self.inner.sink.subscribe(first);
        }
        handles
    }

    /// Release several handles, batching the resulting unsubscribe request.
    pub fn release_all(&self, handles: impl IntoIterator<Item = SubscriptionHandle>) {
        let registrations: Vec<(String, u64)> = handles
            .into_iter()
            .filter_map(|mut handle| handle.take_registration())
            .collect();
        if !registrations.is_empty() {
            self.inner.release(&registrations);
        }
    }

    /// Invoke every callback registered for `pv_name`.
    ///
    /// Runs over a copy of the callback list with no lock held, so callbacks
    /// may subscribe or unsubscribe. A panicking callback is logged and the
    /// rest still run. Returns how many callbacks completed normally.
    pub fn dispatch(&self, pv_name: &str, value: &PvValue) -> usize {
        let callbacks: Vec<PvCallback> = match self.inner.lock().get(pv_name) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(pv_name, value))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    log::error!("[pv-link] Callback for '{}' panicked: {}", pv_name, msg);
                },
            }
        }
        delivered
    }

    /// Stage the pairs whose names still have consumers; drop the rest.
    ///
    /// The interest check and the staging happen under the registry lock, so
    /// a pair can never be staged after its name's last handle is released.
    pub fn stage_interested<I>(&self, values: I, buffer: &UpdateBuffer) -> usize
    where
        I: IntoIterator<Item = (String, PvValue)>,
    {
        let entries = self.inner.lock();
        let mut staged = 0;
        for (pv_name, value) in values {
            if entries.contains_key(&pv_name) {
                buffer.stage(pv_name, value);
                staged += 1;
            }
        }
        staged
    }

    pub fn contains(&self, pv_name: &str) -> bool {
        self.inner.lock().contains_key(pv_name)
    }

    /// Number of live registrations for `pv_name`.
    pub fn ref_count(&self, pv_name: &str) -> usize {
        self.inner.lock().get(pv_name).map_or(0, Vec::len)
    }

    /// Every PV name with at least one consumer, sorted.
    pub fn active_pv_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every registration and unsubscribe all names.
    /// Handles still held afterwards release nothing.
    pub fn clear(&self) {
        let mut entries = self.inner.lock();
        if entries.is_empty() {
            return;
        }
        let mut names: Vec<String> = entries.drain().map(|(name, _)| name).collect();
        names.sort();
        self.inner.sink.unsubscribe(names);
    }
}

/// One callback's registration for one PV name.
///
/// Released on drop. Dropping after the registry itself is gone is fine.
pub struct SubscriptionHandle {
    registry: Weak<RegistryInner>,
    pv_name: String,
    id: u64,
    released: bool,
}

impl SubscriptionHandle {
    fn detached(pv_name: String) -> Self {
        Self {
            registry: Weak::new(),
            pv_name,
            id: 0,
            released: true,
        }
    }

    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    /// Release the registration now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn take_registration(&mut self) -> Option<(String, u64)> {
        if self.released {
            return None;
        }
        self.released = true;
        Some((self.pv_name.clone(), self.id))
    }

    fn release(&mut self) {
        if let Some(registration) = self.take_registration() {
            if let Some(inner) = self.registry.upgrade() {
                inner.release(std::slice::from_ref(&registration));
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("pv_name", &self.pv_name)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
