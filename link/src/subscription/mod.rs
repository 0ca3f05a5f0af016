//! Reference-counted interest in PV names.
//!
//! - [`registry`]: the [`SubscriptionRegistry`] shared by every consumer and
//!   the handles it hands out
//! - [`consumer`]: [`ConsumerSubscription`], one consumer's changing set of
//!   PV names, re-subscribed by diff

pub mod consumer;
pub mod registry;

use std::sync::Arc;

use crate::connection::TransportChannel;
use crate::models::PvValue;

pub use consumer::ConsumerSubscription;
pub use registry::{SubscriptionHandle, SubscriptionRegistry};

/// Callback invoked with `(pv_name, value)` for every published sample.
pub type PvCallback = Arc<dyn Fn(&str, &PvValue) + Send + Sync>;

/// Where the registry sends subscribe/unsubscribe requests.
///
/// Calls are made while the registry lock is held so that requests for the
/// same name reach the sink in the order the registry decided them.
/// Implementations must not block and must not call back into the registry.
pub trait SubscriptionSink: Send + Sync {
    /// The first consumer for each of these names has registered.
    fn subscribe(&self, pv_names: Vec<String>);

    /// The last consumer for each of these names has gone away.
    fn unsubscribe(&self, pv_names: Vec<String>);
}

impl SubscriptionSink for TransportChannel {
    fn subscribe(&self, pv_names: Vec<String>) {
        TransportChannel::subscribe(self, pv_names);
    }

    fn unsubscribe(&self, pv_names: Vec<String>) {
        TransportChannel::unsubscribe(self, pv_names);
    }
}
