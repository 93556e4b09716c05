//! # Resource Cache
//!
//! Shared, deduplicated replica of remote resources.
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!  subscribe ───▶ │ ResourceCache (registry)      │
//!  access/call    │   name ──▶ EventSubscription  │ ◀── event.<name>.*
//!                 └───────────────┬───────────────┘
//!                                 │ work queue (one worker at a time)
//!                 ┌───────────────┴───────────────┐
//!                 │ EventSubscription (hub)       │
//!                 │   base / queries / links      │
//!                 │   ──▶ ResourceSubscription    │ ──▶ Subscriber::loaded
//!                 └───────────────────────────────┘     Subscriber::event
//! ```
//!
//! Every mutation of a hub runs as a unit of work drained by the worker pool,
//! so events, get responses and subscriber changes for one resource name are
//! totally ordered. Subscribers are notified after the hub lock is released.

pub mod access;
pub mod cache;
pub mod event_subscription;
pub mod lcs;
pub mod pattern;
pub mod resource_subscription;
pub mod throttle;
pub mod unsub_queue;

pub use access::Access;
pub use cache::{CacheOptions, ResourceCache};
pub use event_subscription::EventSubscription;
pub use lcs::CollectionEdit;
pub use pattern::ResourcePattern;
pub use resource_subscription::{ResourceSubscription, ResourceType, Snapshot};
pub use throttle::{Permit, Throttle};
pub use unsub_queue::UnsubscribeQueue;

use crate::codec::{Model, Value};
use crate::domain::error::ResError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Event applied to a resource and published to its subscribers.
#[derive(Debug, Clone, Default)]
pub struct ResourceEvent {
    /// Event name, such as `change`, `add` or a custom name
    pub event: String,
    /// Raw event data as received
    pub payload: serde_json::Value,
    /// Index of an `add` or `remove`
    pub idx: usize,
    /// Value added or removed
    pub value: Option<Value>,
    /// Properties changed by a `change`
    pub changed: BTreeMap<String, Value>,
    /// Model before a `change`
    pub old_values: Option<Arc<Model>>,
    /// Resource version the event applies to
    pub version: u64,
    /// Whether the event mutated the replica
    pub update: bool,
}

impl ResourceEvent {
    /// Create an event with its raw payload
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
            ..Default::default()
        }
    }
}

/// Receiver of resource loads and events.
///
/// Callbacks are invoked from cache workers without any cache lock held.
/// Implementations must not block.
pub trait Subscriber: Send + Sync {
    /// Identity of the subscriber within the cache
    fn id(&self) -> u64;

    /// Connection ID of the owning connection
    fn cid(&self) -> &str;

    /// Resource name part of the subscribed RID
    fn resource_name(&self) -> &str;

    /// Query part of the subscribed RID
    fn resource_query(&self) -> &str;

    /// Called once with the loaded resource or the error loading it
    fn loaded(&self, result: Result<Arc<ResourceSubscription>, ResError>);

    /// Called for every event on the resource
    fn event(&self, event: Arc<ResourceEvent>);

    /// Called when access to the resource must be checked again. Access
    /// requests triggered by a system reset share the reset throttle.
    fn reaccess(&self, throttle: Option<Arc<Throttle>>);

    /// Throttle limiting the get request that loads the resource
    fn throttle(&self) -> Option<Arc<Throttle>> {
        None
    }
}
