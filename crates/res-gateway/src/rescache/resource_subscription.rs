//! Replica of a single resource, identified by name and query.
//!
//! State transitions:
//!
//! ```text
//! Subscribed ──get──▶ Requested ──┬──▶ Model
//!                                 ├──▶ Collection
//!                                 └──▶ Error (unregistered)
//! ```
//!
//! Models and collections are never mutated in place. Every applied event
//! swaps in a new container, so snapshots handed to subscribers stay valid.

use super::event_subscription::{EventSubscription, HubCtx};
use super::lcs::{self, CollectionEdit};
use super::throttle::Throttle;
use super::{ResourceEvent, Subscriber};
use crate::codec::payloads::{
    create_get_request, decode_add_event, decode_change_event, decode_get_response,
    decode_remove_event, encode_add_event, encode_change_event, encode_remove_event,
};
use crate::codec::{Collection, GetResult, Model, ResourceData, Value};
use crate::domain::error::{codes, ResError, ResResult};
use bytes::Bytes;
use parking_lot::Mutex;
use res_bus::BusError;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Load state, ordered so that everything above `Requested` is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RsState {
    Subscribed,
    Error,
    Requested,
    Collection,
    Model,
}

/// Kind of a loaded resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Model,
    Collection,
}

/// Immutable view of a loaded resource
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Model(Arc<Model>),
    Collection(Arc<Collection>),
}

struct RsInner {
    state: RsState,
    subs: BTreeMap<u64, Arc<dyn Subscriber>>,
    /// Attached subscribers not yet notified of the load
    waiting: BTreeMap<u64, Arc<dyn Subscriber>>,
    resetting: bool,
    links: Vec<String>,
    version: u64,
    model: Option<Arc<Model>>,
    collection: Option<Arc<Collection>>,
    err: Option<ResError>,
}

/// Replica of one resource
pub struct ResourceSubscription {
    query: String,
    hub: Weak<EventSubscription>,
    inner: Mutex<RsInner>,
}

impl ResourceSubscription {
    pub(crate) fn new(hub: &Arc<EventSubscription>, query: &str) -> Arc<Self> {
        Arc::new(Self {
            query: query.to_string(),
            hub: Arc::downgrade(hub),
            inner: Mutex::new(RsInner {
                state: RsState::Subscribed,
                subs: BTreeMap::new(),
                waiting: BTreeMap::new(),
                resetting: false,
                links: Vec::new(),
                version: 0,
                model: None,
                collection: None,
                err: None,
            }),
        })
    }

    /// Normalized query, empty for the base resource
    pub fn query(&self) -> &str {
        &self.query
    }

    pub(crate) fn state(&self) -> RsState {
        self.inner.lock().state
    }

    /// Type of the loaded resource
    pub fn resource_type(&self) -> Option<ResourceType> {
        match self.inner.lock().state {
            RsState::Model => Some(ResourceType::Model),
            RsState::Collection => Some(ResourceType::Collection),
            _ => None,
        }
    }

    /// Current content together with the version it was read at
    pub fn snapshot(&self) -> Option<(Snapshot, u64)> {
        let inner = self.inner.lock();
        let snapshot = match inner.state {
            RsState::Model => Snapshot::Model(inner.model.clone()?),
            RsState::Collection => Snapshot::Collection(inner.collection.clone()?),
            _ => return None,
        };
        Some((snapshot, inner.version))
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    /// Detach a subscriber
    pub fn unsubscribe(self: &Arc<Self>, sub_id: u64) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let rs = self.clone();
        hub.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
            let (removed, empty) = {
                let mut inner = rs.inner.lock();
                inner.waiting.remove(&sub_id);
                let removed = inner.subs.remove(&sub_id).is_some();
                (removed, inner.subs.is_empty())
            };
            // Subscribers taken by an error or a delete are already uncounted
            if !removed {
                return;
            }
            if !rs.query.is_empty() && empty {
                ctx.unregister(&rs);
            }
            ctx.remove_count(1);
        }));
    }

    pub(crate) fn take_links(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().links)
    }

    /// Attach a subscriber, requesting the resource on first use
    pub(crate) fn attach(self: &Arc<Self>, ctx: &mut HubCtx<'_>, sub: Arc<dyn Subscriber>) {
        let mut inner = self.inner.lock();
        match inner.state {
            RsState::Error => {
                let err = inner.err.clone().unwrap_or_else(ResError::internal_error);
                drop(inner);
                ctx.remove_count(1);
                ctx.deliver(move || sub.loaded(Err(err)));
            }
            RsState::Subscribed => {
                inner.subs.insert(sub.id(), sub.clone());
                inner.waiting.insert(sub.id(), sub.clone());
                inner.state = RsState::Requested;
                drop(inner);
                let rs = self.clone();
                let subject = format!("get.{}", ctx.name());
                let throttle = sub.throttle();
                ctx.send_throttled_request(
                    throttle.as_ref(),
                    &subject,
                    create_get_request(&self.query),
                    move |ctx, result| rs.process_get_response(ctx, result),
                );
            }
            RsState::Requested => {
                inner.subs.insert(sub.id(), sub.clone());
                inner.waiting.insert(sub.id(), sub);
            }
            RsState::Model | RsState::Collection => {
                inner.subs.insert(sub.id(), sub.clone());
                drop(inner);
                let rs = self.clone();
                ctx.deliver(move || sub.loaded(Ok(rs)));
            }
        }
    }

    fn process_get_response(self: &Arc<Self>, ctx: &mut HubCtx<'_>, result: Result<Bytes, BusError>) {
        let decoded = result
            .map_err(ResError::from)
            .and_then(|payload| decode_get_response(&payload))
            .and_then(|res| {
                if self.query.is_empty() && !res.query.is_empty() {
                    Err(ResError::internal("query resource returned for a non-query request"))
                } else {
                    Ok(res)
                }
            });

        match decoded {
            Ok(res) => self.load(ctx, res),
            Err(err) => {
                debug!(name = %ctx.name(), query = %self.query, error = %err, "Get request failed");
                let subs: Vec<_> = {
                    let mut inner = self.inner.lock();
                    // Already loaded through a linked query
                    if inner.state > RsState::Requested {
                        return;
                    }
                    inner.state = RsState::Error;
                    inner.err = Some(err.clone());
                    inner.waiting.clear();
                    std::mem::take(&mut inner.subs).into_values().collect()
                };
                ctx.unregister(self);
                ctx.remove_count(subs.len());
                for sub in subs {
                    let err = err.clone();
                    ctx.deliver(move || sub.loaded(Err(err)));
                }
            }
        }
    }

    /// Store a get result and notify every subscriber still waiting for it.
    ///
    /// A response carrying another normalized query links this query to the
    /// canonical resource subscription and moves its subscribers there.
    /// Subscribers waiting on the canonical one are notified as well, so a
    /// later response for it finds nobody left to notify.
    fn load(self: &Arc<Self>, ctx: &mut HubCtx<'_>, res: GetResult) {
        let mut waiting = std::mem::take(&mut self.inner.lock().waiting);
        let target = if res.query != self.query {
            let canonical = ctx.resource_subscription(&res.query);
            if !Arc::ptr_eq(&canonical, self) {
                ctx.state.links.insert(self.query.clone(), canonical.clone());
                ctx.state.queries.remove(&self.query);
                let subs = std::mem::take(&mut self.inner.lock().subs);
                let mut inner = canonical.inner.lock();
                inner.links.push(self.query.clone());
                inner.subs.extend(subs);
            }
            canonical
        } else {
            self.clone()
        };

        {
            let mut inner = target.inner.lock();
            waiting.append(&mut inner.waiting);
            if inner.state <= RsState::Requested {
                inner.version = 0;
                match res.data {
                    ResourceData::Model(model) => {
                        inner.model = Some(Arc::new(model));
                        inner.state = RsState::Model;
                    }
                    ResourceData::Collection(collection) => {
                        inner.collection = Some(Arc::new(collection));
                        inner.state = RsState::Collection;
                    }
                }
            }
        }
        for sub in waiting.into_values() {
            let rs = target.clone();
            ctx.deliver(move || sub.loaded(Ok(rs)));
        }
    }

    /// Apply an event and publish it to every subscriber.
    pub(crate) fn handle_event(self: &Arc<Self>, ctx: &mut HubCtx<'_>, mut ev: ResourceEvent) {
        let mut inner = self.inner.lock();
        if inner.state <= RsState::Requested && ev.event != "reaccess" {
            return;
        }
        ev.version = inner.version;

        let kind = ev.event.clone();
        match kind.as_str() {
            "change" => {
                if inner.resetting || !handle_change(ctx.name(), &mut inner, &mut ev) {
                    return;
                }
            }
            "add" => {
                if inner.resetting || !handle_add(ctx.name(), &mut inner, &mut ev) {
                    return;
                }
            }
            "remove" => {
                if inner.resetting || !handle_remove(ctx.name(), &mut inner, &mut ev) {
                    return;
                }
            }
            "delete" => {
                if inner.resetting {
                    return;
                }
                inner.waiting.clear();
                let subs: Vec<_> = std::mem::take(&mut inner.subs).into_values().collect();
                drop(inner);
                ctx.unregister(self);
                ctx.remove_count(subs.len());
                publish(ctx, subs, ev);
                return;
            }
            _ => {}
        }

        let subs: Vec<_> = inner.subs.values().cloned().collect();
        drop(inner);
        publish(ctx, subs, ev);
    }

    /// Refetch the resource and reconcile the replica with the response
    pub(crate) fn handle_reset_resource(
        self: &Arc<Self>,
        ctx: &mut HubCtx<'_>,
        throttle: Option<&Arc<Throttle>>,
    ) {
        {
            let mut inner = self.inner.lock();
            if inner.resetting || inner.state <= RsState::Requested {
                return;
            }
            inner.resetting = true;
        }
        let rs = self.clone();
        let subject = format!("get.{}", ctx.name());
        let payload = create_get_request(&self.query);
        ctx.send_throttled_request(throttle, &subject, payload, move |ctx, result| {
            rs.inner.lock().resetting = false;
            if !ctx.is_registered(&rs) {
                return;
            }
            rs.process_reset_get_response(ctx, result);
        });
    }

    fn process_reset_get_response(self: &Arc<Self>, ctx: &mut HubCtx<'_>, result: Result<Bytes, BusError>) {
        let state = self.state();
        let decoded: ResResult<ResourceData> = result
            .map_err(ResError::from)
            .and_then(|payload| decode_get_response(&payload))
            .and_then(|res| {
                let same_type = matches!(
                    (&res.data, state),
                    (ResourceData::Model(_), RsState::Model)
                        | (ResourceData::Collection(_), RsState::Collection)
                );
                if same_type {
                    Ok(res.data)
                } else {
                    Err(ResError::internal("mismatching resource type"))
                }
            });

        match decoded {
            Ok(ResourceData::Model(model)) => self.process_reset_model(ctx, model),
            Ok(ResourceData::Collection(collection)) => {
                self.process_reset_collection(ctx, collection)
            }
            Err(err) if err.is(codes::NOT_FOUND) => {
                self.handle_event(ctx, ResourceEvent::new("delete", serde_json::Value::Null));
            }
            Err(err) => {
                warn!(name = %ctx.name(), query = %self.query, error = %err, "Reset get request failed");
            }
        }
    }

    /// Turn the differences against a fresh model into a change event
    pub(crate) fn process_reset_model(self: &Arc<Self>, ctx: &mut HubCtx<'_>, mut props: Model) {
        let Some(current) = self.inner.lock().model.clone() else {
            return;
        };
        for key in current.keys() {
            if !props.contains_key(key) {
                props.insert(key.clone(), Value::Delete);
            }
        }
        props.retain(|key, value| current.get(key) != Some(value));
        if props.is_empty() {
            return;
        }
        self.handle_event(ctx, ResourceEvent::new("change", encode_change_event(&props)));
    }

    /// Turn the differences against a fresh collection into add and remove events
    pub(crate) fn process_reset_collection(self: &Arc<Self>, ctx: &mut HubCtx<'_>, collection: Collection) {
        let Some(current) = self.inner.lock().collection.clone() else {
            return;
        };
        for edit in lcs::diff(&current, &collection) {
            let ev = match edit {
                CollectionEdit::Remove { idx } => {
                    ResourceEvent::new("remove", encode_remove_event(idx))
                }
                CollectionEdit::Add { idx, value } => {
                    ResourceEvent::new("add", encode_add_event(idx, &value))
                }
            };
            self.handle_event(ctx, ev);
        }
    }

    pub(crate) fn handle_reset_access(&self, ctx: &mut HubCtx<'_>, throttle: Option<&Arc<Throttle>>) {
        let subs: Vec<_> = self.inner.lock().subs.values().cloned().collect();
        for sub in subs {
            let throttle = throttle.cloned();
            ctx.deliver(move || sub.reaccess(throttle));
        }
    }
}

impl std::fmt::Debug for ResourceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSubscription")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

fn publish(ctx: &mut HubCtx<'_>, subs: Vec<Arc<dyn Subscriber>>, ev: ResourceEvent) {
    if subs.is_empty() {
        return;
    }
    let ev = Arc::new(ev);
    for sub in subs {
        let ev = ev.clone();
        ctx.deliver(move || sub.event(ev));
    }
}

fn handle_change(name: &str, inner: &mut RsInner, ev: &mut ResourceEvent) -> bool {
    if inner.state == RsState::Collection {
        warn!(name = %name, "Change event on collection");
        return false;
    }
    let mut props = match decode_change_event(&ev.payload) {
        Ok(change) => change.values,
        Err(err) => {
            warn!(name = %name, error = %err, "Invalid change event");
            return false;
        }
    };

    let old = inner.model.clone().unwrap_or_default();
    let mut model: Model = (*old).clone();
    props.retain(|key, value| match value {
        Value::Delete => model.remove(key).is_some(),
        _ if model.get(key) == Some(value) => false,
        _ => {
            model.insert(key.clone(), value.clone());
            true
        }
    });
    if props.is_empty() {
        return false;
    }

    ev.changed = props;
    ev.old_values = Some(old);
    ev.update = true;
    inner.model = Some(Arc::new(model));
    inner.version += 1;
    true
}

fn handle_add(name: &str, inner: &mut RsInner, ev: &mut ResourceEvent) -> bool {
    if inner.state == RsState::Model {
        warn!(name = %name, "Add event on model");
        return false;
    }
    let add = match decode_add_event(&ev.payload) {
        Ok(add) => add,
        Err(err) => {
            warn!(name = %name, error = %err, "Invalid add event");
            return false;
        }
    };
    let current = inner.collection.clone().unwrap_or_default();
    let idx = match usize::try_from(add.idx) {
        Ok(idx) if idx <= current.len() => idx,
        _ => {
            warn!(name = %name, idx = add.idx, len = current.len(), "Add index out of range");
            return false;
        }
    };

    let mut collection = Vec::with_capacity(current.len() + 1);
    collection.extend_from_slice(&current[..idx]);
    collection.push(add.value.clone());
    collection.extend_from_slice(&current[idx..]);

    ev.idx = idx;
    ev.value = Some(add.value);
    ev.update = true;
    inner.collection = Some(Arc::new(collection));
    inner.version += 1;
    true
}

fn handle_remove(name: &str, inner: &mut RsInner, ev: &mut ResourceEvent) -> bool {
    if inner.state == RsState::Model {
        warn!(name = %name, "Remove event on model");
        return false;
    }
    let remove = match decode_remove_event(&ev.payload) {
        Ok(remove) => remove,
        Err(err) => {
            warn!(name = %name, error = %err, "Invalid remove event");
            return false;
        }
    };
    let current = inner.collection.clone().unwrap_or_default();
    let idx = match usize::try_from(remove.idx) {
        Ok(idx) if idx < current.len() => idx,
        _ => {
            warn!(name = %name, idx = remove.idx, len = current.len(), "Remove index out of range");
            return false;
        }
    };

    let mut collection = Vec::with_capacity(current.len() - 1);
    collection.extend_from_slice(&current[..idx]);
    collection.extend_from_slice(&current[idx + 1..]);

    ev.idx = idx;
    ev.value = Some(current[idx].clone());
    ev.update = true;
    inner.collection = Some(Arc::new(collection));
    inner.version += 1;
    true
}
