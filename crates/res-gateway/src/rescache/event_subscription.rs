//! Per resource name hub.
//!
//! An [`EventSubscription`] owns the `event.<name>` bus subscription and the
//! resource subscriptions for every query variant of the name. All work on
//! the hub is serialized through its queue:
//!
//! ```text
//!  enqueue ──▶ queue ──┐
//!                      ├──▶ worker (one at a time) ──▶ outbox ──▶ subscribers
//!  unlock  ──▶ locks ──┘    locks drain first
//! ```
//!
//! While a `query` event is replayed, the hub is in a lock phase: only the
//! replay responses run until every one of them has completed.

use super::resource_subscription::{ResourceSubscription, RsState};
use super::unsub_queue::UnsubscribeQueue;
use super::throttle::Throttle;
use super::{ResourceEvent, Subscriber};
use crate::codec::payloads::{
    create_event_query_request, decode_event, decode_event_query_response, decode_query_event,
};
use crate::codec::{EventQueryResult, ResourceData};
use crate::domain::error::codes;
use crate::middleware::metrics::GatewayMetrics;
use bytes::Bytes;
use parking_lot::Mutex;
use res_bus::{BusClient, BusError, Unsubscriber};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace, warn};

/// State shared between the cache and its hubs
pub(crate) struct CacheShared {
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) unsub_queue: UnsubscribeQueue,
    pub(crate) work_tx: Mutex<Option<UnboundedSender<Arc<EventSubscription>>>>,
    pub(crate) metrics: Arc<GatewayMetrics>,
}

/// Unit of work run with the hub locked
pub(crate) type Work = Box<dyn FnOnce(&mut HubCtx<'_>) + Send>;

type Delivery = Box<dyn FnOnce() + Send>;

struct LockPhase {
    /// Unlocks not yet run
    remaining: usize,
    ready: VecDeque<Work>,
}

#[derive(Default)]
pub(crate) struct HubState {
    mq_sub: Option<Box<dyn Unsubscriber>>,
    count: usize,
    pub(crate) base: Option<Arc<ResourceSubscription>>,
    pub(crate) queries: HashMap<String, Arc<ResourceSubscription>>,
    pub(crate) links: HashMap<String, Arc<ResourceSubscription>>,
    queue: VecDeque<Work>,
    locks: Option<LockPhase>,
    scheduled: bool,
}

impl HubState {
    fn next_work(&mut self) -> Option<Work> {
        if let Some(phase) = self.locks.as_mut() {
            if let Some(work) = phase.ready.pop_front() {
                phase.remaining = phase.remaining.saturating_sub(1);
                return Some(work);
            }
            if phase.remaining > 0 {
                return None;
            }
            self.locks = None;
        }
        self.queue.pop_front()
    }

    fn remove_count(&mut self, n: usize, name: &str, queue: &UnsubscribeQueue) {
        if n == 0 {
            return;
        }
        self.count = self.count.saturating_sub(n);
        if self.count == 0 {
            queue.add(name);
        }
    }
}

/// Access to a locked hub from within a unit of work
pub(crate) struct HubCtx<'a> {
    pub(crate) hub: &'a Arc<EventSubscription>,
    pub(crate) state: &'a mut HubState,
    outbox: &'a mut Vec<Delivery>,
}

impl HubCtx<'_> {
    pub(crate) fn name(&self) -> &str {
        &self.hub.name
    }

    /// Queue a subscriber callback to run once the hub is unlocked
    pub(crate) fn deliver(&mut self, f: impl FnOnce() + Send + 'static) {
        self.outbox.push(Box::new(f));
    }

    pub(crate) fn remove_count(&mut self, n: usize) {
        self.state
            .remove_count(n, &self.hub.name, &self.hub.shared.unsub_queue);
    }

    /// Get the resource subscription for a query, creating it if missing.
    ///
    /// Queries normalized to another query resolve through the links.
    pub(crate) fn resource_subscription(&mut self, query: &str) -> Arc<ResourceSubscription> {
        if query.is_empty() {
            if let Some(ref rs) = self.state.base {
                return rs.clone();
            }
            let rs = ResourceSubscription::new(self.hub, "");
            self.state.base = Some(rs.clone());
            return rs;
        }
        if let Some(rs) = self.state.queries.get(query) {
            return rs.clone();
        }
        if let Some(rs) = self.state.links.get(query) {
            return rs.clone();
        }
        let rs = ResourceSubscription::new(self.hub, query);
        self.state.queries.insert(query.to_string(), rs.clone());
        rs
    }

    /// Every registered resource subscription
    pub(crate) fn resource_subscriptions(&self) -> Vec<Arc<ResourceSubscription>> {
        self.state
            .base
            .iter()
            .filter(|rs| rs.query().is_empty())
            .chain(self.state.queries.values())
            .cloned()
            .collect()
    }

    pub(crate) fn is_registered(&self, rs: &Arc<ResourceSubscription>) -> bool {
        let current = if rs.query().is_empty() {
            self.state.base.as_ref()
        } else {
            self.state.queries.get(rs.query())
        };
        current.is_some_and(|c| Arc::ptr_eq(c, rs))
    }

    /// Remove a resource subscription and its aliases from the hub
    pub(crate) fn unregister(&mut self, rs: &Arc<ResourceSubscription>) {
        if rs.query().is_empty() {
            if self.state.base.as_ref().is_some_and(|b| Arc::ptr_eq(b, rs)) {
                self.state.base = None;
            }
        } else if self
            .state
            .queries
            .get(rs.query())
            .is_some_and(|q| Arc::ptr_eq(q, rs))
        {
            self.state.queries.remove(rs.query());
        }
        for link in rs.take_links() {
            if link.is_empty() {
                self.state.base = None;
            } else {
                self.state.links.remove(&link);
            }
        }
    }

    /// Send a request; the response is handled as work on this hub.
    pub(crate) fn send_request(
        &self,
        subject: &str,
        payload: Bytes,
        then: impl FnOnce(&mut HubCtx<'_>, Result<Bytes, BusError>) + Send + 'static,
    ) {
        let hub = self.hub.clone();
        trace!(subject = %subject, "Sending request");
        self.hub.shared.metrics.record_bus_request();
        self.hub.shared.bus.send_request(
            subject,
            payload,
            Box::new(move |result| {
                hub.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| then(ctx, result)));
            }),
        );
    }

    /// Send a request once `throttle` has room for it; the response is
    /// handled as work on this hub.
    pub(crate) fn send_throttled_request(
        &self,
        throttle: Option<&Arc<Throttle>>,
        subject: &str,
        payload: Bytes,
        then: impl FnOnce(&mut HubCtx<'_>, Result<Bytes, BusError>) + Send + 'static,
    ) {
        let Some(throttle) = throttle else {
            return self.send_request(subject, payload, then);
        };
        let hub = self.hub.clone();
        let subject = subject.to_string();
        throttle.add(move |permit| {
            trace!(subject = %subject, "Sending throttled request");
            hub.shared.metrics.record_bus_request();
            let target = hub.clone();
            hub.shared.bus.send_request(
                &subject,
                payload,
                Box::new(move |result| {
                    target.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| then(ctx, result)));
                    drop(permit);
                }),
            );
        });
    }

    /// Send a request whose response is handled in the current lock phase.
    fn send_locked_request(
        &self,
        subject: &str,
        payload: Bytes,
        then: impl FnOnce(&mut HubCtx<'_>, Result<Bytes, BusError>) + Send + 'static,
    ) {
        let hub = self.hub.clone();
        self.hub.shared.metrics.record_bus_request();
        self.hub.shared.bus.send_request(
            subject,
            payload,
            Box::new(move |result| {
                hub.enqueue_unlock(Box::new(move |ctx: &mut HubCtx<'_>| then(ctx, result)));
            }),
        );
    }

    fn lock_events(&mut self, n: usize) {
        if n > 0 {
            self.state.locks = Some(LockPhase {
                remaining: n,
                ready: VecDeque::new(),
            });
        }
    }

    fn unlock_now(&mut self) {
        if let Some(phase) = self.state.locks.as_mut() {
            phase.ready.push_back(Box::new(|_: &mut HubCtx<'_>| {}));
        }
    }
}

/// Hub for every resource sharing a name
pub struct EventSubscription {
    name: String,
    pub(crate) shared: Arc<CacheShared>,
    state: Mutex<HubState>,
}

impl EventSubscription {
    /// Create a hub holding one count
    pub(crate) fn new(name: &str, shared: Arc<CacheShared>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            shared,
            state: Mutex::new(HubState {
                count: 1,
                ..Default::default()
            }),
        })
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of subscribers and in-flight requests holding the hub
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Check whether the bus subscription is active
    pub fn has_bus_subscription(&self) -> bool {
        self.state.lock().mq_sub.is_some()
    }

    /// Number of resource subscriptions, aliases excluded
    pub fn resource_count(&self) -> usize {
        let state = self.state.lock();
        state.base.iter().count() + state.queries.len()
    }

    /// Resource subscription for a query, following aliases
    pub fn resource_subscription(&self, query: &str) -> Option<Arc<ResourceSubscription>> {
        let state = self.state.lock();
        if query.is_empty() {
            return state.base.clone();
        }
        state
            .queries
            .get(query)
            .or_else(|| state.links.get(query))
            .cloned()
    }

    pub(crate) fn add_count(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            self.shared.unsub_queue.remove(&self.name);
        }
        state.count += 1;
    }

    pub(crate) fn release(&self, n: usize) {
        self.state
            .lock()
            .remove_count(n, &self.name, &self.shared.unsub_queue);
    }

    pub(crate) fn set_bus_subscription(&self, sub: Box<dyn Unsubscriber>) {
        self.state.lock().mq_sub = Some(sub);
    }

    /// Queue work on the hub
    pub(crate) fn enqueue(self: &Arc<Self>, work: Work) {
        let schedule = {
            let mut state = self.state.lock();
            state.queue.push_back(work);
            if state.locks.is_none() && !state.scheduled {
                state.scheduled = true;
                true
            } else {
                false
            }
        };
        if schedule {
            self.schedule();
        }
    }

    /// Queue work completing one step of the lock phase
    pub(crate) fn enqueue_unlock(self: &Arc<Self>, work: Work) {
        let schedule = {
            let mut state = self.state.lock();
            match state.locks.as_mut() {
                Some(phase) => phase.ready.push_back(work),
                None => state.queue.push_back(work),
            }
            if state.scheduled {
                false
            } else {
                state.scheduled = true;
                true
            }
        };
        if schedule {
            self.schedule();
        }
    }

    fn schedule(self: &Arc<Self>) {
        let sent = match self.shared.work_tx.lock().as_ref() {
            Some(tx) => tx.send(self.clone()).is_ok(),
            None => false,
        };
        if !sent {
            debug!(name = %self.name, "Cache stopped, work left queued");
            self.state.lock().scheduled = false;
        }
    }

    /// Drain the queue. Called by a cache worker.
    pub(crate) fn process_queue(self: &Arc<Self>) {
        loop {
            let mut outbox: Vec<Delivery> = Vec::new();
            {
                let mut guard = self.state.lock();
                let Some(work) = guard.next_work() else {
                    guard.scheduled = false;
                    return;
                };
                let mut ctx = HubCtx {
                    hub: self,
                    state: &mut *guard,
                    outbox: &mut outbox,
                };
                if catch_unwind(AssertUnwindSafe(|| work(&mut ctx))).is_err() {
                    error!(name = %self.name, "Panic while processing event subscription work");
                }
            }
            for delivery in outbox {
                if catch_unwind(AssertUnwindSafe(delivery)).is_err() {
                    error!(name = %self.name, "Panic in subscriber callback");
                }
            }
        }
    }

    /// Attach a subscriber to the resource subscription of its query
    pub(crate) fn add_subscriber(self: &Arc<Self>, sub: Arc<dyn Subscriber>) {
        self.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
            let rs = ctx.resource_subscription(sub.resource_query());
            rs.attach(ctx, sub);
        }));
    }

    /// Dispatch a message received on `event.<name>.<event>`
    pub(crate) fn enqueue_event(self: &Arc<Self>, subject: String, payload: Bytes) {
        self.shared.metrics.record_bus_event();
        self.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
            let event = match subject.get(ctx.name().len() + 7..) {
                Some(event) if !event.is_empty() => event.to_string(),
                _ => {
                    warn!(subject = %subject, "Malformed event subject");
                    return;
                }
            };
            trace!(subject = %subject, "Event received");

            if event == "query" {
                handle_query_event(ctx, &subject, &payload);
                return;
            }

            let Some(base) = ctx.state.base.clone() else {
                return;
            };
            if !base.query().is_empty() {
                return;
            }
            match decode_event(&payload) {
                Ok(data) => base.handle_event(ctx, ResourceEvent::new(event, data)),
                Err(err) => warn!(subject = %subject, error = %err, "Invalid event payload"),
            }
        }));
    }

    /// Refetch every resource subscription
    pub(crate) fn handle_reset_resource(self: &Arc<Self>, throttle: Option<Arc<Throttle>>) {
        self.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
            for rs in ctx.resource_subscriptions() {
                rs.handle_reset_resource(ctx, throttle.as_ref());
            }
        }));
    }

    /// Ask every subscriber to check access again
    pub(crate) fn handle_reset_access(self: &Arc<Self>, throttle: Option<Arc<Throttle>>) {
        self.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
            for rs in ctx.resource_subscriptions() {
                rs.handle_reset_access(ctx, throttle.as_ref());
            }
        }));
    }

    /// Release the bus subscription if nothing holds the hub.
    ///
    /// Returns true if the hub may be dropped from the registry.
    pub(crate) fn mq_unsubscribe(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            return false;
        }
        state.queue.clear();
        state.locks = None;
        if let Some(sub) = state.mq_sub.as_ref() {
            if let Err(err) = sub.unsubscribe() {
                error!(name = %self.name, error = %err, "Failed to unsubscribe from bus");
                return false;
            }
        }
        state.mq_sub = None;
        state.base = None;
        state.queries.clear();
        state.links.clear();
        true
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn handle_query_event(ctx: &mut HubCtx<'_>, subject: &str, payload: &[u8]) {
    if ctx.state.queries.is_empty() {
        return;
    }
    let query_event = match decode_event(payload).and_then(|data| decode_query_event(&data)) {
        Ok(ev) => ev,
        Err(err) => {
            warn!(subject = %subject, error = %err, "Invalid query event");
            return;
        }
    };
    if query_event.subject.is_empty() {
        warn!(subject = %subject, "Query event missing subject");
        return;
    }

    let queries: Vec<(String, Arc<ResourceSubscription>)> = ctx
        .state
        .queries
        .iter()
        .map(|(q, rs)| (q.clone(), rs.clone()))
        .collect();
    ctx.lock_events(queries.len());

    for (query, rs) in queries {
        if rs.state() <= RsState::Requested {
            ctx.unlock_now();
            continue;
        }
        ctx.send_locked_request(
            &query_event.subject,
            create_event_query_request(&query),
            move |ctx, result| {
                let payload = match result {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!(name = %ctx.name(), query = %query, error = %err, "Event query failed");
                        return;
                    }
                };
                match decode_event_query_response(&payload) {
                    Ok(EventQueryResult::Events(events)) => {
                        for ev in events {
                            rs.handle_event(ctx, ResourceEvent::new(ev.event, ev.data));
                        }
                    }
                    Ok(EventQueryResult::Data(ResourceData::Model(model))) => {
                        if rs.state() == RsState::Model {
                            rs.process_reset_model(ctx, model);
                        } else {
                            warn!(name = %ctx.name(), query = %query, "Event query returned a model for a collection");
                        }
                    }
                    Ok(EventQueryResult::Data(ResourceData::Collection(collection))) => {
                        if rs.state() == RsState::Collection {
                            rs.process_reset_collection(ctx, collection);
                        } else {
                            warn!(name = %ctx.name(), query = %query, "Event query returned a collection for a model");
                        }
                    }
                    Err(err) if err.is(codes::NOT_FOUND) => {
                        rs.handle_event(ctx, ResourceEvent::new("delete", serde_json::Value::Null));
                    }
                    Err(err) => {
                        warn!(name = %ctx.name(), query = %query, error = %err, "Invalid event query response");
                    }
                }
            },
        );
    }
}
