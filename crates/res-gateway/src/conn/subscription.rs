//! Client subscriptions and the per-connection subscription graph.
//!
//! A client subscription wraps one resource subscription for one
//! connection. Collections and models may reference other resources; those
//! are subscribed indirectly and tracked in `refs`, forming a graph keyed
//! by RID.
//!
//! ```text
//!   Loading ──loaded──▶ Loaded ──get_rpc_resources──▶ ToSend ──release──▶ Sent
//!      │                   (refs loading)
//!      └──error──▶ Ready
//! ```
//!
//! Events are queued while a subscription is being assembled for the client
//! or while access is rechecked, and replayed in order once released.
//!
//! All methods run on the connection worker.

use super::connection::Conn;
use crate::codec::{Model, Value};
use crate::domain::error::{codes, ResError, ResResult};
use crate::rescache::{
    Access, ResourceEvent, ResourceSubscription, ResourceType, Snapshot, Subscriber, Throttle,
};
use crate::rpc::frames::{to_value, AddEvent, ChangeEvent, Resources, UnsubscribeEvent};
use crate::rpc::version;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Reasons for holding back events
pub(crate) const QUEUE_LOADING: u8 = 1 << 0;
pub(crate) const QUEUE_REACCESS: u8 = 1 << 1;

const FLAG_ACCESS_CALLED: u8 = 1 << 0;
const FLAG_REACCESS: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SubState {
    Disposed,
    Loading,
    Loaded,
    Ready,
    ToSend,
    Sent,
    Deleted,
}

/// Work run on the connection once a set of subscriptions is loaded
pub(crate) type ReadyFn = Box<dyn FnOnce(&mut Conn) + Send>;

/// Work run with the access decision for a subscription
pub(crate) type AccessFn = Box<dyn FnOnce(&mut Conn, &Access) + Send>;

/// Pending `on_ready` call waiting for a subscription tree to load
pub(crate) struct ReadyCallback {
    ref_map: HashSet<String>,
    loading: usize,
    cb: ReadyFn,
}

/// One resource subscribed by a connection
pub(crate) struct ClientSubscription {
    pub(crate) id: u64,
    pub(crate) rid: String,
    pub(crate) name: String,
    pub(crate) query: String,
    pub(crate) state: SubState,
    ready_callbacks: Vec<u64>,
    resource: Option<Arc<ResourceSubscription>>,
    data: Option<Snapshot>,
    version: u64,
    /// Referenced RID and the number of values referencing it
    pub(crate) refs: BTreeMap<String, usize>,
    err: Option<ResError>,
    queue_flag: u8,
    event_queue: VecDeque<Arc<ResourceEvent>>,
    access: Option<Access>,
    access_callbacks: Vec<AccessFn>,
    flags: u8,
    pub(crate) direct: usize,
    pub(crate) indirect: usize,
    /// Shared by the subscription tree until it is loaded
    pub(crate) throttle: Option<Arc<Throttle>>,
}

impl ClientSubscription {
    pub(crate) fn new(rid: &str, name: &str, query: &str) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            rid: rid.to_string(),
            name: name.to_string(),
            query: query.to_string(),
            state: SubState::Loading,
            ready_callbacks: Vec::new(),
            resource: None,
            data: None,
            version: 0,
            refs: BTreeMap::new(),
            err: None,
            queue_flag: QUEUE_LOADING,
            event_queue: VecDeque::new(),
            access: None,
            access_callbacks: Vec::new(),
            flags: 0,
            direct: 0,
            indirect: 0,
            throttle: None,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state >= SubState::Ready
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.state == SubState::Sent
    }

    pub(crate) fn error(&self) -> Option<ResError> {
        if self.state == SubState::Disposed {
            return Some(ResError::disposed_subscription());
        }
        self.err.clone()
    }

    pub(crate) fn data(&self) -> Option<&Snapshot> {
        self.data.as_ref()
    }

    /// Keep the local copy in step with an applied update event
    fn apply(&mut self, ev: &ResourceEvent) {
        match (&mut self.data, ev.event.as_str()) {
            (Some(Snapshot::Model(model)), "change") => {
                let model: &mut Model = Arc::make_mut(model);
                for (key, value) in &ev.changed {
                    match value {
                        Value::Delete => {
                            model.remove(key);
                        }
                        v => {
                            model.insert(key.clone(), v.clone());
                        }
                    }
                }
            }
            (Some(Snapshot::Collection(collection)), "add") => {
                if let Some(ref value) = ev.value {
                    let collection = Arc::make_mut(collection);
                    if ev.idx <= collection.len() {
                        collection.insert(ev.idx, value.clone());
                    }
                }
            }
            (Some(Snapshot::Collection(collection)), "remove") => {
                let collection = Arc::make_mut(collection);
                if ev.idx < collection.len() {
                    collection.remove(ev.idx);
                }
            }
            _ => {}
        }
    }
}

/// Cache subscriber forwarding loads and events onto the owning connection
pub(crate) struct ConnSubscriber {
    pub(crate) id: u64,
    pub(crate) rid: String,
    pub(crate) name: String,
    pub(crate) query: String,
    pub(crate) conn: super::ConnHandle,
    pub(crate) throttle: Option<Arc<Throttle>>,
}

impl Subscriber for ConnSubscriber {
    fn id(&self) -> u64 {
        self.id
    }

    fn cid(&self) -> &str {
        self.conn.cid()
    }

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_query(&self) -> &str {
        &self.query
    }

    fn loaded(&self, result: Result<Arc<ResourceSubscription>, ResError>) {
        let rs = result.as_ref().ok().cloned();
        let (rid, id) = (self.rid.clone(), self.id);
        if !self.conn.enqueue(move |c| c.sub_loaded(&rid, id, result)) {
            if let Some(rs) = rs {
                rs.unsubscribe(id);
            }
        }
    }

    fn event(&self, event: Arc<ResourceEvent>) {
        if event.event == "reaccess" {
            return self.reaccess(None);
        }
        let (rid, id) = (self.rid.clone(), self.id);
        self.conn.enqueue(move |c| c.sub_event(&rid, id, event));
    }

    fn reaccess(&self, throttle: Option<Arc<Throttle>>) {
        let (rid, id) = (self.rid.clone(), self.id);
        self.conn.enqueue(move |c| {
            if c.is_live(&rid, id) {
                c.reaccess(&rid, throttle);
            }
        });
    }

    fn throttle(&self) -> Option<Arc<Throttle>> {
        self.throttle.clone()
    }
}

impl Conn {
    /// Check that `rid` still maps to the subscription with `id`
    pub(crate) fn is_live(&self, rid: &str, id: u64) -> bool {
        self.subs.get(rid).is_some_and(|s| s.id == id)
    }

    /// Error of a subscription; a missing one counts as disposed
    pub(crate) fn sub_error(&self, rid: &str) -> Option<ResError> {
        match self.subs.get(rid) {
            Some(sub) => sub.error(),
            None => Some(ResError::disposed_subscription()),
        }
    }

    // ---- Loading --------------------------------------------------------

    pub(crate) fn sub_loaded(
        &mut self,
        rid: &str,
        id: u64,
        result: Result<Arc<ResourceSubscription>, ResError>,
    ) {
        if !self.is_live(rid, id) {
            if let Ok(rs) = result {
                rs.unsubscribe(id);
            }
            return;
        }
        if self.subs.get(rid).is_some_and(|s| s.state != SubState::Loading) {
            trace!(cid = %self.cid(), rid = %rid, "Ignoring repeated load");
            return;
        }

        let rs = match result {
            Ok(rs) => rs,
            Err(err) => {
                trace!(cid = %self.cid(), rid = %rid, error = %err, "Subscription failed to load");
                if let Some(sub) = self.subs.get_mut(rid) {
                    sub.err = Some(err);
                }
                self.done_loading(rid);
                return;
            }
        };

        let Some((snapshot, version)) = rs.snapshot() else {
            if let Some(sub) = self.subs.get_mut(rid) {
                sub.err = Some(ResError::internal("resource has no content"));
            }
            self.done_loading(rid);
            return;
        };

        let references: Vec<String> = match snapshot {
            Snapshot::Model(ref m) => m.values().filter_map(Value::reference).map(str::to_string).collect(),
            Snapshot::Collection(ref c) => c.iter().filter_map(Value::reference).map(str::to_string).collect(),
        };

        if let Some(sub) = self.subs.get_mut(rid) {
            sub.resource = Some(rs);
            sub.state = SubState::Loaded;
            sub.queue_flag |= QUEUE_LOADING;
        }

        for reference in references {
            if let Err(err) = self.add_reference(rid, &reference) {
                debug!(cid = %self.cid(), rid = %rid, reference = %reference, "Failed to subscribe to reference");
                let refs = match self.subs.get_mut(rid) {
                    Some(sub) => {
                        sub.err = Some(err);
                        std::mem::take(&mut sub.refs)
                    }
                    None => return,
                };
                for child in refs.keys() {
                    self.unsubscribe(child, false, 1, true);
                }
                self.done_loading(rid);
                return;
            }
        }

        let rcbs = match self.subs.get_mut(rid) {
            Some(sub) => {
                sub.data = Some(snapshot);
                sub.version = version;
                std::mem::take(&mut sub.ready_callbacks)
            }
            None => return,
        };
        for rcb in rcbs {
            self.collect_refs(rid, rcb);
        }
    }

    /// Run `cb` once the subscription and everything it references is loaded
    pub(crate) fn on_ready(&mut self, rid: &str, cb: impl FnOnce(&mut Conn) + Send + 'static) {
        if !self.subs.get(rid).is_some_and(|s| !s.is_ready()) {
            return cb(self);
        }
        let rcb = self.next_ready;
        self.next_ready += 1;
        self.ready.insert(
            rcb,
            ReadyCallback {
                ref_map: HashSet::new(),
                loading: 0,
                cb: Box::new(cb),
            },
        );
        self.on_loaded(rid, rcb);
    }

    fn on_loaded(&mut self, rid: &str, rcb: u64) {
        let Some(ready) = self.ready.get_mut(&rcb) else {
            return;
        };
        ready.ref_map.insert(rid.to_string());
        ready.loading += 1;

        let Some(sub) = self.subs.get_mut(rid) else {
            return self.collect_refs(rid, rcb);
        };
        if sub.state >= SubState::Loaded {
            self.collect_refs(rid, rcb);
        } else {
            sub.ready_callbacks.push(rcb);
        }
    }

    fn collect_refs(&mut self, rid: &str, rcb: u64) {
        let children: Vec<String> = self
            .subs
            .get(rid)
            .map(|s| s.refs.keys().cloned().collect())
            .unwrap_or_default();

        for child in children {
            let ready = self.subs.get(&child).map_or(true, |s| s.is_ready());
            let seen = self
                .ready
                .get(&rcb)
                .map_or(true, |r| r.ref_map.contains(&child));
            if ready || seen {
                continue;
            }
            self.on_loaded(&child, rcb);
        }

        if let Some(ready) = self.ready.get_mut(&rcb) {
            ready.loading -= 1;
        }
        self.test_ready(rcb);
    }

    fn test_ready(&mut self, rcb: u64) {
        if self.ready.get(&rcb).is_some_and(|r| r.loading == 0) {
            if let Some(ready) = self.ready.remove(&rcb) {
                (ready.cb)(self);
            }
        }
    }

    fn done_loading(&mut self, rid: &str) {
        let rcbs = match self.subs.get_mut(rid) {
            Some(sub) => {
                sub.state = SubState::Ready;
                sub.throttle = None;
                std::mem::take(&mut sub.ready_callbacks)
            }
            None => return,
        };
        for rcb in rcbs {
            if let Some(ready) = self.ready.get_mut(&rcb) {
                ready.loading -= 1;
            }
            self.test_ready(rcb);
        }
    }

    // ---- Sending resources ----------------------------------------------

    /// Collect every resource of the tree not yet sent to the client.
    ///
    /// Events are held until [`Conn::release_rpc_resources`] is called.
    pub(crate) fn get_rpc_resources(&mut self, rid: &str) -> Resources {
        let mut r = Resources::default();
        self.populate_resources(rid, &mut r);
        r
    }

    pub(crate) fn populate_resources(&mut self, rid: &str, r: &mut Resources) {
        let legacy = self.protocol() < version::SOFT_REFERENCE_AND_DATA_VALUE;
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        if matches!(sub.state, SubState::Sent | SubState::ToSend) {
            return;
        }
        if let Some(err) = sub.error() {
            r.errors.insert(rid.to_string(), err);
            return;
        }
        match sub.data {
            Some(Snapshot::Model(ref model)) => {
                r.models.insert(rid.to_string(), encode_model(model, legacy));
            }
            Some(Snapshot::Collection(ref collection)) => {
                r.collections
                    .insert(rid.to_string(), encode_collection(collection, legacy));
            }
            None => return,
        }
        sub.state = SubState::ToSend;

        let children: Vec<String> = sub.refs.keys().cloned().collect();
        for child in children {
            self.populate_resources(&child, r);
        }
    }

    /// Mark the tree as sent and replay held events
    pub(crate) fn release_rpc_resources(&mut self, rid: &str) {
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        if matches!(sub.state, SubState::Disposed | SubState::Sent) || sub.err.is_some() {
            return;
        }
        sub.state = SubState::Sent;
        let children: Vec<String> = sub.refs.keys().cloned().collect();
        for child in children {
            self.release_rpc_resources(&child);
        }
        self.unqueue_events(rid, QUEUE_LOADING);
    }

    fn queue_events(&mut self, rid: &str, reason: u8) {
        if let Some(sub) = self.subs.get_mut(rid) {
            sub.queue_flag |= reason;
        }
    }

    fn unqueue_events(&mut self, rid: &str, reason: u8) {
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        sub.queue_flag &= !reason;
        if sub.queue_flag != 0 {
            return;
        }

        if sub.flags & FLAG_REACCESS != 0 {
            self.handle_reaccess(rid, None);
            if self.subs.get(rid).map_or(true, |s| s.queue_flag != 0) {
                return;
            }
        }

        loop {
            let Some(sub) = self.subs.get_mut(rid) else {
                return;
            };
            if sub.queue_flag != 0 {
                return;
            }
            let Some(ev) = sub.event_queue.pop_front() else {
                return;
            };
            self.process_event(rid, ev);
        }
    }

    // ---- Events ---------------------------------------------------------

    pub(crate) fn sub_event(&mut self, rid: &str, id: u64, ev: Arc<ResourceEvent>) {
        if !self.is_live(rid, id) {
            return;
        }
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        // Events before the resource is loaded are covered by its content
        if sub.resource.is_none() {
            return;
        }
        if sub.queue_flag != 0 {
            sub.event_queue.push_back(ev);
            return;
        }
        self.process_event(rid, ev);
    }

    fn process_event(&mut self, rid: &str, ev: Arc<ResourceEvent>) {
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        if sub.version != ev.version {
            return;
        }
        if ev.update {
            sub.version += 1;
            sub.apply(&ev);
        }

        let kind = match sub.data {
            Some(Snapshot::Collection(_)) => ResourceType::Collection,
            Some(Snapshot::Model(_)) => ResourceType::Model,
            None => return,
        };
        match kind {
            ResourceType::Collection => self.process_collection_event(rid, ev),
            ResourceType::Model => self.process_model_event(rid, ev),
        }
    }

    fn process_collection_event(&mut self, rid: &str, ev: Arc<ResourceEvent>) {
        match ev.event.as_str() {
            "add" => {
                let Some(value) = ev.value.clone() else {
                    return;
                };
                let idx = ev.idx;
                let Some(child) = value.reference().map(str::to_string) else {
                    let legacy = self.protocol() < version::SOFT_REFERENCE_AND_DATA_VALUE;
                    let data = to_value(&AddEvent {
                        idx,
                        value: encode_value(&value, legacy),
                        resources: Resources::default(),
                    });
                    return self.send_event(rid, "add", &data);
                };

                if let Err(err) = self.add_reference(rid, &child) {
                    error!(cid = %self.cid(), rid = %rid, reference = %child, error = %err, "Error subscribing to added resource");
                    return;
                }
                if self.subs.get(&child).is_some_and(|s| s.is_sent()) {
                    let data = to_value(&AddEvent {
                        idx,
                        value: value.to_json(),
                        resources: Resources::default(),
                    });
                    return self.send_event(rid, "add", &data);
                }

                self.queue_events(rid, QUEUE_LOADING);
                let parent = rid.to_string();
                let id = self.subs.get(rid).map_or(0, |s| s.id);
                let target = child.clone();
                self.on_ready(&target, move |c| {
                    if !c.is_live(&parent, id) {
                        return;
                    }
                    let resources = c.get_rpc_resources(&child);
                    let data = to_value(&AddEvent {
                        idx,
                        value: value.to_json(),
                        resources,
                    });
                    c.send_event(&parent, "add", &data);
                    c.release_rpc_resources(&child);
                    c.unqueue_events(&parent, QUEUE_LOADING);
                });
            }
            "remove" => {
                if let Some(Value::Reference(ref child)) = ev.value {
                    self.remove_reference(rid, child);
                }
                self.send_event(rid, "remove", &ev.payload);
            }
            "delete" => self.handle_delete(rid, &ev),
            name => self.send_event(rid, name, &ev.payload),
        }
    }

    fn process_model_event(&mut self, rid: &str, ev: Arc<ResourceEvent>) {
        match ev.event.as_str() {
            "change" => {
                let mut unsent: Vec<String> = Vec::new();
                for value in ev.changed.values() {
                    if let Value::Reference(ref child) = value {
                        if let Err(err) = self.add_reference(rid, child) {
                            error!(cid = %self.cid(), rid = %rid, reference = %child, error = %err, "Error subscribing to changed reference");
                            return;
                        }
                        if !self.subs.get(child).is_some_and(|s| s.is_sent()) {
                            unsent.push(child.clone());
                        }
                    }
                }

                // Release replaced references after adding new ones, so a
                // reference moved between properties is kept
                if let Some(ref old) = ev.old_values {
                    for key in ev.changed.keys() {
                        if let Some(Value::Reference(child)) = old.get(key) {
                            self.remove_reference(rid, child);
                        }
                    }
                }

                let legacy = self.protocol() < version::SOFT_REFERENCE_AND_DATA_VALUE;
                let values = encode_model(&ev.changed, legacy);
                if unsent.is_empty() {
                    let data = to_value(&ChangeEvent {
                        values,
                        resources: Resources::default(),
                    });
                    return self.send_event(rid, "change", &data);
                }

                self.queue_events(rid, QUEUE_LOADING);
                let remaining = Arc::new(AtomicUsize::new(unsent.len()));
                let id = self.subs.get(rid).map_or(0, |s| s.id);
                for child in unsent.clone() {
                    let parent = rid.to_string();
                    let remaining = remaining.clone();
                    let unsent = unsent.clone();
                    let values = values.clone();
                    self.on_ready(&child, move |c| {
                        if !c.is_live(&parent, id) {
                            return;
                        }
                        if remaining.fetch_sub(1, Ordering::Relaxed) > 1 {
                            return;
                        }
                        let mut resources = Resources::default();
                        for child in &unsent {
                            c.populate_resources(child, &mut resources);
                        }
                        let data = to_value(&ChangeEvent { values, resources });
                        c.send_event(&parent, "change", &data);
                        for child in &unsent {
                            c.release_rpc_resources(child);
                        }
                        c.unqueue_events(&parent, QUEUE_LOADING);
                    });
                }
            }
            "delete" => self.handle_delete(rid, &ev),
            name => self.send_event(rid, name, &ev.payload),
        }
    }

    fn handle_delete(&mut self, rid: &str, ev: &ResourceEvent) {
        if let Some(sub) = self.subs.get_mut(rid) {
            sub.state = SubState::Deleted;
        }
        self.send_event(rid, "delete", &ev.payload);
        self.unsubscribe_direct(rid, ResError::deleted());
    }

    // ---- References -----------------------------------------------------

    fn add_reference(&mut self, parent: &str, child: &str) -> ResResult<()> {
        if let Some(count) = self.subs.get_mut(parent).and_then(|s| s.refs.get_mut(child)) {
            *count += 1;
            return Ok(());
        }
        let throttle = self.subs.get(parent).and_then(|s| s.throttle.clone());
        self.subscribe_throttled(child, false, throttle)?;
        if let Some(sub) = self.subs.get_mut(parent) {
            sub.refs.insert(child.to_string(), 1);
        }
        Ok(())
    }

    fn remove_reference(&mut self, parent: &str, child: &str) {
        let Some(sub) = self.subs.get_mut(parent) else {
            return;
        };
        let Some(count) = sub.refs.get_mut(child) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            sub.refs.remove(child);
            self.unsubscribe(child, false, 1, true);
        }
    }

    // ---- Access ---------------------------------------------------------

    /// Load access for a subscription, sharing one request between callers
    pub(crate) fn load_access(&mut self, rid: &str, cb: AccessFn) {
        self.load_access_throttled(rid, cb, None)
    }

    /// Load access, sending the request through `throttle` if set
    fn load_access_throttled(&mut self, rid: &str, cb: AccessFn, throttle: Option<Arc<Throttle>>) {
        let token = self.token().cloned();
        let cid = self.cid().to_string();
        let Some(sub) = self.subs.get_mut(rid) else {
            let access = Access::error(ResError::disposed_subscription());
            return cb(self, &access);
        };
        if let Some(access) = sub.access.clone() {
            return cb(self, &access);
        }
        sub.access_callbacks.push(cb);
        if sub.flags & FLAG_ACCESS_CALLED != 0 {
            return;
        }
        sub.flags |= FLAG_ACCESS_CALLED;

        let request = crate::codec::Request {
            token,
            query: sub.query.clone(),
            cid,
            ..Default::default()
        };
        let name = sub.name.clone();
        let (rid, id) = (rid.to_string(), sub.id);
        let handle = self.handle().clone();
        let cache = self.cache().clone();
        Throttle::run(throttle.as_ref(), move |permit| {
            cache.access(&name, &request, move |access| {
                handle.enqueue(move |c| c.access_loaded(&rid, id, access));
                drop(permit);
            });
        });
    }

    fn access_loaded(&mut self, rid: &str, id: u64, access: Access) {
        if !self.is_live(rid, id) {
            return;
        }
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        sub.flags &= !FLAG_ACCESS_CALLED;
        // Only keep actual results and denials
        if access.err().map_or(true,|e| e.is(codes::ACCESS_DENIED)) {
            sub.access = Some(access.clone());
        }
        let cbs = std::mem::take(&mut sub.access_callbacks);
        for cb in cbs {
            cb(self, &access);
        }
    }

    /// Check read access; granted while referenced by another resource
    pub(crate) fn can_get(
        &mut self,
        rid: &str,
        cb: impl FnOnce(&mut Conn, ResResult<()>) + Send + 'static,
    ) {
        if self.subs.get(rid).is_some_and(|s| s.indirect > 0) {
            return cb(self, Ok(()));
        }
        self.load_access(rid, Box::new(move |c, access| cb(c, access.can_get())));
    }

    /// Check access to call `action`
    pub(crate) fn can_call(
        &mut self,
        rid: &str,
        action: &str,
        cb: impl FnOnce(&mut Conn, ResResult<()>) + Send + 'static,
    ) {
        let action = action.to_string();
        self.load_access(rid, Box::new(move |c, access| cb(c, access.can_call(&action))));
    }

    /// Recheck access, or defer until queued events are released
    pub(crate) fn reaccess(&mut self, rid: &str, throttle: Option<Arc<Throttle>>) {
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        if sub.state == SubState::Disposed {
            return;
        }
        if sub.queue_flag != 0 {
            sub.flags |= FLAG_REACCESS;
            return;
        }
        self.handle_reaccess(rid, throttle);
    }

    fn handle_reaccess(&mut self, rid: &str, throttle: Option<Arc<Throttle>>) {
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        sub.access = None;
        sub.flags &= !FLAG_REACCESS;
        if sub.direct == 0 {
            return;
        }

        sub.queue_flag |= QUEUE_REACCESS;
        let rid_owned = rid.to_string();
        self.load_access_throttled(
            rid,
            Box::new(move |c, access| {
                if let Err(reason) = access.can_get() {
                    c.unsubscribe_direct(&rid_owned, reason);
                }
                c.unqueue_events(&rid_owned, QUEUE_REACCESS);
            }),
            throttle,
        );
    }

    /// Drop every direct subscription and tell the client why
    fn unsubscribe_direct(&mut self, rid: &str, reason: ResError) {
        let direct = self.subs.get(rid).map_or(0, |s| s.direct);
        if direct == 0 {
            return;
        }
        debug!(cid = %self.cid(), rid = %rid, reason = %reason, "Unsubscribing client");
        self.unsubscribe(rid, true, direct, true);
        let data = to_value(&UnsubscribeEvent { reason });
        self.send_event(rid, "unsubscribe", &data);
    }

    // ---- Disposal -------------------------------------------------------

    /// Release the resource subscription and references of a subscription
    pub(crate) fn dispose_subscription(&mut self, mut sub: ClientSubscription) {
        if sub.state == SubState::Disposed {
            return;
        }
        let state = sub.state;
        sub.state = SubState::Disposed;
        sub.ready_callbacks.clear();
        sub.event_queue.clear();

        let pending = std::mem::take(&mut sub.access_callbacks);
        if !pending.is_empty() {
            self.handle().enqueue(move |c| {
                let access = Access::error(ResError::disposed_subscription());
                for cb in pending {
                    cb(c, &access);
                }
            });
        }

        for child in std::mem::take(&mut sub.refs).keys() {
            self.unsubscribe(child, false, 1, false);
        }
        if let Some(rs) = sub.resource.take() {
            if state != SubState::Deleted {
                rs.unsubscribe(sub.id);
            }
        }
    }
}

fn encode_value(value: &Value, legacy: bool) -> serde_json::Value {
    if legacy {
        value.to_legacy_json()
    } else {
        value.to_json()
    }
}

fn encode_model(model: &BTreeMap<String, Value>, legacy: bool) -> serde_json::Value {
    serde_json::Value::Object(
        model
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v, legacy)))
            .collect(),
    )
}

fn encode_collection(collection: &[Value], legacy: bool) -> serde_json::Value {
    serde_json::Value::Array(collection.iter().map(|v| encode_value(v, legacy)).collect())
}
