//! Connection worker and client request handling.

use super::subscription::{ClientSubscription, ConnSubscriber, ReadyCallback};
use super::{ConnContext, ConnHandle, ConnWork, OutFrame};
use crate::codec::payloads::decode_conn_token_event;
use crate::codec::{CallResult, HttpContext, Meta, Request};
use crate::domain::error::{ResError, ResResult};
use crate::domain::rid::{expand_cid, split_rid};
use crate::middleware::metrics::WsMethod;
use crate::rescache::{ResourceCache, Throttle};
use crate::rpc::frames::{to_value, CallResourceResult, Resources};
use crate::rpc::{self, parse_protocol, version, Action, PROTOCOL_VERSION};
use res_bus::{BusMessage, Unsubscriber};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Callback receiving the result of a client request
type ReplyFn = Box<dyn FnOnce(&mut Conn, ResResult<serde_json::Value>) + Send>;

/// State of one client connection, owned by its worker task
pub struct Conn {
    cid: Arc<str>,
    handle: ConnHandle,
    ctx: ConnContext,
    http: HttpContext,
    protocol: u32,
    token: Option<serde_json::Value>,
    pub(crate) subs: HashMap<String, ClientSubscription>,
    pub(crate) ready: HashMap<u64, ReadyCallback>,
    pub(crate) next_ready: u64,
    out: Option<mpsc::Sender<OutFrame>>,
    conn_sub: Option<Box<dyn Unsubscriber>>,
    disposing: bool,
}

impl Conn {
    /// Create a connection and start its worker.
    ///
    /// Frames for the client are written to `out`; HTTP connections pass
    /// `None` and receive results through callbacks only.
    pub fn spawn(
        ctx: ConnContext,
        http: HttpContext,
        protocol: u32,
        out: Option<mpsc::Sender<OutFrame>>,
    ) -> ConnHandle {
        let (conn, rx) = Self::new(ctx, http, protocol, out);
        let handle = conn.handle.clone();
        conn.ctx.registry.insert(handle.cid().to_string(), handle.clone());
        tokio::spawn(conn.run(rx));
        handle
    }

    fn new(
        ctx: ConnContext,
        http: HttpContext,
        protocol: u32,
        out: Option<mpsc::Sender<OutFrame>>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnWork>) {
        let id = Uuid::new_v4().simple().to_string();
        let cid: Arc<str> = Arc::from(&id[..20]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnHandle {
            cid: cid.clone(),
            tx,
        };
        let conn_sub = subscribe_conn(&ctx.cache, &handle);
        debug!(cid = %cid, "Connection created");

        let conn = Self {
            cid,
            handle,
            ctx,
            http,
            protocol,
            token: None,
            subs: HashMap::new(),
            ready: HashMap::new(),
            next_ready: 0,
            out,
            conn_sub,
            disposing: false,
        };
        (conn, rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConnWork>) {
        let mut closed = false;
        while let Some(work) = rx.recv().await {
            work(&mut self);
            // Stop accepting work but drain what is already queued
            if self.disposing && !closed {
                rx.close();
                closed = true;
            }
        }
        self.dispose();
        trace!(cid = %self.cid, "Connection worker stopped");
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Negotiated client protocol version
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Access token set by a `conn.<cid>.token` event
    pub fn token(&self) -> Option<&serde_json::Value> {
        self.token.as_ref()
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing
    }

    /// RIDs of all client subscriptions, sorted
    pub fn subscription_rids(&self) -> Vec<String> {
        let mut rids: Vec<String> = self.subs.keys().cloned().collect();
        rids.sort();
        rids
    }

    /// Direct and indirect subscription counts of a RID
    pub fn subscription_counts(&self, rid: &str) -> Option<(usize, usize)> {
        self.subs.get(rid).map(|s| (s.direct, s.indirect))
    }

    pub(crate) fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    pub(crate) fn cache(&self) -> &ResourceCache {
        &self.ctx.cache
    }

    pub(crate) fn subscription(&self, rid: &str) -> Option<&ClientSubscription> {
        self.subs.get(rid)
    }

    /// Error of a subscription, or disposed if it was replaced or removed
    fn live_error(&self, rid: &str, id: u64) -> Option<ResError> {
        if !self.is_live(rid, id) {
            return Some(ResError::disposed_subscription());
        }
        self.sub_error(rid)
    }

    fn request(&self, query: &str, params: Option<serde_json::Value>, is_http: bool) -> Request {
        Request {
            params,
            token: self.token.clone(),
            query: query.to_string(),
            cid: self.cid.to_string(),
            is_http,
        }
    }

    // ---- Output ---------------------------------------------------------

    fn send(&mut self, frame: String) {
        let Some(out) = self.out.as_ref() else {
            return;
        };
        match out.try_send(OutFrame::Text(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(cid = %self.cid, "Outbound queue full, disconnecting");
                self.out = None;
                self.handle.enqueue(|c| c.dispose());
            }
            Err(TrySendError::Closed(_)) => {
                self.out = None;
            }
        }
    }

    pub(crate) fn send_event(&mut self, rid: &str, name: &str, data: &serde_json::Value) {
        let frame = rpc::event(rid, name, data);
        trace!(cid = %self.cid, "<-- {}", frame);
        self.send(frame);
    }

    fn reply(&mut self, id: u64, result: ResResult<serde_json::Value>) {
        let frame = match result {
            Ok(ref value) => rpc::response(id, value),
            Err(ref err) => rpc::error_response(id, err),
        };
        trace!(cid = %self.cid, "<-- {}", frame);
        self.send(frame);
    }

    // ---- Requests -------------------------------------------------------

    /// Handle one inbound client frame
    pub(crate) fn handle_request(&mut self, data: &[u8]) {
        trace!(cid = %self.cid, "--> {}", String::from_utf8_lossy(data));
        let request = match rpc::parse_request(data) {
            Ok(request) => request,
            Err(err) => {
                debug!(cid = %self.cid, error = %err, "Invalid client request");
                return;
            }
        };
        let id = request.id;
        let action = match request.action {
            Ok(action) => action,
            Err(err) => return self.reply(id, Err(err)),
        };

        let metrics = self.ctx.metrics.clone();
        match action {
            Action::Version { protocol } => {
                let result = self
                    .set_version(&protocol)
                    .map(|p| json!({ "protocol": p }));
                self.reply(id, result);
            }
            Action::Get { rid } => {
                metrics.record_ws_request(WsMethod::Get);
                let rid = expand_cid(&rid, &self.cid);
                self.get_resource(&rid, move |c, result| {
                    c.reply(id, result.map(|r| to_value(&r)))
                });
            }
            Action::Subscribe { rid } => {
                metrics.record_ws_request(WsMethod::Subscribe);
                let rid = expand_cid(&rid, &self.cid);
                self.subscribe_resource(&rid, move |c, result| {
                    c.reply(id, result.map(|r| to_value(&r)))
                });
            }
            Action::Unsubscribe { rid, count } => {
                metrics.record_ws_request(WsMethod::Unsubscribe);
                let rid = expand_cid(&rid, &self.cid);
                let result = if self.unsubscribe_by_rid(&rid, count) {
                    Ok(serde_json::Value::Null)
                } else {
                    Err(ResError::no_subscription())
                };
                self.reply(id, result);
            }
            Action::Call { rid, method, params } => {
                metrics.record_ws_request(WsMethod::Call);
                let rid = expand_cid(&rid, &self.cid);
                self.call_resource(&rid, &method, params, Box::new(move |c, r| c.reply(id, r)));
            }
            Action::Auth { rid, method, params } => {
                metrics.record_ws_request(WsMethod::Auth);
                let rid = expand_cid(&rid, &self.cid);
                self.auth_resource(&rid, &method, params, Box::new(move |c, r| c.reply(id, r)));
            }
            Action::New { rid, params } => {
                metrics.record_ws_request(WsMethod::New);
                let rid = expand_cid(&rid, &self.cid);
                self.new_resource(&rid, params, Box::new(move |c, r| c.reply(id, r)));
            }
        }
    }

    /// Negotiate the client protocol, returning the gateway's version
    pub(crate) fn set_version(&mut self, protocol: &str) -> ResResult<&'static str> {
        if protocol.is_empty() {
            return Ok(PROTOCOL_VERSION);
        }
        self.protocol = parse_protocol(protocol)?;
        Ok(PROTOCOL_VERSION)
    }

    /// Load a resource once without keeping the subscription
    pub(crate) fn get_resource(
        &mut self,
        rid: &str,
        cb: impl FnOnce(&mut Conn, ResResult<Resources>) + Send + 'static,
    ) {
        self.load_resource(rid, false, cb);
    }

    /// Subscribe to a resource, answering with every resource not yet sent
    pub(crate) fn subscribe_resource(
        &mut self,
        rid: &str,
        cb: impl FnOnce(&mut Conn, ResResult<Resources>) + Send + 'static,
    ) {
        self.load_resource(rid, true, cb);
    }

    fn load_resource(
        &mut self,
        rid: &str,
        keep: bool,
        cb: impl FnOnce(&mut Conn, ResResult<Resources>) + Send + 'static,
    ) {
        let id = match self.subscribe(rid, true) {
            Ok(id) => id,
            Err(err) => return cb(self, Err(err)),
        };
        let rid = rid.to_string();
        self.can_get(&rid.clone(), move |c, result| {
            if let Err(err) = result {
                cb(c, Err(err));
                c.unsubscribe(&rid, true, 1, true);
                return;
            }
            c.on_ready(&rid.clone(), move |c| {
                if let Some(err) = c.live_error(&rid, id) {
                    cb(c, Err(err));
                    c.unsubscribe(&rid, true, 1, true);
                    return;
                }
                let resources = c.get_rpc_resources(&rid);
                cb(c, Ok(resources));
                c.release_rpc_resources(&rid);
                if !keep {
                    c.unsubscribe(&rid, true, 1, true);
                }
            });
        });
    }

    fn call_resource(
        &mut self,
        rid: &str,
        action: &str,
        params: Option<serde_json::Value>,
        cb: ReplyFn,
    ) {
        self.call(rid, action, params, move |c, result| {
            c.handle_call_auth_response(result, cb)
        });
    }

    fn auth_resource(
        &mut self,
        rid: &str,
        action: &str,
        params: Option<serde_json::Value>,
        cb: ReplyFn,
    ) {
        let (name, query) = split_rid(rid);
        let request = self.request(query, params, false);
        let handle = self.handle.clone();
        self.ctx
            .cache
            .auth(name, action, &request, &self.http, move |result, _| {
                handle.enqueue(move |c| c.handle_call_auth_response(result, cb));
            });
    }

    fn new_resource(&mut self, rid: &str, params: Option<serde_json::Value>, cb: ReplyFn) {
        self.call(rid, "new", params, move |c, result| match result {
            Err(err) => cb(c, Err(err)),
            Ok(CallResult::Resource(rid)) => c.handle_resource_result(&rid, cb),
            Ok(CallResult::Result(_)) => cb(
                c,
                Err(ResError::internal("non-resource response on new request")),
            ),
        });
    }

    /// Check call access, then send the call request
    fn call(
        &mut self,
        rid: &str,
        action: &str,
        params: Option<serde_json::Value>,
        cb: impl FnOnce(&mut Conn, ResResult<CallResult>) + Send + 'static,
    ) {
        let (target, method) = (rid.to_string(), action.to_string());
        let after_access = move |c: &mut Conn, result: ResResult<()>| match result {
            Err(err) => cb(c, Err(err)),
            Ok(()) => c.send_call(&target, &method, params, false, move |c, result, _| cb(c, result)),
        };

        if self.subs.contains_key(rid) {
            return self.can_call(rid, action, after_access);
        }

        // No subscription to cache access on
        let (name, query) = split_rid(rid);
        let request = self.request(query, None, false);
        let handle = self.handle.clone();
        let action = action.to_string();
        self.ctx.cache.access(name, &request, move |access| {
            handle.enqueue(move |c| {
                let result = access.can_call(&action);
                after_access(c, result);
            });
        });
    }

    fn send_call(
        &mut self,
        rid: &str,
        action: &str,
        params: Option<serde_json::Value>,
        is_http: bool,
        cb: impl FnOnce(&mut Conn, ResResult<CallResult>, Option<Meta>) + Send + 'static,
    ) {
        let (name, query) = split_rid(rid);
        let request = self.request(query, params, is_http);
        let handle = self.handle.clone();
        self.ctx.cache.call(name, action, &request, move |result, meta| {
            handle.enqueue(move |c| cb(c, result, meta));
        });
    }

    fn handle_call_auth_response(&mut self, result: ResResult<CallResult>, cb: ReplyFn) {
        let result = match result {
            Ok(result) => result,
            Err(err) => return cb(self, Err(err)),
        };

        if self.protocol < version::CALL_RESOURCE_RESPONSE {
            let value = match result {
                CallResult::Resource(rid) => json!({ "rid": rid }),
                CallResult::Result(value) => value,
            };
            return cb(self, Ok(value));
        }

        match result {
            CallResult::Result(payload) => cb(self, Ok(json!({ "payload": payload }))),
            CallResult::Resource(rid) => self.handle_resource_result(&rid, cb),
        }
    }

    /// Subscribe to a resource returned by a call and answer with it.
    ///
    /// The call itself succeeded, so access or load errors are returned as
    /// part of the resource set rather than as a request error.
    fn handle_resource_result(&mut self, rid: &str, cb: ReplyFn) {
        if let Err(err) = self.subscribe(rid, true) {
            return cb(self, Err(err));
        }
        let rid = rid.to_string();
        self.can_get(&rid.clone(), move |c, result| {
            if let Err(err) = result {
                let mut resources = Resources::default();
                resources.errors.insert(rid.clone(), err);
                let value = to_value(&CallResourceResult {
                    rid: rid.clone(),
                    resources,
                });
                cb(c, Ok(value));
                c.unsubscribe(&rid, true, 1, true);
                return;
            }
            c.on_ready(&rid.clone(), move |c| {
                let resources = c.get_rpc_resources(&rid);
                let value = to_value(&CallResourceResult {
                    rid: rid.clone(),
                    resources,
                });
                cb(c, Ok(value));
                c.release_rpc_resources(&rid);
            });
        });
    }

    // ---- HTTP -----------------------------------------------------------

    /// Load a resource for an HTTP GET.
    ///
    /// Access is requested with the HTTP flag set, and its meta is passed on
    /// to `cb`. A meta status that must be replied directly skips the get.
    /// On success `cb` runs while the resource tree is held, so it can be
    /// rendered from the connection.
    pub fn get_http_resource(
        &mut self,
        rid: &str,
        cb: impl FnOnce(&mut Conn, ResResult<()>, Option<Meta>) + Send + 'static,
    ) {
        let id = match self.subscribe(rid, true) {
            Ok(id) => id,
            Err(err) => return cb(self, Err(err), None),
        };
        let (name, query) = split_rid(rid);
        let request = self.request(query, None, true);
        let handle = self.handle.clone();
        let rid = rid.to_string();
        self.ctx.cache.access(name, &request, move |access| {
            handle.enqueue(move |c| {
                let meta = access.meta().cloned();
                let direct = meta.as_ref().is_some_and(Meta::is_direct_response_status);
                let result = if direct {
                    access.err().cloned().map_or(Ok(()), Err)
                } else {
                    access.can_get()
                };
                if direct || result.is_err() {
                    cb(c, result, meta);
                    c.unsubscribe(&rid, true, 1, true);
                    return;
                }
                c.on_ready(&rid.clone(), move |c| {
                    if let Some(err) = c.live_error(&rid, id) {
                        cb(c, Err(err), meta);
                        c.unsubscribe(&rid, true, 1, true);
                        return;
                    }
                    cb(c, Ok(()), meta);
                    c.release_rpc_resources(&rid);
                    c.unsubscribe(&rid, true, 1, true);
                });
            });
        });
    }

    /// Call a resource method for an HTTP request.
    ///
    /// The access meta is merged with the call meta. A direct response status
    /// on access skips the call request.
    pub fn call_http_resource(
        &mut self,
        rid: &str,
        action: &str,
        params: Option<serde_json::Value>,
        cb: impl FnOnce(&mut Conn, ResResult<Option<CallResult>>, Option<Meta>) + Send + 'static,
    ) {
        let (name, query) = split_rid(rid);
        let request = self.request(query, None, true);
        let handle = self.handle.clone();
        let (rid, action) = (rid.to_string(), action.to_string());
        self.ctx.cache.access(name, &request, move |access| {
            handle.enqueue(move |c| {
                let access_meta = access.meta().cloned();
                if access_meta.as_ref().is_some_and(Meta::is_direct_response_status) {
                    let result = access.err().cloned().map_or(Ok(None), Err);
                    return cb(c, result, access_meta);
                }
                if let Err(err) = access.can_call(&action) {
                    return cb(c, Err(err), access_meta);
                }
                c.send_call(&rid, &action, params, true, move |c, result, call_meta| {
                    cb(c, result.map(Some), Meta::merge(access_meta, call_meta))
                });
            });
        });
    }

    /// Auth request carrying the connection's HTTP context
    pub fn auth_no_result(
        &mut self,
        rid: &str,
        action: &str,
        cb: impl FnOnce(&mut Conn, ResResult<CallResult>, Option<Meta>) + Send + 'static,
    ) {
        let rid = expand_cid(rid, &self.cid);
        let (name, query) = split_rid(&rid);
        let request = self.request(query, None, true);
        let handle = self.handle.clone();
        self.ctx
            .cache
            .auth(name, action, &request, &self.http, move |result, meta| {
                handle.enqueue(move |c| cb(c, result, meta));
            });
    }

    // ---- Subscription counts --------------------------------------------

    /// Get or create a client subscription, counting it as direct or
    /// indirect. Returns the subscription id.
    pub(crate) fn subscribe(&mut self, rid: &str, direct: bool) -> ResResult<u64> {
        self.subscribe_throttled(rid, direct, None)
    }

    /// Subscribe with the throttle of the subscription tree `rid` is loaded
    /// in. A new tree gets its own throttle when a reference limit is set.
    pub(crate) fn subscribe_throttled(
        &mut self,
        rid: &str,
        direct: bool,
        throttle: Option<Arc<Throttle>>,
    ) -> ResResult<u64> {
        if self.disposing {
            return Err(ResError::disposing());
        }
        let limit = self.ctx.subscription_limit;

        if let Some(sub) = self.subs.get_mut(rid) {
            add_count(sub, direct, limit)?;
            return Ok(sub.id);
        }

        let (name, query) = split_rid(rid);
        let mut sub = ClientSubscription::new(rid, name, query);
        add_count(&mut sub, direct, limit)?;
        let id = sub.id;
        let throttle = throttle.or_else(|| Throttle::new(self.ctx.reference_throttle));
        sub.throttle = throttle.clone();
        let subscriber = Arc::new(ConnSubscriber {
            id,
            rid: rid.to_string(),
            name: name.to_string(),
            query: query.to_string(),
            conn: self.handle.clone(),
            throttle,
        });
        self.subs.insert(rid.to_string(), sub);
        trace!(cid = %self.cid, rid = %rid, direct, "Subscribing");
        self.ctx.cache.subscribe(subscriber);
        Ok(id)
    }

    /// Count down a subscription, collecting it if it is no longer reachable
    pub(crate) fn unsubscribe(&mut self, rid: &str, direct: bool, count: usize, try_delete: bool) {
        if self.disposing {
            return;
        }
        let Some(sub) = self.subs.get_mut(rid) else {
            return;
        };
        if sub.direct + sub.indirect == 0 {
            return;
        }
        if direct {
            sub.direct = sub.direct.saturating_sub(count);
        } else {
            sub.indirect = sub.indirect.saturating_sub(count);
        }
        if try_delete {
            self.try_delete(rid);
        }
    }

    /// Client unsubscribe request; false if there are not `count` direct
    /// subscriptions to remove
    pub(crate) fn unsubscribe_by_rid(&mut self, rid: &str, count: usize) -> bool {
        if self.disposing {
            return false;
        }
        match self.subs.get(rid) {
            Some(sub) if sub.direct >= count => {}
            _ => return false,
        }
        self.unsubscribe(rid, true, count, true);
        true
    }

    // ---- Connection events ----------------------------------------------

    fn handle_conn_event(&mut self, subject: &str, payload: &[u8]) {
        // Skip "conn.<cid>."
        let idx = self.cid.len() + 6;
        let Some(event) = subject.get(idx..).filter(|e| !e.is_empty()) else {
            error!(cid = %self.cid, subject = %subject, "Malformed conn event subject");
            return;
        };

        match event {
            "token" => match decode_conn_token_event(payload) {
                Ok(ev) => self.set_token(ev.token),
                Err(err) => {
                    error!(cid = %self.cid, error = %err, "Malformed token event payload")
                }
            },
            _ => trace!(cid = %self.cid, event = %event, "Ignoring conn event"),
        }
    }

    /// Replace the access token and recheck access of every subscription
    pub(crate) fn set_token(&mut self, token: serde_json::Value) {
        self.token = if token.is_null() { None } else { Some(token) };
        debug!(cid = %self.cid, "Token updated");
        let rids: Vec<String> = self.subs.keys().cloned().collect();
        for rid in rids {
            self.reaccess(&rid, None);
        }
    }

    // ---- Disposal -------------------------------------------------------

    /// Release every subscription and stop accepting work
    pub(crate) fn dispose(&mut self) {
        if self.disposing {
            return;
        }
        self.disposing = true;

        if let Some(sub) = self.conn_sub.take() {
            if let Err(err) = sub.unsubscribe() {
                warn!(cid = %self.cid, error = %err, "Failed to unsubscribe conn events");
            }
        }

        let subs = std::mem::take(&mut self.subs);
        for (_, sub) in subs {
            self.dispose_subscription(sub);
        }
        self.ready.clear();
        self.out = None;
        self.ctx.registry.remove(&*self.cid);
        debug!(cid = %self.cid, "Connection disposed");
    }

    /// Close the client socket with a reason and dispose
    pub(crate) fn disconnect(&mut self, reason: &str) {
        if let Some(out) = self.out.take() {
            let _ = out.try_send(OutFrame::Close(reason.to_string()));
        }
        self.dispose();
    }
}

fn add_count(sub: &mut ClientSubscription, direct: bool, limit: usize) -> ResResult<()> {
    if !direct {
        sub.indirect += 1;
        return Ok(());
    }
    if sub.direct >= limit {
        debug!(rid = %sub.rid, direct = sub.direct, "Subscription limit exceeded");
        return Err(ResError::subscription_limit_exceeded());
    }
    sub.direct += 1;
    Ok(())
}

fn subscribe_conn(cache: &ResourceCache, handle: &ConnHandle) -> Option<Box<dyn Unsubscriber>> {
    let conn = handle.clone();
    let result = cache.bus().subscribe(
        &format!("conn.{}", handle.cid()),
        Arc::new(move |msg: BusMessage| {
            conn.enqueue(move |c| c.handle_conn_event(&msg.subject, &msg.payload));
        }),
    );
    match result {
        Ok(sub) => Some(sub),
        Err(err) => {
            error!(cid = %handle.cid(), error = %err, "Failed to subscribe to conn events");
            None
        }
    }
}

#[cfg(test)]
impl Conn {
    /// Connection without a worker, driven directly by tests
    pub(crate) fn detached(ctx: ConnContext, protocol: u32) -> Self {
        Self::new(ctx, HttpContext::default(), protocol, None).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;
    use crate::middleware::metrics::GatewayMetrics;
    use crate::rescache::CacheOptions;
    use res_bus::MemoryBus;
    use std::time::Duration;

    struct Harness {
        bus: Arc<MemoryBus>,
        handle: ConnHandle,
        out: mpsc::Receiver<OutFrame>,
    }

    fn harness(protocol: u32) -> Harness {
        harness_with(protocol, CacheOptions::default(), 0)
    }

    fn harness_with(protocol: u32, options: CacheOptions, reference_throttle: usize) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(bus.clone(), options, metrics.clone());
        cache.start().unwrap();
        let ctx = ConnContext::new(cache, metrics, 2).with_reference_throttle(reference_throttle);
        let (tx, out) = mpsc::channel(64);
        let handle = Conn::spawn(ctx, HttpContext::default(), protocol, Some(tx));
        Harness { bus, handle, out }
    }

    impl Harness {
        fn send(&self, frame: &str) {
            assert!(self.handle.handle_message(frame.to_string()));
        }

        async fn next_frame(&mut self) -> serde_json::Value {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.out.recv())
                .await
                .expect("frame timeout")
                .expect("output closed");
            match frame {
                OutFrame::Text(text) => serde_json::from_str(&text).unwrap(),
                OutFrame::Close(reason) => panic!("unexpected close: {}", reason),
            }
        }

        async fn respond(&self, subject: &str, payload: &str) {
            let request = self.bus.next_request(subject).await.expect("no request");
            request.respond(payload.to_string());
        }

        async fn assert_quiet(&mut self) {
            let frame = tokio::time::timeout(Duration::from_millis(100), self.out.recv()).await;
            assert!(frame.is_err(), "unexpected frame: {:?}", frame);
        }
    }

    #[tokio::test]
    async fn test_version_negotiation() {
        let mut h = harness(version::LEGACY);
        h.send(r#"{"id":1,"method":"version","params":{"protocol":"1.2.1"}}"#);
        assert_eq!(h.next_frame().await, json!({"id": 1, "result": {"protocol": "1.2.1"}}));
        let protocol = h.handle.inspect(|c| c.protocol()).await.unwrap();
        assert_eq!(protocol, version::LATEST);

        h.send(r#"{"id":2,"method":"version","params":{"protocol":"2.0.0"}}"#);
        let frame = h.next_frame().await;
        assert_eq!(frame["error"]["code"], codes::UNSUPPORTED_PROTOCOL);
    }

    #[tokio::test]
    async fn test_subscribe_model_with_reference() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.a", r#"{"result":{"model":{"b":{"rid":"test.b"},"n":1}}}"#)
            .await;
        h.respond("get.test.b", r#"{"result":{"model":{"x":true}}}"#).await;

        let frame = h.next_frame().await;
        assert_eq!(
            frame,
            json!({"id": 1, "result": {"models": {
                "test.a": {"b": {"rid": "test.b"}, "n": 1},
                "test.b": {"x": true}
            }}})
        );

        let counts = h
            .handle
            .inspect(|c| (c.subscription_counts("test.a"), c.subscription_counts("test.b")))
            .await
            .unwrap();
        assert_eq!(counts, (Some((1, 0)), Some((0, 1))));
    }

    #[tokio::test]
    async fn test_get_releases_subscription() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":5,"method":"get.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.a", r#"{"result":{"collection":[1,2]}}"#).await;

        let frame = h.next_frame().await;
        assert_eq!(frame, json!({"id": 5, "result": {"collections": {"test.a": [1, 2]}}}));
        let rids = h.handle.inspect(|c| c.subscription_rids()).await.unwrap();
        assert!(rids.is_empty());
    }

    #[tokio::test]
    async fn test_access_denied() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":false}}"#).await;
        let frame = h.next_frame().await;
        assert_eq!(frame["error"]["code"], codes::ACCESS_DENIED);
        let rids = h.handle.inspect(|c| c.subscription_rids()).await.unwrap();
        assert!(rids.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let mut h = harness(version::LATEST);
        for id in 1..=2 {
            h.send(&format!(r#"{{"id":{},"method":"subscribe.test.a"}}"#, id));
        }
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.a", r#"{"result":{"model":{}}}"#).await;
        assert_eq!(h.next_frame().await["id"], 1);
        assert_eq!(h.next_frame().await, json!({"id": 2, "result": {}}));

        h.send(r#"{"id":3,"method":"subscribe.test.a"}"#);
        let frame = h.next_frame().await;
        assert_eq!(frame["error"]["code"], codes::SUBSCRIPTION_LIMIT_EXCEEDED);

        h.send(r#"{"id":4,"method":"unsubscribe.test.a","params":{"count":3}}"#);
        assert_eq!(h.next_frame().await["error"]["code"], codes::NO_SUBSCRIPTION);
        h.send(r#"{"id":5,"method":"unsubscribe.test.a","params":{"count":2}}"#);
        assert_eq!(h.next_frame().await, json!({"id": 5}));
    }

    #[tokio::test]
    async fn test_call_without_subscription() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"call.test.a.set","params":{"x":1}}"#);
        h.respond("access.test.a", r#"{"result":{"get":false,"call":"set"}}"#)
            .await;
        let request = h.bus.next_request("call.test.a.set").await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(request.payload_str()).unwrap();
        assert_eq!(payload["params"], json!({"x": 1}));
        request.respond(r#"{"result":{"ok":true}}"#);
        assert_eq!(
            h.next_frame().await,
            json!({"id": 1, "result": {"payload": {"ok": true}}})
        );
    }

    #[tokio::test]
    async fn test_legacy_call_result() {
        let mut h = harness(version::LEGACY);
        h.send(r#"{"id":1,"method":"call.test.a.set"}"#);
        h.respond("access.test.a", r#"{"result":{"call":"*"}}"#).await;
        h.respond("call.test.a.set", r#"{"result":{"ok":true}}"#).await;
        assert_eq!(h.next_frame().await, json!({"id": 1, "result": {"ok": true}}));
    }

    #[tokio::test]
    async fn test_new_resource() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"new.test.list","params":{"name":"x"}}"#);
        h.respond("access.test.list", r#"{"result":{"call":"new"}}"#).await;
        h.respond("call.test.list.new", r#"{"resource":{"rid":"test.item.1"}}"#)
            .await;
        h.respond("access.test.item.1", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.item.1", r#"{"result":{"model":{"name":"x"}}}"#)
            .await;
        assert_eq!(
            h.next_frame().await,
            json!({"id": 1, "result": {
                "rid": "test.item.1",
                "models": {"test.item.1": {"name": "x"}}
            }})
        );
    }

    #[tokio::test]
    async fn test_token_event_triggers_reaccess() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.a", r#"{"result":{"model":{"v":1}}}"#).await;
        h.next_frame().await;

        let cid = h.handle.cid().to_string();
        h.bus
            .publish(&format!("conn.{}.token", cid), r#"{"token":{"user":"x"}}"#);
        let request = h.bus.next_request("access.test.a").await.unwrap();
        assert!(request.payload_str().contains(r#""token":{"user":"x"}"#));
        request.respond(r#"{"result":{"get":false}}"#);

        let frame = h.next_frame().await;
        assert_eq!(frame["event"], "test.a.unsubscribe");
        assert_eq!(frame["data"]["reason"]["code"], codes::ACCESS_DENIED);
        let rids = h.handle.inspect(|c| c.subscription_rids()).await.unwrap();
        assert!(rids.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_releases_everything() {
        let h = harness(version::LATEST);
        let cid = h.handle.cid().to_string();
        assert!(h.bus.has_subscription(&format!("conn.{}.*", cid)));

        h.handle.dispose().await;
        assert!(!h.bus.has_subscription(&format!("conn.{}.*", cid)));
        assert!(!h.handle.handle_message("{}".into()));
    }

    #[tokio::test]
    async fn test_invalid_request_reply() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":9,"method":"fetch.test"}"#);
        assert_eq!(h.next_frame().await["error"]["code"], codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_reaccess_event_triggers_access_request() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.a", r#"{"result":{"model":{"v":1}}}"#).await;
        h.next_frame().await;

        h.bus.publish("event.test.a.reaccess", "");
        h.respond("access.test.a", r#"{"result":{"get":false}}"#).await;

        let frame = h.next_frame().await;
        assert_eq!(frame["event"], "test.a.unsubscribe");
        assert_eq!(frame["data"]["reason"]["code"], codes::ACCESS_DENIED);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_resource_is_resent_with_loading_parent() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.model"}"#);
        h.respond("access.test.model", r#"{"result":{"get":true}}"#).await;
        h.respond("get.test.model", r#"{"result":{"model":{"n":1}}}"#).await;
        h.next_frame().await;

        h.send(r#"{"id":2,"method":"subscribe.test.parent"}"#);
        h.respond("access.test.parent", r#"{"result":{"get":true}}"#).await;
        h.respond(
            "get.test.parent",
            r#"{"result":{"model":{"child":{"rid":"test.model"},"delayed":{"rid":"test.delayed"}}}}"#,
        )
        .await;
        let delayed = h.bus.next_request("get.test.delayed").await.unwrap();

        // Dropped by the client before the parent is sent
        h.send(r#"{"id":3,"method":"unsubscribe.test.model"}"#);
        assert_eq!(h.next_frame().await, json!({"id": 3}));

        delayed.respond(r#"{"result":{"model":{"name":"delayed"}}}"#.to_string());
        assert_eq!(
            h.next_frame().await,
            json!({"id": 2, "result": {"models": {
                "test.parent": {"child": {"rid": "test.model"}, "delayed": {"rid": "test.delayed"}},
                "test.model": {"n": 1},
                "test.delayed": {"name": "delayed"}
            }}})
        );
        let counts = h
            .handle
            .inspect(|c| c.subscription_counts("test.model"))
            .await
            .unwrap();
        assert_eq!(counts, Some((0, 1)));
    }

    #[tokio::test]
    async fn test_concurrent_normalized_queries_load_once() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.q?a=1&b=2"}"#);
        h.send(r#"{"id":2,"method":"subscribe.test.q?b=2&a=1"}"#);
        for _ in 0..2 {
            h.respond("access.test.q", r#"{"result":{"get":true}}"#).await;
        }
        for _ in 0..2 {
            h.respond("get.test.q", r#"{"result":{"collection":[],"query":"b=2&a=1"}}"#)
                .await;
        }

        let mut replies = vec![h.next_frame().await, h.next_frame().await];
        replies.sort_by_key(|frame| frame["id"].as_u64());
        assert_eq!(
            replies,
            vec![
                json!({"id": 1, "result": {"collections": {"test.q?a=1&b=2": []}}}),
                json!({"id": 2, "result": {"collections": {"test.q?b=2&a=1": []}}}),
            ]
        );
        h.assert_quiet().await;

        h.bus.publish("event.test.q.query", r#"{"subject":"_EQ_1"}"#);
        let request = h.bus.next_request("_EQ_1").await.unwrap();
        assert_eq!(request.payload_str(), r#"{"query":"b=2&a=1"}"#);
        request.respond(r#"{"result":{"events":[{"event":"add","data":{"idx":0,"value":"x"}}]}}"#);

        let mut events = vec![h.next_frame().await, h.next_frame().await];
        events.sort_by(|a, b| a["event"].as_str().cmp(&b["event"].as_str()));
        assert_eq!(
            events,
            vec![
                json!({"event": "test.q?a=1&b=2.add", "data": {"idx": 0, "value": "x"}}),
                json!({"event": "test.q?b=2&a=1.add", "data": {"idx": 0, "value": "x"}}),
            ]
        );
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_ready_callbacks_fire_once() {
        let mut h = harness(version::LATEST);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.send(r#"{"id":2,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond(
            "get.test.a",
            r#"{"result":{"model":{"b1":{"rid":"test.b"},"b2":{"rid":"test.b"},"c":{"rid":"test.c"}}}}"#,
        )
        .await;
        h.respond("get.test.c", r#"{"result":{"model":{"b":{"rid":"test.b"}}}}"#).await;
        h.respond("get.test.b", r#"{"result":{"model":{"a":{"rid":"test.a"}}}}"#).await;

        assert_eq!(
            h.next_frame().await,
            json!({"id": 1, "result": {"models": {
                "test.a": {"b1": {"rid": "test.b"}, "b2": {"rid": "test.b"}, "c": {"rid": "test.c"}},
                "test.b": {"a": {"rid": "test.a"}},
                "test.c": {"b": {"rid": "test.b"}}
            }}})
        );
        assert_eq!(h.next_frame().await, json!({"id": 2, "result": {}}));
        h.assert_quiet().await;
        let counts = h
            .handle
            .inspect(|c| c.subscription_counts("test.b"))
            .await
            .unwrap();
        assert_eq!(counts, Some((0, 2)));
    }

    fn pending(bus: &MemoryBus, prefix: &str) -> Vec<String> {
        let mut subjects: Vec<String> = bus
            .pending_requests()
            .into_iter()
            .filter(|s| s.starts_with(prefix))
            .collect();
        subjects.sort();
        subjects
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reference_throttle_limits_parallel_gets() {
        let mut h = harness_with(version::LATEST, CacheOptions::default(), 1);
        h.send(r#"{"id":1,"method":"subscribe.test.a"}"#);
        h.respond("access.test.a", r#"{"result":{"get":true}}"#).await;
        h.respond(
            "get.test.a",
            r#"{"result":{"collection":[{"rid":"test.b"},{"rid":"test.c"}]}}"#,
        )
        .await;
        settle().await;

        let first = pending(&h.bus, "get.");
        assert_eq!(first.len(), 1);
        assert!(h.bus.respond(&first[0], r#"{"result":{"model":{}}}"#));
        settle().await;

        let second = pending(&h.bus, "get.");
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        assert!(h.bus.respond(&second[0], r#"{"result":{"model":{}}}"#));

        let frame = h.next_frame().await;
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["result"]["models"], serde_json::json!({"test.b": {}, "test.c": {}}));
    }

    #[tokio::test]
    async fn test_reset_throttle_limits_access_requests() {
        let options = CacheOptions {
            reset_throttle: 1,
            ..Default::default()
        };
        let mut h = harness_with(version::LATEST, options, 0);
        for (id, rid) in [(1, "test.a"), (2, "test.b")] {
            h.send(&format!(r#"{{"id":{},"method":"subscribe.{}"}}"#, id, rid));
            h.respond(&format!("access.{}", rid), r#"{"result":{"get":true}}"#).await;
            h.respond(&format!("get.{}", rid), r#"{"result":{"model":{}}}"#).await;
            h.next_frame().await;
        }

        h.bus.publish("system.reset", r#"{"access":["test.*"]}"#);
        settle().await;
        let first = pending(&h.bus, "access.");
        assert_eq!(first.len(), 1);
        assert!(h.bus.respond(&first[0], r#"{"result":{"get":true}}"#));
        settle().await;

        let second = pending(&h.bus, "access.");
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        assert!(h.bus.respond(&second[0], r#"{"result":{"get":false}}"#));

        let frame = h.next_frame().await;
        assert_eq!(frame["event"], format!("{}.unsubscribe", &second[0]["access.".len()..]));
        h.assert_quiet().await;
    }
}
