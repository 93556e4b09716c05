//! Cache facade: hub registry, worker pool and service RPC.

use super::access::Access;
use super::event_subscription::{CacheShared, EventSubscription, HubCtx};
use super::pattern::ResourcePattern;
use super::throttle::Throttle;
use super::unsub_queue::UnsubscribeQueue;
use super::Subscriber;
use crate::codec::payloads::{
    create_auth_request, create_request, decode_access_response, decode_call_response,
    decode_system_reset, try_decode_legacy_new_result,
};
use crate::codec::{decode_response_meta, CallResult, HttpContext, Meta, Request};
use crate::domain::config::GatewayConfig;
use crate::domain::error::{ResError, ResResult};
use crate::middleware::metrics::GatewayMetrics;
use bytes::Bytes;
use parking_lot::Mutex;
use res_bus::{BusClient, BusError, BusMessage, Unsubscriber};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Number of workers draining hub queues
    pub workers: usize,
    /// Idle time before a hub releases its bus subscription
    pub unsubscribe_delay: Duration,
    /// Max parallel requests sent for one system reset, 0 for no limit
    pub reset_throttle: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            unsubscribe_delay: Duration::from_secs(5),
            reset_throttle: 0,
        }
    }
}

impl From<&GatewayConfig> for CacheOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            workers: config.cache_workers,
            unsubscribe_delay: config.unsubscribe_delay,
            reset_throttle: config.reset_throttle,
        }
    }
}

#[derive(Default)]
struct Registry {
    started: bool,
    hubs: HashMap<String, Arc<EventSubscription>>,
    reset_sub: Option<Box<dyn Unsubscriber>>,
    expiry_task: Option<JoinHandle<()>>,
}

struct CacheInner {
    shared: Arc<CacheShared>,
    workers: usize,
    reset_throttle: usize,
    registry: Mutex<Registry>,
}

/// Shared resource cache
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    /// Create a stopped cache
    pub fn new(bus: Arc<dyn BusClient>, options: CacheOptions, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                shared: Arc::new(CacheShared {
                    bus,
                    unsub_queue: UnsubscribeQueue::new(options.unsubscribe_delay),
                    work_tx: Mutex::new(None),
                    metrics,
                }),
                workers: options.workers.max(1),
                reset_throttle: options.reset_throttle,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Bus the cache sends requests on
    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.inner.shared.bus
    }

    /// Start the workers and listen for system events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        let mut registry = self.inner.registry.lock();
        if registry.started {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let reset_sub = self.inner.shared.bus.subscribe(
            "system",
            Arc::new(move |msg: BusMessage| {
                if msg.subject != "system.reset" {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.handle_system_reset(&msg.payload);
                }
            }),
        )?;

        let (tx, rx) = mpsc::unbounded_channel::<Arc<EventSubscription>>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..self.inner.workers {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let hub = rx.lock().await.recv().await;
                    match hub {
                        Some(hub) => hub.process_queue(),
                        None => break,
                    }
                }
            });
        }
        *self.inner.shared.work_tx.lock() = Some(tx);

        let shared = self.inner.shared.clone();
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        registry.expiry_task = Some(tokio::spawn(async move {
            loop {
                let name = shared.unsub_queue.next_expired().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.mq_unsubscribe(&name);
            }
        }));

        registry.reset_sub = Some(reset_sub);
        registry.started = true;
        info!(workers = self.inner.workers, "Resource cache started");
        Ok(())
    }

    /// Stop the workers and drop pending unsubscribes
    pub fn stop(&self) {
        let mut registry = self.inner.registry.lock();
        if !registry.started {
            return;
        }
        registry.started = false;

        // Closing the channel lets workers exit once it is drained
        self.inner.shared.work_tx.lock().take();
        self.inner.shared.unsub_queue.clear();
        if let Some(task) = registry.expiry_task.take() {
            task.abort();
        }
        if let Some(sub) = registry.reset_sub.take() {
            if let Err(err) = sub.unsubscribe() {
                warn!(error = %err, "Failed to unsubscribe from system events");
            }
        }
        info!("Resource cache stopped");
    }

    /// Subscribe to a resource.
    ///
    /// The subscriber is called back with the loaded resource or an error.
    pub fn subscribe(&self, sub: Arc<dyn Subscriber>) {
        match self.inner.get_subscription(sub.resource_name(), true) {
            Ok(hub) => hub.add_subscriber(sub),
            Err(err) => sub.loaded(Err(err)),
        }
    }

    /// Request access to a resource from the service owning it.
    ///
    /// For HTTP-flagged requests the response meta is attached to the access.
    pub fn access(
        &self,
        name: &str,
        request: &Request,
        callback: impl FnOnce(Access) + Send + 'static,
    ) {
        let is_http = request.is_http;
        self.inner.send_request(
            name,
            format!("access.{}", name),
            create_request(request),
            move |result| {
                let meta = response_meta(&result, is_http);
                let access = result
                    .map_err(ResError::from)
                    .and_then(|payload| decode_access_response(&payload));
                callback(Access::new(access).with_meta(meta));
            },
        );
    }

    /// Call a method on a resource
    pub fn call(
        &self,
        name: &str,
        action: &str,
        request: &Request,
        callback: impl FnOnce(ResResult<CallResult>, Option<Meta>) + Send + 'static,
    ) {
        let is_new = action == "new";
        let is_http = request.is_http;
        self.inner.send_request(
            name,
            format!("call.{}.{}", name, action),
            create_request(request),
            move |result| {
                let meta = response_meta(&result, is_http);
                callback(decode_call(result, is_new), meta)
            },
        );
    }

    /// Send an auth request including the HTTP context of the connection
    pub fn auth(
        &self,
        name: &str,
        action: &str,
        request: &Request,
        http: &HttpContext,
        callback: impl FnOnce(ResResult<CallResult>, Option<Meta>) + Send + 'static,
    ) {
        let is_http = request.is_http;
        self.inner.send_request(
            name,
            format!("auth.{}.{}", name, action),
            create_auth_request(request, http),
            move |result| {
                let meta = response_meta(&result, is_http);
                callback(decode_call(result, false), meta)
            },
        );
    }

    /// Number of hubs in the registry
    pub fn hub_count(&self) -> usize {
        self.inner.registry.lock().hubs.len()
    }

    /// Hub for a resource name, if cached
    pub fn event_subscription(&self, name: &str) -> Option<Arc<EventSubscription>> {
        self.inner.registry.lock().hubs.get(name).cloned()
    }
}

fn response_meta(result: &Result<Bytes, BusError>, is_http: bool) -> Option<Meta> {
    match result {
        Ok(payload) if is_http => decode_response_meta(payload),
        _ => None,
    }
}

fn decode_call(result: Result<Bytes, BusError>, is_new: bool) -> ResResult<CallResult> {
    let result = result
        .map_err(ResError::from)
        .and_then(|payload| decode_call_response(&payload))?;
    if is_new {
        if let CallResult::Result(ref value) = result {
            if let Some(rid) = try_decode_legacy_new_result(value)? {
                return Ok(CallResult::Resource(rid));
            }
        }
    }
    Ok(result)
}

impl CacheInner {
    /// Find or create the hub for a name, taking one count on it.
    fn hub(&self, name: &str) -> Arc<EventSubscription> {
        let mut registry = self.registry.lock();
        if let Some(hub) = registry.hubs.get(name) {
            hub.add_count();
            return hub.clone();
        }
        let hub = EventSubscription::new(name, self.shared.clone());
        registry.hubs.insert(name.to_string(), hub.clone());
        self.shared.metrics.set_cache_hubs(registry.hubs.len());
        debug!(name = %name, "Event subscription created");
        hub
    }

    fn get_subscription(&self, name: &str, subscribe: bool) -> ResResult<Arc<EventSubscription>> {
        let hub = self.hub(name);
        if !subscribe || hub.has_bus_subscription() {
            return Ok(hub);
        }

        let weak = Arc::downgrade(&hub);
        let subscribed = self.shared.bus.subscribe(
            &format!("event.{}", name),
            Arc::new(move |msg: BusMessage| {
                if let Some(hub) = weak.upgrade() {
                    hub.enqueue_event(msg.subject, msg.payload);
                }
            }),
        );
        match subscribed {
            Ok(sub) => {
                hub.set_bus_subscription(sub);
                Ok(hub)
            }
            Err(err) => {
                warn!(name = %name, error = %err, "Failed to subscribe to resource events");
                hub.release(1);
                Err(ResError::from(err))
            }
        }
    }

    /// Send a request holding a count on the hub until the response is handled
    fn send_request(
        &self,
        name: &str,
        subject: String,
        payload: Bytes,
        callback: impl FnOnce(Result<Bytes, BusError>) + Send + 'static,
    ) {
        let hub = self.hub(name);
        self.shared.metrics.record_bus_request();
        trace!(subject = %subject, "Sending request");
        self.shared.bus.send_request(
            &subject,
            payload,
            Box::new(move |result| {
                hub.enqueue(Box::new(move |ctx: &mut HubCtx<'_>| {
                    ctx.deliver(move || callback(result));
                    ctx.remove_count(1);
                }));
            }),
        );
    }

    fn mq_unsubscribe(&self, name: &str) {
        let mut registry = self.registry.lock();
        // Released again after expiring; a fresh delay is running
        if self.shared.unsub_queue.contains(name) {
            return;
        }
        let Some(hub) = registry.hubs.get(name).cloned() else {
            return;
        };
        if hub.mq_unsubscribe() {
            registry.hubs.remove(name);
            self.shared.metrics.set_cache_hubs(registry.hubs.len());
            debug!(name = %name, "Event subscription removed");
        }
    }

    fn handle_system_reset(&self, payload: &[u8]) {
        let reset = match decode_system_reset(payload) {
            Ok(reset) => reset,
            Err(err) => {
                warn!(error = %err, "Invalid system reset event");
                return;
            }
        };
        debug!(resources = ?reset.resources, access = ?reset.access, "System reset");

        let (resources, access) = {
            let registry = self.registry.lock();
            (
                matching_hubs(&registry, &reset.resources),
                matching_hubs(&registry, &reset.access),
            )
        };
        let throttle = Throttle::new(self.reset_throttle);
        for hub in resources {
            hub.handle_reset_resource(throttle.clone());
        }
        for hub in access {
            hub.handle_reset_access(throttle.clone());
        }
    }
}

fn matching_hubs(registry: &Registry, patterns: &[String]) -> Vec<Arc<EventSubscription>> {
    let patterns: Vec<ResourcePattern> = patterns
        .iter()
        .map(|p| ResourcePattern::parse(p))
        .filter(|p| {
            if !p.is_valid() {
                debug!(pattern = ?p, "Ignoring invalid reset pattern");
            }
            p.is_valid()
        })
        .collect();
    if patterns.is_empty() {
        return Vec::new();
    }
    registry
        .hubs
        .values()
        .filter(|hub| patterns.iter().any(|p| p.matches(hub.name())))
        .cloned()
        .collect()
}
