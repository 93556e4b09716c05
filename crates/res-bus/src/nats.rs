//! # NATS Bus
//!
//! [`BusClient`] implementation on top of `async-nats`.
//!
//! Outbound operations are queued to a single command task so subscriptions
//! and requests reach the server in call order. Inbound messages from every
//! subscription and the shared reply inbox are funnelled into one listener
//! task, which invokes handlers and callbacks sequentially.

use crate::client::{BusClient, BusMessage, ClosedHandler, MessageHandler, ResponseCallback, Unsubscriber};
use crate::error::BusError;
use crate::pending::{cleanup_task, PendingRequestStore};
use crate::{DEFAULT_REQUEST_TIMEOUT, MAX_CONTROL_LINE_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Interval between sweeps for timed out requests.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(100);

/// Reconnect attempts before the connection is considered lost.
const MAX_RECONNECTS: usize = 60;

/// Length reserved for the reply inbox when validating subjects.
const INBOX_LEN: usize = 64;

enum Command {
    Subscribe {
        id: u64,
        subject: String,
        handler: MessageHandler,
    },
    Unsubscribe {
        id: u64,
    },
    Request {
        id: u64,
        subject: String,
        payload: Bytes,
    },
    Close,
}

enum Inbound {
    Message(MessageHandler, BusMessage),
    Reply(async_nats::Message),
}

struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    tasks: Vec<JoinHandle<()>>,
}

/// NATS backed bus client.
pub struct NatsBus {
    url: String,
    name: String,
    pending: Arc<PendingRequestStore>,
    connection: Mutex<Option<Connection>>,
    closing: Arc<AtomicBool>,
    closed_handler: Arc<Mutex<Option<ClosedHandler>>>,
    next_sub_id: AtomicU64,
}

impl NatsBus {
    /// Create a client for the server at `url` with the default request timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            name: "res-gateway".to_string(),
            pending: Arc::new(PendingRequestStore::new(request_timeout)),
            connection: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            closed_handler: Arc::new(Mutex::new(None)),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Server URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pending request store (for metrics).
    pub fn pending(&self) -> &PendingRequestStore {
        &self.pending
    }

    fn send_command(&self, command: Command) -> Result<(), BusError> {
        match self.connection.lock().as_ref() {
            Some(conn) => conn.commands.send(command).map_err(|_| BusError::Closed),
            None => Err(BusError::NotConnected),
        }
    }
}

struct NatsUnsubscriber {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Unsubscriber for NatsUnsubscriber {
    fn unsubscribe(&self) -> Result<(), BusError> {
        self.commands
            .send(Command::Unsubscribe { id: self.id })
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl BusClient for NatsBus {
    async fn connect(&self) -> Result<(), BusError> {
        info!(url = %self.url, "Connecting to NATS");

        let closing = self.closing.clone();
        let closed_handler = self.closed_handler.clone();
        let client = async_nats::ConnectOptions::new()
            .name(&self.name)
            .max_reconnects(MAX_RECONNECTS)
            .event_callback(move |event| {
                let closing = closing.clone();
                let closed_handler = closed_handler.clone();
                async move {
                    match event {
                        async_nats::Event::Closed => {
                            if !closing.swap(true, Ordering::SeqCst) {
                                error!("NATS connection closed");
                                let handler = closed_handler.lock().clone();
                                if let Some(handler) = handler {
                                    handler(BusError::Closed);
                                }
                            }
                        }
                        async_nats::Event::Disconnected => warn!("Disconnected from NATS"),
                        async_nats::Event::Connected => info!("Connected to NATS"),
                        other => debug!(event = %other, "NATS event"),
                    }
                }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let inbox_prefix = client.new_inbox();
        let mut inbox = client
            .subscribe(format!("{}.*", inbox_prefix))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let reply_tx = inbound_tx.clone();
        let inbox_task = tokio::spawn(async move {
            while let Some(msg) = inbox.next().await {
                if reply_tx.send(Inbound::Reply(msg)).is_err() {
                    break;
                }
            }
        });

        let listener = tokio::spawn(listen(inbound_rx, self.pending.clone()));
        // Detached: flushes and exits once it receives `Command::Close`.
        tokio::spawn(run_commands(
            client,
            command_rx,
            inbound_tx,
            self.pending.clone(),
            inbox_prefix,
        ));
        let cleanup = tokio::spawn(cleanup_task(self.pending.clone(), CLEANUP_INTERVAL));

        self.closing.store(false, Ordering::SeqCst);
        *self.connection.lock() = Some(Connection {
            commands: command_tx,
            tasks: vec![inbox_task, listener, cleanup],
        });

        info!(url = %self.url, "NATS client ready");
        Ok(())
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let Some(conn) = self.connection.lock().take() else {
            return;
        };
        let _ = conn.commands.send(Command::Close);
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let failed = pending.fail_all(BusError::Closed);
            if failed > 0 {
                debug!(failed = failed, "Failed pending requests on close");
            }
            for task in conn.tasks {
                task.abort();
            }
        });
        info!(url = %self.url, "NATS client closed");
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.connection.lock().is_none()
    }

    fn set_closed_handler(&self, handler: ClosedHandler) {
        *self.closed_handler.lock() = Some(handler);
    }

    fn subscribe(
        &self,
        namespace: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Unsubscriber>, BusError> {
        if namespace.len() > MAX_CONTROL_LINE_SIZE - 2 {
            return Err(BusError::SubjectTooLong);
        }

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let subject = format!("{}.*", namespace);
        trace!(subject = %subject, "S=>");

        let commands = match self.connection.lock().as_ref() {
            Some(conn) => conn.commands.clone(),
            None => return Err(BusError::NotConnected),
        };
        commands
            .send(Command::Subscribe {
                id,
                subject,
                handler,
            })
            .map_err(|_| BusError::Closed)?;

        Ok(Box::new(NatsUnsubscriber { id, commands }))
    }

    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback) {
        if subject.len() + INBOX_LEN > MAX_CONTROL_LINE_SIZE {
            tokio::spawn(async move { callback(Err(BusError::SubjectTooLong)) });
            return;
        }

        let id = self.pending.register(subject, callback);
        trace!(request_id = id, subject = subject, "<==");

        let sent = self.send_command(Command::Request {
            id,
            subject: subject.to_string(),
            payload,
        });
        if let Err(err) = sent {
            let pending = self.pending.clone();
            tokio::spawn(async move {
                pending.fail(id, err);
            });
        }
    }
}

async fn run_commands(
    client: async_nats::Client,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<Inbound>,
    pending: Arc<PendingRequestStore>,
    inbox_prefix: String,
) {
    let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe {
                id,
                subject,
                handler,
            } => match client.subscribe(subject.clone()).await {
                Ok(mut subscriber) => {
                    let tx = inbound.clone();
                    let task = tokio::spawn(async move {
                        while let Some(msg) = subscriber.next().await {
                            let message = BusMessage::new(msg.subject.to_string(), msg.payload);
                            if tx.send(Inbound::Message(handler.clone(), message)).is_err() {
                                break;
                            }
                        }
                    });
                    subscriptions.insert(id, task);
                }
                Err(e) => error!(subject = %subject, error = %e, "Failed to subscribe"),
            },
            Command::Unsubscribe { id } => {
                // Dropping the subscriber unsubscribes on the server.
                if let Some(task) = subscriptions.remove(&id) {
                    task.abort();
                }
            }
            Command::Request {
                id,
                subject,
                payload,
            } => {
                let reply = format!("{}.{}", inbox_prefix, id);
                if let Err(e) = client.publish_with_reply(subject, reply, payload).await {
                    pending.fail(id, BusError::Publish(e.to_string()));
                }
            }
            Command::Close => break,
        }
    }

    for (_, task) in subscriptions {
        task.abort();
    }
    if let Err(e) = client.flush().await {
        debug!(error = %e, "Flush on close failed");
    }
}

async fn listen(mut inbound: mpsc::UnboundedReceiver<Inbound>, pending: Arc<PendingRequestStore>) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Message(handler, message) => {
                trace!(subject = %message.subject, "=>>");
                handler(message);
            }
            Inbound::Reply(msg) => handle_reply(&pending, msg),
        }
    }
}

fn handle_reply(pending: &PendingRequestStore, msg: async_nats::Message) {
    let Some(id) = msg
        .subject
        .as_str()
        .rsplit('.')
        .next()
        .and_then(|token| token.parse::<u64>().ok())
    else {
        warn!(subject = %msg.subject, "Reply on malformed inbox subject");
        return;
    };

    if msg.status == Some(async_nats::StatusCode::NO_RESPONDERS) {
        trace!(request_id = id, "x=> No responders");
        pending.complete(id, Err(BusError::NoResponders));
        return;
    }

    if is_meta_response(&msg.payload) {
        if let Some(timeout) = parse_meta_timeout(&msg.payload) {
            pending.extend(id, timeout);
        }
        return;
    }

    trace!(request_id = id, "==>");
    pending.complete(id, Ok(msg.payload));
}

/// A payload starting with a letter carries request metadata, not a reply.
fn is_meta_response(payload: &[u8]) -> bool {
    payload.first().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Parse `timeout:"<ms>"` out of a meta response.
fn parse_meta_timeout(payload: &[u8]) -> Option<Duration> {
    let text = std::str::from_utf8(payload).ok()?;
    let rest = &text[text.find("timeout:\"")? + "timeout:\"".len()..];
    let end = rest.find('"')?;
    rest[..end].parse::<u64>().ok().map(Duration::from_millis)
}
