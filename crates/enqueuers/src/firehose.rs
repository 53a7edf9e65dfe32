use crate::{Enqueuer, SubscriptionError, mismatch};
use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use concepts::{ClientId, EventType, Target, TargetFilter, TargetKey, TriggerOptions, TriggerType};
use futures_util::{SinkExt as _, StreamExt as _};
use indexmap::IndexMap;
use queue::EventQueue;
use queue::firehose::{
    CLOSE_EVENT, CONNECTION_EVENT, ClientDescriptor, ClientPool, FirehoseError, FirehosePayload,
    FirehoseQueue, Message, PoolDescriptor,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Instrument as _, Level, debug, info, info_span, instrument, warn};

/// Event-name pattern of a firehose trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EventPattern {
    /// `*`: any custom event and `connection`.
    Any,
    /// `**`: every event including `close`.
    All,
    Exact(String),
}

impl EventPattern {
    pub(crate) fn parse(pattern: &str) -> Result<Self, SubscriptionError> {
        match pattern {
            "" => Err(SubscriptionError::EmptyEventPattern),
            "*" => Ok(Self::Any),
            "**" => Ok(Self::All),
            exact => Ok(Self::Exact(exact.to_string())),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => name != CLOSE_EVENT,
            Self::All => true,
            Self::Exact(exact) => exact == name,
        }
    }
}

/// Frames queued for a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Message(Message),
    Close,
}

struct Client {
    remote_address: String,
    sender: mpsc::UnboundedSender<Outgoing>,
}

struct Subscription {
    pattern: EventPattern,
    target: Arc<Target>,
}

/// Websocket hub. Incoming messages become `FIREHOSE` events, and workers reply
/// through the [`ClientPool`] implementation.
pub struct FirehoseEnqueuer {
    queue: EventQueue,
    firehose_queue: Arc<FirehoseQueue>,
    subscriptions: Mutex<IndexMap<TargetKey, Subscription>>,
    clients: Mutex<IndexMap<ClientId, Client>>,
}

impl FirehoseEnqueuer {
    #[must_use]
    pub fn new(queue: EventQueue, firehose_queue: Arc<FirehoseQueue>) -> Self {
        Self {
            queue,
            firehose_queue,
            subscriptions: Mutex::default(),
            clients: Mutex::default(),
        }
    }

    pub fn router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route("/", get(websocket_handler))
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    /// Registers a client and dispatches its `connection` message.
    pub async fn connect(
        &self,
        remote_address: String,
    ) -> (ClientDescriptor, mpsc::UnboundedReceiver<Outgoing>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = ClientDescriptor {
            id: ClientId::generate(),
            remote_address,
        };
        self.clients.lock().unwrap().insert(
            client.id,
            Client {
                remote_address: client.remote_address.clone(),
                sender,
            },
        );
        info!(client_id = %client.id, remote_address = %client.remote_address, "Client connected");
        self.dispatch(
            client.clone(),
            Message::new(CONNECTION_EVENT, serde_json::Value::Null),
        )
        .await;
        (client, receiver)
    }

    pub async fn handle_message(&self, client_id: &ClientId, message: Message) {
        let remote_address = self
            .clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|client| client.remote_address.clone());
        let Some(remote_address) = remote_address else {
            debug!(%client_id, "Dropping message of disconnected client");
            return;
        };
        self.dispatch(
            ClientDescriptor {
                id: *client_id,
                remote_address,
            },
            message,
        )
        .await;
    }

    /// Removes the client and dispatches its `close` message.
    pub async fn disconnect(&self, client_id: &ClientId) {
        let removed = self.clients.lock().unwrap().shift_remove(client_id);
        if let Some(client) = removed {
            info!(%client_id, "Client disconnected");
            self.dispatch(
                ClientDescriptor {
                    id: *client_id,
                    remote_address: client.remote_address,
                },
                Message::new(CLOSE_EVENT, serde_json::Value::Null),
            )
            .await;
        }
    }

    async fn dispatch(&self, client: ClientDescriptor, message: Message) {
        let targets: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|subscription| subscription.pattern.matches(&message.name))
            .map(|subscription| subscription.target.clone())
            .collect();
        let pool = PoolDescriptor { size: self.size() };
        for target in targets {
            let event = self.queue.new_event(EventType::Firehose, &target);
            let event_id = event.id;
            debug!(%event_id, handler = %target.handler, name = %message.name, "Enqueuing firehose message");
            self.firehose_queue.enqueue(
                event_id,
                FirehosePayload {
                    client: client.clone(),
                    pool,
                    message: message.clone(),
                },
            );
            if let Err(err) = self.queue.enqueue(event).await {
                let _ = self.firehose_queue.pop(&event_id);
                warn!("Cannot enqueue firehose message: {err}");
                return;
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote_addr: SocketAddr) {
        let (client, mut outgoing) = self.connect(remote_addr.to_string()).await;
        let client_id = client.id;
        let (mut sender, mut receiver) = socket.split();

        let mut send_task = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                match frame {
                    Outgoing::Message(message) => {
                        let json = serde_json::to_string(&message).unwrap_or_default();
                        if sender.send(ws::Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sender.send(ws::Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let mut recv_task = tokio::spawn({
            let hub = self.clone();
            async move {
                while let Some(Ok(frame)) = receiver.next().await {
                    match frame {
                        ws::Message::Text(text) => {
                            match serde_json::from_str::<Message>(text.as_str()) {
                                Ok(message) => hub.handle_message(&client_id, message).await,
                                Err(err) => debug!("Ignoring malformed message: {err}"),
                            }
                        }
                        ws::Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
            .in_current_span()
        });

        tokio::select! {
            _ = (&mut send_task) => recv_task.abort(),
            _ = (&mut recv_task) => send_task.abort(),
        };
        self.disconnect(&client_id).await;
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<FirehoseEnqueuer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        hub.handle_socket(socket, remote_addr)
            .instrument(info_span!("firehose client", %remote_addr))
    })
}

impl ClientPool for FirehoseEnqueuer {
    fn size(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    fn send(&self, client_id: &ClientId, message: Message) -> Result<(), FirehoseError> {
        let clients = self.clients.lock().unwrap();
        let client = clients
            .get(client_id)
            .ok_or(FirehoseError::NoClient(*client_id))?;
        client
            .sender
            .send(Outgoing::Message(message))
            .map_err(|_| FirehoseError::NoClient(*client_id))
    }

    fn send_all(&self, message: Message) {
        for client in self.clients.lock().unwrap().values() {
            let _ = client.sender.send(Outgoing::Message(message.clone()));
        }
    }

    fn close(&self, client_id: &ClientId) -> Result<(), FirehoseError> {
        let clients = self.clients.lock().unwrap();
        let client = clients
            .get(client_id)
            .ok_or(FirehoseError::NoClient(*client_id))?;
        let _ = client.sender.send(Outgoing::Close);
        Ok(())
    }
}

#[async_trait]
impl Enqueuer for FirehoseEnqueuer {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Firehose
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %target.handler))]
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError> {
        let TriggerOptions::Firehose { event } = options else {
            return Err(mismatch(TriggerType::Firehose, options));
        };
        let pattern = EventPattern::parse(event)?;
        debug!(?pattern, "Subscribing to firehose");
        self.subscriptions
            .lock()
            .unwrap()
            .insert(target.key(), Subscription { pattern, target });
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cwd = ?filter.cwd, handler = ?filter.handler))]
    async fn unsubscribe(&self, filter: &TargetFilter) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|key, _| !filter.matches_key(key));
    }
}
