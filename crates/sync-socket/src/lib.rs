//! Tokio runtime driving the synchronization engine from wire traffic.
//!
//! One event loop owns the room store, the order tracker and the driver
//! subscription; namespace connection tasks feed it wire frames and
//! lifecycle signals. All store mutation happens on the loop, persistence
//! and REST work are asynchronous, and teardown cancels owned tasks before
//! replacements start.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sync_core::{
    ChatKind, ChatMode, ChatSession, ConnectionStateMachine, DriverWatch, GeoPoint, IngestOutcome,
    IngressPipeline, Message, MessageKind, MessageMeta, Namespace, OrderTracker, OrderUpdate,
    PushOutcome, RetryPolicy, Room, RoomStore, SessionStatus, StoreSnapshot, SupportSession,
    SyncChannels, SyncCommand, SyncError, SyncErrorCategory, SyncEvent, WireEvent, WireFrame,
    channel::EventStream, handoff, ingress, resolver, resolver::KnownIds, wire,
};
use sync_platform::{StateStore, Transport, TransportFactory};

pub mod config;
pub mod rest;

pub use config::{ConfigError, SyncConfig};
pub use rest::{HttpOrderApi, OrderApi, StaticOrderApi};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const INTERNAL_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 64;

/// Cloneable handle for sending commands and subscribing to events.
#[derive(Clone, Debug)]
pub struct SyncRuntimeHandle {
    channels: SyncChannels,
}

impl SyncRuntimeHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), sync_core::SyncChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Hydrate the store and spawn the runtime loop plus persistence writer.
pub fn spawn_runtime<F, A, S>(
    sync_config: SyncConfig,
    factory: F,
    order_api: A,
    state_store: S,
) -> SyncRuntimeHandle
where
    F: TransportFactory + 'static,
    A: OrderApi + 'static,
    S: StateStore + 'static,
{
    let (channels, command_rx) = SyncChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);

    let mut store = RoomStore::new();
    match state_store.hydrate() {
        Ok(snapshot) => store.hydrate_from(snapshot),
        Err(err) => warn!(%err, "hydration failed; starting with empty store"),
    }

    let (persist_tx, persist_rx) = watch::channel(store.snapshot());
    let state_store = Arc::new(state_store);
    tokio::spawn(persistence_writer(state_store, persist_rx));

    let ingress = IngressPipeline::new(sync_config.local_user_id.clone());
    let last_persisted_revision = store.revision();
    let runtime: SyncRuntime<F, A> = SyncRuntime {
        config: sync_config,
        channels: channels.clone(),
        command_rx,
        internal_tx,
        internal_rx,
        factory: Arc::new(factory),
        order_api: Arc::new(order_api),
        store,
        ingress,
        tracker: OrderTracker::new(),
        machines: HashMap::new(),
        connections: HashMap::new(),
        driver: None,
        outbox: Vec::new(),
        persist_tx,
        last_persisted_revision,
    };

    tokio::spawn(async move {
        runtime.run().await;
    });

    SyncRuntimeHandle { channels }
}

/// Single-writer coalescing persistence queue: only the newest snapshot is
/// ever flushed, and a failed write is retried by the next mutation.
async fn persistence_writer<S: StateStore>(
    state_store: Arc<S>,
    mut persist_rx: watch::Receiver<StoreSnapshot>,
) {
    while persist_rx.changed().await.is_ok() {
        let snapshot = persist_rx.borrow_and_update().clone();
        if let Err(err) = state_store.persist(&snapshot) {
            warn!(%err, "persistence write failed; memory stays authoritative");
        }
    }
}

/// Lifecycle signals and frames produced by the connection tasks.
#[derive(Debug)]
enum InternalEvent {
    Connected(Namespace),
    Disconnected(Namespace),
    GaveUp(Namespace),
    Frame(Namespace, WireFrame),
}

struct ConnectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    outbound_tx: mpsc::Sender<WireFrame>,
}

/// Send buffered while the chat connection is away; flushed on reconnect,
/// surfaced as a failed ack when the connection gives up.
struct PendingSend {
    client_txn_id: String,
    frame: WireFrame,
}

struct DriverSubscription {
    watch: DriverWatch,
    inactive_at: Option<Instant>,
}

struct SyncRuntime<F: TransportFactory, A: OrderApi> {
    config: SyncConfig,
    channels: SyncChannels,
    command_rx: mpsc::Receiver<SyncCommand>,
    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    factory: Arc<F>,
    order_api: Arc<A>,
    store: RoomStore,
    ingress: IngressPipeline,
    tracker: OrderTracker,
    machines: HashMap<Namespace, ConnectionStateMachine>,
    connections: HashMap<Namespace, ConnectionTask>,
    driver: Option<DriverSubscription>,
    outbox: Vec<PendingSend>,
    persist_tx: watch::Sender<StoreSnapshot>,
    last_persisted_revision: u64,
}

const NAMESPACES: [Namespace; 3] = [
    Namespace::Chat,
    Namespace::OrderTracking,
    Namespace::DriverLocation,
];

impl<F, A> SyncRuntime<F, A>
where
    F: TransportFactory + 'static,
    A: OrderApi + 'static,
{
    async fn run(mut self) {
        loop {
            let inactivity_deadline = self.driver.as_ref().and_then(|sub| sub.inactive_at);

            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command).await {
                        self.surface_error(err);
                    }
                }
                event = self.internal_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_internal(event).await;
                }
                _ = tokio::time::sleep_until(
                    inactivity_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                ), if inactivity_deadline.is_some() => {
                    self.handle_driver_inactive();
                }
            }

            self.flush_persistence();
        }

        self.teardown_connections().await;
    }

    fn surface_error(&self, err: SyncError) {
        let recoverable = matches!(
            err.category,
            SyncErrorCategory::Connection | SyncErrorCategory::Persistence
        );
        warn!(code = %err.code, message = %err.message, "command failed");
        self.channels.emit(SyncEvent::FatalError {
            code: err.code,
            message: err.message,
            recoverable,
        });
    }

    async fn handle_command(&mut self, command: SyncCommand) -> Result<(), SyncError> {
        match command {
            SyncCommand::Connect { auth_token } => self.handle_connect(auth_token),
            SyncCommand::Disconnect => {
                self.teardown_connections().await;
                self.driver = None;
                Ok(())
            }
            SyncCommand::StartSupportChat { kind } => self.handle_start_support_chat(kind),
            SyncCommand::StartOrderChat {
                with_user_id,
                order_id,
            } => self.handle_start_order_chat(with_user_id, order_id),
            SyncCommand::SendChatMessage { content, kind } => {
                self.handle_send_chat_message(content, kind);
                Ok(())
            }
            SyncCommand::SelectRoom { room_id } => {
                self.store.set_active_room(Some(room_id.clone()));
                self.channels.emit(SyncEvent::ActiveRoomChanged {
                    room_id: Some(room_id.clone()),
                });
                self.emit_room_updated(&room_id);
                Ok(())
            }
            SyncCommand::FetchHistory { room_id } => self.handle_fetch_history(room_id),
            SyncCommand::SubscribeDriver { driver_id } => self.handle_subscribe_driver(driver_id),
            SyncCommand::UnsubscribeDriver => {
                self.driver = None;
                Ok(())
            }
            SyncCommand::ClearDeliveredOrder { order_id } => {
                if self.tracker.remove(&order_id) {
                    self.channels
                        .emit(SyncEvent::OrderTrackingRemoved { order_id });
                }
                Ok(())
            }
            SyncCommand::CloseSession { kind } => {
                self.handle_close_session(kind);
                Ok(())
            }
            SyncCommand::Logout => {
                self.handle_logout().await;
                Ok(())
            }
        }
    }

    fn handle_connect(&mut self, auth_token: String) -> Result<(), SyncError> {
        // Validate every namespace transition before committing any of them.
        let mut candidates = Vec::with_capacity(NAMESPACES.len());
        for namespace in NAMESPACES {
            let mut candidate = self
                .machines
                .get(&namespace)
                .cloned()
                .unwrap_or_default();
            candidate.on_connect_requested()?;
            candidates.push((namespace, candidate));
        }

        for (namespace, candidate) in candidates {
            self.machines.insert(namespace, candidate);
            self.spawn_connection(namespace, auth_token.clone());
        }
        Ok(())
    }

    fn spawn_connection(&mut self, namespace: Namespace, auth_token: String) {
        if let Some(previous) = self.connections.remove(&namespace) {
            previous.cancel.cancel();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_connection(
            Arc::clone(&self.factory),
            namespace,
            auth_token,
            self.config.retry_policy(),
            self.internal_tx.clone(),
            outbound_rx,
            cancel.child_token(),
        ));

        self.connections.insert(
            namespace,
            ConnectionTask {
                cancel,
                handle,
                outbound_tx,
            },
        );
    }

    fn handle_start_support_chat(&mut self, kind: ChatKind) -> Result<(), SyncError> {
        if kind == ChatKind::Order {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "wrong_chat_kind",
                "order chats start via StartOrderChat",
            ));
        }
        self.require_connected(Namespace::Chat, "start_support_chat")?;

        let now_ms = now_millis();
        let pending_id = resolver::pending_room_id(kind);
        self.store.ensure_room(&pending_id, kind, now_ms);
        self.store.upsert_session(ChatSession {
            kind,
            room_id: pending_id.clone(),
            counterpart_ref: None,
            order_id: None,
            status: SessionStatus::Active,
            created_at_ms: now_ms,
            last_message_at_ms: None,
        });
        self.store.set_active_room(Some(pending_id.clone()));
        self.channels.emit(SyncEvent::ActiveRoomChanged {
            room_id: Some(pending_id),
        });

        self.forward_frame(Namespace::Chat, wire::start_support_chat_frame(kind))
    }

    fn handle_start_order_chat(
        &mut self,
        with_user_id: String,
        order_id: String,
    ) -> Result<(), SyncError> {
        self.require_connected(Namespace::Chat, "start_order_chat")?;

        let now_ms = now_millis();
        let pending_id = resolver::pending_room_id(ChatKind::Order);
        self.store.ensure_room(&pending_id, ChatKind::Order, now_ms);
        self.store.upsert_session(ChatSession {
            kind: ChatKind::Order,
            room_id: pending_id.clone(),
            counterpart_ref: Some(with_user_id.clone()),
            order_id: Some(order_id.clone()),
            status: SessionStatus::Active,
            created_at_ms: now_ms,
            last_message_at_ms: None,
        });
        self.store.set_active_room(Some(pending_id.clone()));
        self.channels.emit(SyncEvent::ActiveRoomChanged {
            room_id: Some(pending_id),
        });

        self.forward_frame(
            Namespace::Chat,
            wire::start_chat_frame(&with_user_id, &order_id),
        )
    }

    /// Optimistic send: the local message is admitted synchronously; the
    /// frame is forwarded when connected, buffered while reconnecting, and
    /// acknowledged as failed otherwise. Nothing is ever dropped silently.
    fn handle_send_chat_message(&mut self, content: String, kind: MessageKind) {
        let Some(room_id) = self.store.active_room_id().map(ToOwned::to_owned) else {
            self.channels.emit(ingress::send_ack_event(
                Uuid::new_v4().to_string(),
                Some("no_active_room"),
            ));
            return;
        };

        let now_ms = now_millis();
        let client_txn_id = Uuid::new_v4().to_string();
        let message = Message {
            message_id: client_txn_id.clone(),
            room_id: room_id.clone(),
            sender_id: self.ingress.local_user_id().to_owned(),
            content: content.clone(),
            kind,
            timestamp_ms: now_ms,
            metadata: MessageMeta::None,
        };

        self.ingress.note_optimistic_send(&room_id, &content);
        self.store.add_message(message.clone(), false);
        self.channels.emit(SyncEvent::MessageAdded { message });
        self.emit_room_updated(&room_id);

        let room_kind = self
            .store
            .room(&room_id)
            .map(|room| room.kind)
            .unwrap_or(ChatKind::Order);
        let frame = match room_kind {
            ChatKind::Order => wire::send_message_frame(&room_id, &content, kind),
            ChatKind::Support | ChatKind::Chatbot => {
                let Some(session_id) = self
                    .store
                    .support_session()
                    .map(|session| session.session_id.clone())
                else {
                    self.channels
                        .emit(ingress::send_ack_event(client_txn_id, Some("no_support_session")));
                    return;
                };
                wire::send_support_message_frame(
                    &session_id,
                    &content,
                    kind,
                    kind == MessageKind::Options,
                )
            }
        };

        let chat_state = self
            .machines
            .get(&Namespace::Chat)
            .map(ConnectionStateMachine::state)
            .unwrap_or(sync_core::ConnectionState::Idle);
        use sync_core::ConnectionState::*;
        match chat_state {
            Connected => {
                let result = self.forward_frame(Namespace::Chat, frame.clone());
                match result {
                    Ok(()) => self
                        .channels
                        .emit(ingress::send_ack_event(client_txn_id, None)),
                    Err(_) => self.outbox.push(PendingSend {
                        client_txn_id,
                        frame,
                    }),
                }
            }
            Connecting | Reconnecting => {
                debug!("buffering send until the chat connection returns");
                self.outbox.push(PendingSend {
                    client_txn_id,
                    frame,
                });
            }
            Idle | GaveUp | Disconnected => {
                self.channels
                    .emit(ingress::send_ack_event(client_txn_id, Some("not_connected")));
            }
        }
    }

    fn handle_fetch_history(&mut self, room_id: String) -> Result<(), SyncError> {
        self.require_connected(Namespace::Chat, "fetch_history")?;

        let room_kind = self
            .store
            .room(&room_id)
            .map(|room| room.kind)
            .unwrap_or(ChatKind::Order);
        let frame = match room_kind {
            ChatKind::Order => wire::get_chat_history_frame(&room_id),
            ChatKind::Support | ChatKind::Chatbot => {
                let session_id = self
                    .store
                    .support_session()
                    .map(|session| session.session_id.clone())
                    .ok_or_else(|| {
                        SyncError::new(
                            SyncErrorCategory::Config,
                            "no_support_session",
                            "support history requires an active support session",
                        )
                    })?;
                wire::get_support_history_frame(&session_id)
            }
        };
        self.forward_frame(Namespace::Chat, frame)
    }

    fn handle_subscribe_driver(&mut self, driver_id: String) -> Result<(), SyncError> {
        self.require_connected(Namespace::DriverLocation, "subscribe_driver")?;

        if let Some(existing) = &self.driver
            && existing.watch.driver_id() == driver_id
        {
            return Ok(());
        }

        // Replacing the subscription drops the previous watch and its
        // inactivity deadline before the new subscribe goes out, so a stale
        // driver push can never mutate the new watch.
        self.driver = Some(DriverSubscription {
            watch: DriverWatch::new(driver_id.clone(), self.config.arrival_eta_threshold_minutes),
            inactive_at: None,
        });
        self.forward_frame(
            Namespace::DriverLocation,
            wire::subscribe_driver_location_frame(&driver_id),
        )
    }

    fn handle_close_session(&mut self, kind: ChatKind) {
        let ended = self.store.end_session(kind);
        if let Some(session) = ended {
            if self.store.active_room_id() == Some(session.room_id.as_str()) {
                self.store.set_active_room(None);
                self.channels
                    .emit(SyncEvent::ActiveRoomChanged { room_id: None });
            }
            self.ingress.forget_room(&session.room_id);
        }

        if kind != ChatKind::Order
            && let Some(support) = self.store.support_session().cloned()
        {
            let mut ended = support;
            ended.status = "ENDED".to_owned();
            self.store.set_support_session(ended.clone());
            self.channels
                .emit(SyncEvent::SupportSessionUpdated { session: ended });
        }
    }

    async fn handle_logout(&mut self) {
        self.teardown_connections().await;
        self.driver = None;
        self.outbox.clear();
        self.store.clear();
        self.tracker.clear();
        self.channels.emit(SyncEvent::TrackingCleared);
        self.channels
            .emit(SyncEvent::ActiveRoomChanged { room_id: None });
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Connected(namespace) => self.handle_connected(namespace).await,
            InternalEvent::Disconnected(namespace) => {
                if let Some(machine) = self.machines.get_mut(&namespace) {
                    match machine.on_connection_lost() {
                        Ok(_) => self.channels.emit(SyncEvent::ConnectionChanged {
                            namespace,
                            connected: false,
                        }),
                        // Explicit disconnect already moved the machine on.
                        Err(err) => debug!(?namespace, code = %err.code, "ignoring late loss signal"),
                    }
                }
            }
            InternalEvent::GaveUp(namespace) => self.handle_gave_up(namespace),
            InternalEvent::Frame(namespace, frame) => self.handle_frame(namespace, frame).await,
        }
    }

    async fn handle_connected(&mut self, namespace: Namespace) {
        if let Some(machine) = self.machines.get_mut(&namespace) {
            if let Err(err) = machine.on_connected() {
                debug!(?namespace, code = %err.code, "ignoring late connect signal");
                return;
            }
        }
        self.channels.emit(SyncEvent::ConnectionChanged {
            namespace,
            connected: true,
        });
        info!(?namespace, "namespace connected");

        match namespace {
            Namespace::Chat => self.flush_outbox(),
            // Pushes may have been missed while offline: reconcile against
            // the authoritative list on every successful (re)connect.
            Namespace::OrderTracking => self.reconcile_orders().await,
            Namespace::DriverLocation => {
                if let Some(driver_id) = self
                    .driver
                    .as_ref()
                    .map(|sub| sub.watch.driver_id().to_owned())
                {
                    let _ = self.forward_frame(
                        Namespace::DriverLocation,
                        wire::subscribe_driver_location_frame(&driver_id),
                    );
                }
            }
        }
    }

    fn handle_gave_up(&mut self, namespace: Namespace) {
        if let Some(machine) = self.machines.get_mut(&namespace)
            && let Err(err) = machine.on_retry_exhausted()
        {
            debug!(?namespace, code = %err.code, "ignoring late give-up signal");
            return;
        }
        self.connections.remove(&namespace);

        warn!(?namespace, "reconnect attempts exhausted");
        self.channels.emit(SyncEvent::ConnectionChanged {
            namespace,
            connected: false,
        });
        self.channels
            .emit(SyncEvent::ConnectionGaveUp { namespace });

        // Session identifiers survive; tracking state does not.
        self.tracker.clear();
        self.channels.emit(SyncEvent::TrackingCleared);

        if namespace == Namespace::Chat {
            for pending in std::mem::take(&mut self.outbox) {
                self.channels.emit(ingress::send_ack_event(
                    pending.client_txn_id,
                    Some("connection_gave_up"),
                ));
            }
        }
    }

    async fn handle_frame(&mut self, namespace: Namespace, frame: WireFrame) {
        let connected = self
            .machines
            .get(&namespace)
            .is_some_and(ConnectionStateMachine::is_connected);
        if !connected {
            warn!(?namespace, event = %frame.event, "dropping frame while disconnected");
            return;
        }

        let parsed = match wire::parse_wire_event(&frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event = %frame.event, "ignoring unmodeled wire event");
                return;
            }
            Err(err) => {
                warn!(event = %frame.event, code = %err.code, message = %err.message, "dropping invalid payload");
                return;
            }
        };

        match parsed {
            WireEvent::SupportChatStarted(payload) => self.on_support_chat_started(payload),
            WireEvent::ChatbotMessage(payload) => self.on_chatbot_message(payload),
            WireEvent::AgentMessage(payload) => self.on_agent_message(payload),
            WireEvent::ChatStarted(payload) => self.on_chat_started(payload),
            WireEvent::NewMessage(payload) => self.on_new_message(payload),
            WireEvent::ChatHistory(payload) => self.on_chat_history(payload),
            WireEvent::SupportHistory(payload) => self.on_support_history(payload),
            WireEvent::OrderStatusPush(payload) => self.on_order_status_push(payload).await,
            WireEvent::DriverLocation(payload) => self.on_driver_location(payload),
        }
    }

    fn on_support_chat_started(&mut self, payload: wire::SupportChatStartedPayload) {
        let now_ms = now_millis();
        let kind = payload.kind;
        let chat_mode = if kind == ChatKind::Chatbot {
            ChatMode::Chatbot
        } else {
            ChatMode::Agent
        };

        let session = SupportSession {
            session_id: payload.session_id.clone(),
            chat_mode,
            status: "ACTIVE".to_owned(),
            priority: payload.priority.unwrap_or_else(|| "NORMAL".to_owned()),
            category: payload.category,
            sla_deadline_ms: payload.sla_deadline,
        };
        self.store.set_support_session(session.clone());

        let room_id = resolver::resolve_room_id(
            kind,
            KnownIds {
                session_id: Some(&payload.session_id),
                server_room_id: None,
            },
        );
        let pending_id = resolver::pending_room_id(kind);
        self.store
            .migrate_pending_room(&pending_id, &room_id, now_ms);
        self.ingress.retarget_room(&pending_id, &room_id);
        self.store.ensure_room(&room_id, kind, now_ms);
        if self.store.session(kind).is_none() {
            self.store.upsert_session(ChatSession {
                kind,
                room_id: room_id.clone(),
                counterpart_ref: None,
                order_id: None,
                status: SessionStatus::Active,
                created_at_ms: now_ms,
                last_message_at_ms: None,
            });
        }
        self.store.set_active_room(Some(room_id.clone()));

        self.channels
            .emit(SyncEvent::SupportSessionUpdated { session });
        self.channels.emit(SyncEvent::ActiveRoomChanged {
            room_id: Some(room_id),
        });
        let _ = self.forward_frame(
            Namespace::Chat,
            wire::get_support_history_frame(&payload.session_id),
        );
    }

    fn on_chat_started(&mut self, payload: wire::ChatStartedPayload) {
        let now_ms = now_millis();
        let room_id = payload.db_room_id.clone();
        let pending_id = resolver::pending_room_id(ChatKind::Order);
        self.store
            .migrate_pending_room(&pending_id, &room_id, now_ms);
        self.ingress.retarget_room(&pending_id, &room_id);

        let mut room = Room::new(&room_id, ChatKind::Order, now_ms);
        room.order_id = payload.order_id;
        if let Some(peer) = payload.with_user.and_then(|user| user.id) {
            room.participants.insert(peer);
        }
        self.store.upsert_room(room);
        self.store.set_active_room(Some(room_id.clone()));

        self.emit_room_updated(&room_id);
        self.channels.emit(SyncEvent::ActiveRoomChanged {
            room_id: Some(room_id.clone()),
        });
        let _ = self.forward_frame(Namespace::Chat, wire::get_chat_history_frame(&room_id));
    }

    fn on_new_message(&mut self, payload: wire::NewMessagePayload) {
        let candidate = ingress::candidate_from_new_message(&payload);
        let room_id = candidate.room_id.clone();
        match self.ingress.ingest(&mut self.store, candidate, now_millis()) {
            IngestOutcome::Admitted(message) => {
                self.channels.emit(SyncEvent::MessageAdded { message });
                self.emit_room_updated(&room_id);
            }
            IngestOutcome::DroppedEcho | IngestOutcome::DroppedDuplicate => {}
        }
    }

    fn on_chatbot_message(&mut self, payload: wire::ChatbotMessagePayload) {
        let Some(session) = self.store.support_session() else {
            warn!(session_id = %payload.session_id, "chatbot message without support session dropped");
            return;
        };
        if session.session_id != payload.session_id {
            warn!(
                session_id = %payload.session_id,
                active = %session.session_id,
                "chatbot message for unknown session dropped"
            );
            return;
        }

        let room_id = resolver::chatbot_room_id(&payload.session_id);
        let candidate = ingress::candidate_from_chatbot_message(&payload, &room_id);
        match self.ingress.ingest(&mut self.store, candidate, now_millis()) {
            IngestOutcome::Admitted(message) => {
                self.channels.emit(SyncEvent::MessageAdded { message });
                self.emit_room_updated(&room_id);
            }
            IngestOutcome::DroppedEcho | IngestOutcome::DroppedDuplicate => {}
        }
    }

    fn on_agent_message(&mut self, payload: wire::AgentMessagePayload) {
        let report = match handoff::handle_agent_message(
            &mut self.store,
            &mut self.ingress,
            &payload,
            now_millis(),
        ) {
            Ok(report) => report,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "agent message dropped");
                return;
            }
        };

        if report.mode_changed {
            if let Some(session) = self.store.support_session().cloned() {
                self.channels
                    .emit(SyncEvent::SupportSessionUpdated { session });
            }
            self.channels.emit(SyncEvent::ActiveRoomChanged {
                room_id: Some(report.support_room_id.clone()),
            });
        }
        if let Some(message) = report.admitted {
            self.channels.emit(SyncEvent::MessageAdded { message });
        }
        self.emit_room_updated(&report.support_room_id);
    }

    fn on_chat_history(&mut self, payload: wire::ChatHistoryPayload) {
        let now_ms = now_millis();
        self.store
            .ensure_room(&payload.room_id, ChatKind::Order, now_ms);
        let messages = ingress::messages_from_history(&payload.messages, &payload.room_id, now_ms);
        let count = messages.len();
        self.store.replace_messages(&payload.room_id, messages);
        self.channels.emit(SyncEvent::HistoryReplaced {
            room_id: payload.room_id.clone(),
            count,
        });
        self.emit_room_updated(&payload.room_id);
    }

    fn on_support_history(&mut self, payload: wire::SupportHistoryPayload) {
        let Some(session) = self.store.support_session() else {
            warn!(session_id = %payload.session_id, "support history without session dropped");
            return;
        };
        if session.session_id != payload.session_id {
            warn!(
                session_id = %payload.session_id,
                active = %session.session_id,
                "support history for unknown session dropped"
            );
            return;
        }

        let (room_id, kind) = match session.chat_mode {
            ChatMode::Chatbot => (
                resolver::chatbot_room_id(&payload.session_id),
                ChatKind::Chatbot,
            ),
            ChatMode::Agent => (
                resolver::support_room_id(&payload.session_id),
                ChatKind::Support,
            ),
        };
        let now_ms = now_millis();
        self.store.ensure_room(&room_id, kind, now_ms);
        let messages = ingress::messages_from_history(&payload.messages, &room_id, now_ms);
        let count = messages.len();
        self.store.replace_messages(&room_id, messages);
        self.channels.emit(SyncEvent::HistoryReplaced {
            room_id: room_id.clone(),
            count,
        });
        self.emit_room_updated(&room_id);
    }

    async fn on_order_status_push(&mut self, payload: wire::OrderStatusPushPayload) {
        let update = OrderUpdate::from(&payload);
        let order_id = update.order_id.clone();
        let known_before = self.tracker.get(&order_id).is_some();

        match self.tracker.apply_push(update, now_millis()) {
            PushOutcome::Created(record) | PushOutcome::Merged(record) => {
                self.channels
                    .emit(SyncEvent::OrderTrackingUpdated { record });
            }
            PushOutcome::Unchanged => {}
        }

        // First push for an unknown order: validate it against the server
        // before trusting the stream any further.
        if !known_before {
            match self.order_api.fetch_order_status(&order_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if self.tracker.remove(&order_id) {
                        warn!(%order_id, "server confirmed order gone; dropping tracking entry");
                        self.channels
                            .emit(SyncEvent::OrderTrackingRemoved { order_id });
                    }
                }
                Err(err) => {
                    warn!(%order_id, code = %err.code, "order validation unavailable; keeping record");
                }
            }
        }
    }

    fn on_driver_location(&mut self, payload: wire::DriverLocationPayload) {
        let window = self.config.driver_inactivity_window_ms;
        let Some(sub) = self.driver.as_mut() else {
            debug!(driver_id = %payload.driver_id, "driver push without subscription ignored");
            return;
        };
        if sub.watch.driver_id() != payload.driver_id {
            warn!(
                driver_id = %payload.driver_id,
                active = %sub.watch.driver_id(),
                "stale driver push ignored"
            );
            return;
        }

        let location = GeoPoint {
            lat: payload.lat,
            lng: payload.lng,
        };
        let outcome = sub.watch.on_push(location, payload.eta, now_millis());
        sub.inactive_at = Some(Instant::now() + Duration::from_millis(window));

        self.channels.emit(SyncEvent::DriverLocationUpdated {
            driver_id: payload.driver_id.clone(),
            location,
            eta_minutes: payload.eta,
        });
        if outcome.notify_arrival {
            self.channels.emit(SyncEvent::DriverArrivingSoon {
                driver_id: payload.driver_id,
                eta_minutes: payload.eta,
            });
        }
    }

    fn handle_driver_inactive(&mut self) {
        if let Some(sub) = self.driver.as_mut() {
            debug!(driver_id = %sub.watch.driver_id(), "driver stream went silent; re-arming arrival alert");
            sub.watch.on_inactive();
            sub.inactive_at = None;
        }
    }

    async fn reconcile_orders(&mut self) {
        let entries = match self.order_api.fetch_orders().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(code = %err.code, "order reconciliation skipped");
                return;
            }
        };

        let outcome = self.tracker.apply_snapshot(&entries, now_millis());
        for order_id in outcome.removed {
            self.channels
                .emit(SyncEvent::OrderTrackingRemoved { order_id });
        }
        for record in outcome.updated {
            self.channels
                .emit(SyncEvent::OrderTrackingUpdated { record });
        }
    }

    fn flush_outbox(&mut self) {
        for pending in std::mem::take(&mut self.outbox) {
            match self.forward_frame(Namespace::Chat, pending.frame.clone()) {
                Ok(()) => self
                    .channels
                    .emit(ingress::send_ack_event(pending.client_txn_id, None)),
                Err(_) => self.outbox.push(pending),
            }
        }
    }

    fn require_connected(&self, namespace: Namespace, action: &str) -> Result<(), SyncError> {
        match self.machines.get(&namespace) {
            Some(machine) => machine.require_connected(action),
            None => Err(SyncError::not_connected(action)),
        }
    }

    fn forward_frame(&self, namespace: Namespace, frame: WireFrame) -> Result<(), SyncError> {
        let task = self.connections.get(&namespace).ok_or_else(|| {
            SyncError::new(
                SyncErrorCategory::Connection,
                "connection_unavailable",
                format!("no connection task for {namespace:?}"),
            )
        })?;
        task.outbound_tx.try_send(frame).map_err(|_| {
            SyncError::new(
                SyncErrorCategory::Connection,
                "connection_unavailable",
                format!("outbound queue unavailable for {namespace:?}"),
            )
        })
    }

    fn emit_room_updated(&self, room_id: &str) {
        if let Some(room) = self.store.room(room_id) {
            self.channels
                .emit(SyncEvent::RoomUpdated { room: room.clone() });
        }
    }

    async fn teardown_connections(&mut self) {
        for (namespace, task) in self.connections.drain() {
            task.cancel.cancel();
            let _ = task.handle.await;
            if let Some(machine) = self.machines.get_mut(&namespace) {
                machine.on_disconnect();
            }
            self.channels.emit(SyncEvent::ConnectionChanged {
                namespace,
                connected: false,
            });
        }
    }

    fn flush_persistence(&mut self) {
        if self.store.revision() != self.last_persisted_revision {
            self.last_persisted_revision = self.store.revision();
            self.persist_tx.send_replace(self.store.snapshot());
        }
    }
}

/// Per-namespace connection loop: connect, pump, back off, give up.
async fn run_connection<F: TransportFactory>(
    factory: Arc<F>,
    namespace: Namespace,
    auth_token: String,
    retry: RetryPolicy,
    events_tx: mpsc::Sender<InternalEvent>,
    mut outbound_rx: mpsc::Receiver<WireFrame>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            connect = factory.connect(namespace, &auth_token) => connect,
        };

        match connect {
            Ok(mut transport) => {
                attempt = 0;
                if !notify(&events_tx, &cancel, InternalEvent::Connected(namespace)).await {
                    return;
                }

                let lost = pump_connection(
                    &mut transport,
                    namespace,
                    &events_tx,
                    &mut outbound_rx,
                    &cancel,
                )
                .await;
                if !lost {
                    return;
                }
                if !notify(&events_tx, &cancel, InternalEvent::Disconnected(namespace)).await {
                    return;
                }
            }
            Err(err) => {
                warn!(?namespace, %err, "connect attempt failed");
            }
        }

        if retry.is_exhausted(attempt) {
            let _ = notify(&events_tx, &cancel, InternalEvent::GaveUp(namespace)).await;
            return;
        }
        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?namespace, attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Pump one established connection. Returns `true` when the transport was
/// lost (reconnect), `false` on deliberate shutdown.
async fn pump_connection<T: Transport>(
    transport: &mut T,
    namespace: Namespace,
    events_tx: &mpsc::Sender<InternalEvent>,
    outbound_rx: &mut mpsc::Receiver<WireFrame>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                transport.close().await;
                return false;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if transport.send(frame).await.is_err() {
                            return true;
                        }
                    }
                    None => {
                        transport.close().await;
                        return false;
                    }
                }
            }
            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(frame)) => {
                        if !notify(events_tx, cancel, InternalEvent::Frame(namespace, frame)).await {
                            transport.close().await;
                            return false;
                        }
                    }
                    Some(Err(err)) => {
                        // One unreadable frame does not take the link down.
                        warn!(?namespace, %err, "dropping unreadable frame");
                    }
                    None => return true,
                }
            }
        }
    }
}

/// Deliver an internal event unless shutdown wins the race.
///
/// Without this, a task blocked on a full internal queue could never
/// observe its cancellation token during teardown.
async fn notify(
    events_tx: &mpsc::Sender<InternalEvent>,
    cancel: &CancellationToken,
    event: InternalEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events_tx.send(event) => sent.is_ok(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_core::OrderStatus;
    use sync_platform::{
        ChannelTransportFactory, InMemoryStateStore, TransportHarness, channel_transport,
    };
    use tokio::time::timeout;

    fn test_config() -> SyncConfig {
        SyncConfig {
            server_url: "ws://127.0.0.1:1".to_owned(),
            api_base_url: "http://127.0.0.1:1".to_owned(),
            auth_token: None,
            local_user_id: "me".to_owned(),
            data_dir: "./unused".into(),
            reconnect_max_attempts: 2,
            reconnect_base_delay_ms: 25,
            reconnect_max_delay_ms: 100,
            driver_inactivity_window_ms: 120_000,
            arrival_eta_threshold_minutes: 5,
        }
    }

    /// Script one transport for every namespace and return the harnesses.
    fn script_all(factory: &ChannelTransportFactory) -> HashMap<Namespace, TransportHarness> {
        let mut harnesses = HashMap::new();
        for namespace in NAMESPACES {
            let (transport, harness) = channel_transport(32);
            factory.push(namespace, transport);
            harnesses.insert(namespace, harness);
        }
        harnesses
    }

    async fn wait_for<P>(events: &mut EventStream, predicate: P) -> SyncEvent
    where
        P: Fn(&SyncEvent) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event in time")
    }

    async fn connect_all(
        handle: &SyncRuntimeHandle,
        events: &mut EventStream,
    ) {
        handle
            .send(SyncCommand::Connect {
                auth_token: "tok".to_owned(),
            })
            .await
            .expect("command enqueues");
        for namespace in NAMESPACES {
            wait_for(events, |event| {
                matches!(
                    event,
                    SyncEvent::ConnectionChanged { namespace: ns, connected: true } if *ns == namespace
                )
            })
            .await;
        }
    }

    #[tokio::test]
    async fn rejects_session_commands_when_not_connected() {
        let handle = spawn_runtime(
            test_config(),
            ChannelTransportFactory::new(),
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();

        handle
            .send(SyncCommand::StartSupportChat {
                kind: ChatKind::Chatbot,
            })
            .await
            .expect("command enqueues");

        let event = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::FatalError { .. })
        })
        .await;
        match event {
            SyncEvent::FatalError { code, .. } => assert_eq!(code, "not_connected"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_active_room_surfaces_failed_ack() {
        let handle = spawn_runtime(
            test_config(),
            ChannelTransportFactory::new(),
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();

        handle
            .send(SyncCommand::SendChatMessage {
                content: "hi".to_owned(),
                kind: MessageKind::Text,
            })
            .await
            .expect("command enqueues");

        let event = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::SendAck { .. })
        })
        .await;
        match event {
            SyncEvent::SendAck { error_code, .. } => {
                assert_eq!(error_code.as_deref(), Some("no_active_room"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn support_chat_flow_runs_chatbot_to_agent_handoff() {
        let factory = ChannelTransportFactory::new();
        let mut harnesses = script_all(&factory);
        let handle = spawn_runtime(
            test_config(),
            factory,
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();
        connect_all(&handle, &mut events).await;

        let chat = harnesses.get_mut(&Namespace::Chat).expect("chat harness");
        handle
            .send(SyncCommand::StartSupportChat {
                kind: ChatKind::Chatbot,
            })
            .await
            .expect("command enqueues");

        let start = chat.from_client.recv().await.expect("start frame");
        assert_eq!(start.event, "startSupportChat");
        chat.to_client
            .send(WireFrame::new(
                "startSupportChatResponse",
                json!({ "sessionId": "S42", "type": "CHATBOT" }),
            ))
            .await
            .expect("response delivers");

        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ActiveRoomChanged { room_id: Some(id) } if id == "chatbot_S42"
            )
        })
        .await;
        // The runtime requests history for the new session.
        let history_request = chat.from_client.recv().await.expect("history frame");
        assert_eq!(history_request.event, "getSupportHistory");

        for i in 0..3 {
            chat.to_client
                .send(WireFrame::new(
                    "chatbotMessage",
                    json!({ "sessionId": "S42", "message": format!("bot-{i}"), "type": "TEXT" }),
                ))
                .await
                .expect("chatbot message delivers");
            wait_for(&mut events, |event| {
                matches!(event, SyncEvent::MessageAdded { .. })
            })
            .await;
        }

        chat.to_client
            .send(WireFrame::new(
                "agentMessage",
                json!({
                    "sessionId": "S42",
                    "agentId": "agent-7",
                    "agentName": "Alex",
                    "message": "Hi, I'm Alex",
                }),
            ))
            .await
            .expect("agent message delivers");

        let session_event = wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::SupportSessionUpdated { session } if session.chat_mode == ChatMode::Agent
            )
        })
        .await;
        match session_event {
            SyncEvent::SupportSessionUpdated { session } => {
                assert_eq!(session.session_id, "S42");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ActiveRoomChanged { room_id: Some(id) } if id == "support_S42"
            )
        })
        .await;
        // Migrated history (3 copies) plus the agent message itself.
        let room_event = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomUpdated { room } if room.id == "support_S42")
        })
        .await;
        match room_event {
            SyncEvent::RoomUpdated { room } => {
                let last = room.last_message.expect("support room has messages");
                assert_eq!(last.content, "Hi, I'm Alex");
                assert_eq!(last.room_id, "support_S42");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn optimistic_send_is_acked_and_echo_is_deduplicated() {
        let factory = ChannelTransportFactory::new();
        let mut harnesses = script_all(&factory);
        let handle = spawn_runtime(
            test_config(),
            factory,
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();
        connect_all(&handle, &mut events).await;

        let chat = harnesses.get_mut(&Namespace::Chat).expect("chat harness");
        handle
            .send(SyncCommand::StartOrderChat {
                with_user_id: "driver-9".to_owned(),
                order_id: "O1".to_owned(),
            })
            .await
            .expect("command enqueues");
        let start = chat.from_client.recv().await.expect("start frame");
        assert_eq!(start.event, "startChat");
        chat.to_client
            .send(WireFrame::new(
                "chatStarted",
                json!({ "chatId": "c1", "dbRoomId": "R1", "orderId": "O1" }),
            ))
            .await
            .expect("chat started delivers");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::ActiveRoomChanged { room_id: Some(id) } if id == "R1")
        })
        .await;
        let history_request = chat.from_client.recv().await.expect("history frame");
        assert_eq!(history_request.event, "getChatHistory");

        handle
            .send(SyncCommand::SendChatMessage {
                content: "Hello".to_owned(),
                kind: MessageKind::Text,
            })
            .await
            .expect("command enqueues");

        let added = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::MessageAdded { .. })
        })
        .await;
        let local_message = match added {
            SyncEvent::MessageAdded { message } => message,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(local_message.room_id, "R1");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::SendAck { error_code: None, .. })
        })
        .await;
        let outbound = chat.from_client.recv().await.expect("send frame");
        assert_eq!(outbound.event, "sendMessage");

        // Server echo of the optimistic send is discarded; a peer message
        // with identical content is admitted.
        chat.to_client
            .send(WireFrame::new(
                "newMessage",
                json!({ "roomId": "R1", "senderId": "me", "content": "Hello" }),
            ))
            .await
            .expect("echo delivers");
        chat.to_client
            .send(WireFrame::new(
                "newMessage",
                json!({ "roomId": "R1", "senderId": "driver-9", "content": "Hello" }),
            ))
            .await
            .expect("peer message delivers");

        let peer_added = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::MessageAdded { .. })
        })
        .await;
        match peer_added {
            SyncEvent::MessageAdded { message } => {
                assert_eq!(message.sender_id, "driver-9");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let room = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomUpdated { room } if room.id == "R1")
        })
        .await;
        match room {
            SyncEvent::RoomUpdated { room } => {
                // Optimistic copy + peer message; the echo added nothing.
                let last = room.last_message.expect("room has messages");
                assert_eq!(last.sender_id, "driver-9");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_alert_fires_once_per_activity_burst() {
        let factory = ChannelTransportFactory::new();
        let mut harnesses = script_all(&factory);
        let handle = spawn_runtime(
            test_config(),
            factory,
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();
        connect_all(&handle, &mut events).await;

        handle
            .send(SyncCommand::SubscribeDriver {
                driver_id: "D1".to_owned(),
            })
            .await
            .expect("command enqueues");
        let driver = harnesses
            .get_mut(&Namespace::DriverLocation)
            .expect("driver harness");
        let subscribe = driver.from_client.recv().await.expect("subscribe frame");
        assert_eq!(subscribe.event, "subscribeToDriverLocation");

        let push = |eta: u32| {
            WireFrame::new(
                "driverCurrentLocation",
                json!({ "driverId": "D1", "lat": 52.1, "lng": 4.3, "eta": eta }),
            )
        };

        driver.to_client.send(push(6)).await.expect("push delivers");
        let first = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::DriverLocationUpdated { .. })
        })
        .await;
        assert!(matches!(
            first,
            SyncEvent::DriverLocationUpdated { eta_minutes: 6, .. }
        ));

        driver.to_client.send(push(4)).await.expect("push delivers");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::DriverArrivingSoon { eta_minutes: 4, .. })
        })
        .await;

        // Within the same burst a lower ETA does not re-alert.
        driver.to_client.send(push(3)).await.expect("push delivers");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::DriverLocationUpdated { eta_minutes: 3, .. })
        })
        .await;

        // A silence gap past the inactivity window re-arms the alert.
        tokio::time::advance(Duration::from_secs(125)).await;
        driver.to_client.send(push(4)).await.expect("push delivers");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::DriverArrivingSoon { eta_minutes: 4, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn reconnect_reconciliation_removes_stale_orders() {
        let factory = ChannelTransportFactory::new();
        let mut harnesses = script_all(&factory);
        let order_api = StaticOrderApi::default();
        order_api.set_status("O9", Some(OrderStatus::EnRoute));
        let handle = spawn_runtime(
            test_config(),
            factory.clone(),
            order_api,
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();
        connect_all(&handle, &mut events).await;

        let orders = harnesses
            .get_mut(&Namespace::OrderTracking)
            .expect("order harness");
        orders
            .to_client
            .send(WireFrame::new(
                "notifyOrderStatus",
                json!({ "orderId": "O9", "status": "EN_ROUTE", "updated_at": 100 }),
            ))
            .await
            .expect("push delivers");
        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::OrderTrackingUpdated { record } if record.order_id == "O9"
            )
        })
        .await;

        // Drop the order-tracking link; the authoritative snapshot fetched
        // on reconnect no longer lists O9.
        let stale = harnesses
            .remove(&Namespace::OrderTracking)
            .expect("order harness");
        let (transport, _fresh_harness) = channel_transport(32);
        factory.push(Namespace::OrderTracking, transport);
        drop(stale);

        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ConnectionChanged { namespace: Namespace::OrderTracking, connected: false }
            )
        })
        .await;
        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ConnectionChanged { namespace: Namespace::OrderTracking, connected: true }
            )
        })
        .await;
        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::OrderTrackingRemoved { order_id } if order_id == "O9"
            )
        })
        .await;
    }

    #[tokio::test]
    async fn give_up_clears_tracking_and_fails_buffered_sends() {
        let factory = ChannelTransportFactory::new();
        let mut harnesses = script_all(&factory);
        let handle = spawn_runtime(
            test_config(),
            factory,
            StaticOrderApi::default(),
            InMemoryStateStore::default(),
        );
        let mut events = handle.subscribe();
        connect_all(&handle, &mut events).await;

        // Establish an active order room first.
        let chat = harnesses.get_mut(&Namespace::Chat).expect("chat harness");
        handle
            .send(SyncCommand::StartOrderChat {
                with_user_id: "driver-9".to_owned(),
                order_id: "O1".to_owned(),
            })
            .await
            .expect("command enqueues");
        let _start = chat.from_client.recv().await.expect("start frame");
        chat.to_client
            .send(WireFrame::new(
                "chatStarted",
                json!({ "dbRoomId": "R1" }),
            ))
            .await
            .expect("chat started delivers");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::ActiveRoomChanged { room_id: Some(id) } if id == "R1")
        })
        .await;

        // Kill the chat link; no replacement transport is scripted.
        let dead = harnesses.remove(&Namespace::Chat).expect("chat harness");
        drop(dead);
        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ConnectionChanged { namespace: Namespace::Chat, connected: false }
            )
        })
        .await;

        handle
            .send(SyncCommand::SendChatMessage {
                content: "Hello".to_owned(),
                kind: MessageKind::Text,
            })
            .await
            .expect("command enqueues");
        // Optimistic admission still happens.
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::MessageAdded { .. })
        })
        .await;

        wait_for(&mut events, |event| {
            matches!(
                event,
                SyncEvent::ConnectionGaveUp { namespace: Namespace::Chat }
            )
        })
        .await;
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::TrackingCleared)
        })
        .await;
        let ack = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::SendAck { error_code: Some(_), .. })
        })
        .await;
        match ack {
            SyncEvent::SendAck { error_code, .. } => {
                assert_eq!(error_code.as_deref(), Some("connection_gave_up"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
