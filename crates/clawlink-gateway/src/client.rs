//! Gateway client protocol engine.
//!
//! A single driver task owns the socket, the pending-request table, tick
//! state, and the backoff counter. [`GatewayClient`] handles talk to it over a
//! command channel; the owner receives [`ClientEvent`]s on an unbounded
//! channel.
//!
//! Connection lifecycle: open the socket, wait `connect_delay` for a
//! `connect.challenge` (sending a nonce-signed v2 `connect` immediately if
//! one arrives, else an unsigned-nonce v1 `connect`), then serve requests
//! until the socket closes. Every close flushes pending requests and
//! schedules a reconnect unless the client was stopped. The driver only
//! lives while a client handle or an open socket needs it; an idle,
//! stopped, or dropped client never keeps the runtime busy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::{Future, pending};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clawlink_core::device_auth::DeviceAuthStore;
use clawlink_core::device_identity::{
    DeviceAuthPayload, DeviceIdentity, build_device_auth_payload, public_key_raw_base64url,
    sign_device_payload,
};
use clawlink_core::protocol::{
    AuthParams, ClientInfo, ConnectParams, DEFAULT_TICK_INTERVAL_MS, DeviceParams, ErrorShape,
    GatewayFrame, HelloOk, PROTOCOL_VERSION, StateVersion, client_ids, client_modes, error_codes,
    events, roles, scopes,
};
use clawlink_core::schema;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::GatewayError;
use crate::events::ClientEvent;
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::transport::{ABNORMAL_CLOSURE, Connection, Connector, WireMessage};

pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(750);
const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(1000);

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TICK_TIMEOUT: u16 = 4000;

/// Everything the client needs to connect and authenticate.
#[derive(Debug, Clone)]
pub struct GatewayClientOptions {
    pub url: String,
    /// Explicitly supplied token; beats any stored device token.
    pub token: Option<String>,
    /// Statically configured shared token, used when no device token is stored.
    pub shared_token: Option<String>,
    pub password: Option<String>,
    /// Expected SHA-256 fingerprint of the gateway certificate (`wss://` only).
    pub tls_fingerprint: Option<String>,
    pub instance_id: Option<String>,
    pub client_name: String,
    pub client_display_name: Option<String>,
    pub client_version: String,
    pub platform: String,
    pub device_family: Option<String>,
    pub model_identifier: Option<String>,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: BTreeMap<String, bool>,
    pub path_env: Option<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub device_identity: Option<DeviceIdentity>,
    pub token_store: Option<DeviceAuthStore>,
    /// How long to wait for `connect.challenge` before sending a v1 `connect`.
    pub connect_delay: Duration,
    pub backoff: Backoff,
}

impl Default for GatewayClientOptions {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            shared_token: None,
            password: None,
            tls_fingerprint: None,
            instance_id: None,
            client_name: client_ids::GATEWAY_CLIENT.to_string(),
            client_display_name: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            device_family: None,
            model_identifier: None,
            mode: client_modes::BACKEND.to_string(),
            role: roles::OPERATOR.to_string(),
            scopes: vec![scopes::ADMIN.to_string()],
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: BTreeMap::new(),
            path_env: None,
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            device_identity: None,
            token_store: None,
            connect_delay: DEFAULT_CONNECT_DELAY,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Skip interim `{"status": "accepted"}` responses and wait for the final one.
    pub expect_final: bool,
}

type Reply = oneshot::Sender<Result<Value, GatewayError>>;

enum Command {
    Request {
        method: String,
        params: Option<Value>,
        expect_final: bool,
        reply: Reply,
    },
}

impl Command {
    fn reject(self, err: GatewayError) {
        match self {
            Self::Request { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Handle to a gateway connection. Clones share the same connection; the
/// connection shuts down on [`GatewayClient::stop`] or when every handle is
/// dropped.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicConnectionState>,
    cancel: CancellationToken,
    driver: Arc<Mutex<Option<Driver>>>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("state", &self.state.load())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Build a client. Nothing connects until [`GatewayClient::start`].
    pub fn new(
        options: GatewayClientOptions,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Disconnected));
        let cancel = CancellationToken::new();
        let backoff = options.backoff.clone();
        let driver = Driver {
            options,
            connector,
            commands: commands_rx,
            events: events_tx,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            backoff,
        };
        let client = Self {
            commands: commands_tx,
            state,
            cancel,
            driver: Arc::new(Mutex::new(Some(driver))),
        };
        (client, events_rx)
    }

    /// Spawn the connection driver. No-op once started or stopped.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            tokio::spawn(driver.run());
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a request and wait for its response payload.
    ///
    /// Fails immediately when no socket is open. There is no per-request
    /// timeout; callers layer one on top.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Stopped);
        }
        if !matches!(
            self.state.load(),
            ConnectionState::AwaitingHello | ConnectionState::Ready
        ) {
            return Err(GatewayError::NotConnected);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                expect_final: options.expect_final,
                reply,
            })
            .map_err(|_| GatewayError::NotConnected)?;
        response.await.map_err(|_| GatewayError::Stopped)?
    }

    /// Stop for good: close the socket, reject pending requests, never reconnect.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct Pending {
    reply: Reply,
    expect_final: bool,
}

enum SessionEnd {
    Stopped,
    Closed { code: u16, reason: String },
}

/// Per-socket state; dropped when the socket closes.
struct Session {
    outgoing: mpsc::UnboundedSender<WireMessage>,
    incoming: mpsc::UnboundedReceiver<WireMessage>,
    pending: HashMap<String, Pending>,
    connect_deadline: Option<Instant>,
    connect_id: Option<String>,
    /// Connect requests replaced by a signed retry; their responses are dropped.
    superseded: HashSet<String>,
    connect_nonce: Option<String>,
    used_stored_token: bool,
    hello_received: bool,
    last_seq: Option<u64>,
    last_tick: Instant,
    tick_interval: Option<Duration>,
    watchdog: Option<Interval>,
}

impl Session {
    fn new(connection: Connection, connect_delay: Duration) -> Self {
        Self {
            outgoing: connection.outgoing,
            incoming: connection.incoming,
            pending: HashMap::new(),
            connect_deadline: Some(Instant::now() + connect_delay),
            connect_id: None,
            superseded: HashSet::new(),
            connect_nonce: None,
            used_stored_token: false,
            hello_received: false,
            last_seq: None,
            last_tick: Instant::now(),
            tick_interval: None,
            watchdog: None,
        }
    }

    fn send_text(&self, text: String) -> bool {
        self.outgoing.send(WireMessage::Text(text)).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.outgoing.send(WireMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn flush(&mut self, err: &GatewayError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn watchdog_tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Token chosen for a connect attempt and where it came from.
struct SelectedAuth {
    token: Option<String>,
    from_store: bool,
}

struct Driver {
    options: GatewayClientOptions,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<AtomicConnectionState>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl Driver {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        if self.options.tls_fingerprint.is_some() && !self.options.url.starts_with("wss://") {
            self.emit(ClientEvent::ConnectError(GatewayError::Tls(
                "gateway tls fingerprint requires wss:// gateway url".into(),
            )));
            self.shutdown();
            return;
        }

        loop {
            if let SessionEnd::Stopped = self.connect_and_serve().await {
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let delay = self.backoff.next_delay();
            debug!(url = %self.options.url, delay_ms = delay.as_millis() as u64, "Scheduling gateway reconnect");
            self.emit(ClientEvent::Reconnecting { delay });
            if self.idle(sleep(delay)).await.is_none() {
                break;
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.state.store(ConnectionState::Disconnected);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(GatewayError::Stopped);
        }
    }

    /// Await `fut` while no socket is open, rejecting requests. Returns
    /// `None` if the client stopped first.
    async fn idle<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                out = &mut fut => return Some(out),
                command = self.commands.recv() => match command {
                    Some(command) => command.reject(GatewayError::NotConnected),
                    None => return None,
                },
            }
        }
    }

    async fn connect_and_serve(&mut self) -> SessionEnd {
        self.state.store(ConnectionState::Connecting);
        let connector = Arc::clone(&self.connector);
        let url = self.options.url.clone();
        let fingerprint = self.options.tls_fingerprint.clone();
        let connecting = async move { connector.connect(&url, fingerprint.as_deref()).await };

        let connection = match self.idle(connecting).await {
            None => return SessionEnd::Stopped,
            Some(Ok(connection)) => connection,
            Some(Err(err)) => {
                warn!(url = %self.options.url, %err, "Gateway connect failed");
                let code = match err {
                    GatewayError::Tls(_) => CLOSE_POLICY_VIOLATION,
                    _ => ABNORMAL_CLOSURE,
                };
                let reason = err.to_string();
                self.emit(ClientEvent::ConnectError(err));
                self.state.store(ConnectionState::Disconnected);
                self.emit(ClientEvent::Closed {
                    code,
                    reason: reason.clone(),
                });
                return SessionEnd::Closed { code, reason };
            }
        };

        debug!(url = %self.options.url, "Gateway socket open");
        self.state.store(ConnectionState::AwaitingHello);
        let mut session = Session::new(connection, self.options.connect_delay);
        let end = self.serve(&mut session).await;

        self.state.store(ConnectionState::Closing);
        let err = match &end {
            SessionEnd::Stopped => GatewayError::Stopped,
            SessionEnd::Closed { code, reason } => GatewayError::Closed {
                code: *code,
                reason: reason.clone(),
            },
        };
        session.flush(&err);
        self.state.store(ConnectionState::Disconnected);
        if let SessionEnd::Closed { code, reason } = &end {
            info!(url = %self.options.url, code, reason = %reason, "Gateway connection closed");
            self.emit(ClientEvent::Closed {
                code: *code,
                reason: reason.clone(),
            });
        }
        end
    }

    async fn serve(&mut self, session: &mut Session) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    session.close(CLOSE_NORMAL, "client stopped");
                    return SessionEnd::Stopped;
                }
                _ = sleep_until_opt(session.connect_deadline) => {
                    session.connect_deadline = None;
                    if let Err(end) = self.send_connect(session) {
                        return end;
                    }
                }
                _ = watchdog_tick(&mut session.watchdog) => {
                    if let Some(end) = self.check_tick(session) {
                        return end;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(session, command),
                    None => {
                        session.close(CLOSE_NORMAL, "client dropped");
                        return SessionEnd::Stopped;
                    }
                },
                message = session.incoming.recv() => match message {
                    Some(WireMessage::Text(text)) => {
                        if let Some(end) = self.handle_text(session, &text) {
                            return end;
                        }
                    }
                    Some(WireMessage::Close { code, reason }) => {
                        return SessionEnd::Closed { code, reason };
                    }
                    None => {
                        return SessionEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: String::new(),
                        };
                    }
                },
            }
        }
    }

    fn check_tick(&self, session: &Session) -> Option<SessionEnd> {
        let tick = session.tick_interval?;
        let gap = session.last_tick.elapsed();
        if gap > tick * 2 {
            warn!(
                gap_ms = gap.as_millis() as u64,
                tick_ms = tick.as_millis() as u64,
                "Gateway tick timeout"
            );
            session.close(CLOSE_TICK_TIMEOUT, "tick timeout");
            return Some(SessionEnd::Closed {
                code: CLOSE_TICK_TIMEOUT,
                reason: "tick timeout".into(),
            });
        }
        None
    }

    fn select_auth(&self) -> SelectedAuth {
        if let Some(token) = non_empty(&self.options.token) {
            return SelectedAuth {
                token: Some(token),
                from_store: false,
            };
        }
        let stored = match (&self.options.device_identity, &self.options.token_store) {
            (Some(identity), Some(store)) => store.load(&identity.device_id, &self.options.role),
            _ => None,
        };
        match stored {
            Some(entry) => SelectedAuth {
                token: Some(entry.token),
                from_store: true,
            },
            None => SelectedAuth {
                token: non_empty(&self.options.shared_token),
                from_store: false,
            },
        }
    }

    fn build_connect_params(
        &self,
        nonce: Option<&str>,
        auth: &SelectedAuth,
    ) -> Result<ConnectParams, GatewayError> {
        let options = &self.options;
        let device = match &options.device_identity {
            Some(identity) => {
                let signed_at_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
                let payload = build_device_auth_payload(&DeviceAuthPayload {
                    device_id: identity.device_id.clone(),
                    client_id: options.client_name.clone(),
                    client_mode: options.mode.clone(),
                    role: options.role.clone(),
                    scopes: options.scopes.clone(),
                    signed_at_ms,
                    token: auth.token.clone(),
                    nonce: nonce.map(String::from),
                });
                let signature = sign_device_payload(&identity.private_key_pem, &payload)
                    .map_err(|e| GatewayError::Identity(e.to_string()))?;
                let public_key = public_key_raw_base64url(&identity.public_key_pem)
                    .map_err(|e| GatewayError::Identity(e.to_string()))?;
                Some(DeviceParams {
                    id: identity.device_id.clone(),
                    public_key,
                    signature,
                    signed_at: signed_at_ms,
                    nonce: nonce.map(String::from),
                })
            }
            None => None,
        };

        let credentials = AuthParams {
            token: auth.token.clone(),
            password: non_empty(&options.password),
        };

        Ok(ConnectParams {
            min_protocol: options.min_protocol,
            max_protocol: options.max_protocol,
            client: ClientInfo {
                id: options.client_name.clone(),
                display_name: options.client_display_name.clone(),
                version: options.client_version.clone(),
                platform: options.platform.clone(),
                device_family: options.device_family.clone(),
                model_identifier: options.model_identifier.clone(),
                mode: options.mode.clone(),
                instance_id: options.instance_id.clone(),
            },
            caps: (!options.caps.is_empty()).then(|| options.caps.clone()),
            commands: (!options.commands.is_empty()).then(|| options.commands.clone()),
            permissions: (!options.permissions.is_empty()).then(|| options.permissions.clone()),
            path_env: options.path_env.clone(),
            role: Some(options.role.clone()),
            scopes: Some(options.scopes.clone()),
            device,
            auth: (!credentials.is_empty()).then_some(credentials),
            locale: None,
            user_agent: Some(format!("clawlink/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    /// Send (or re-send, signed with the challenge nonce) the `connect` request.
    fn send_connect(&mut self, session: &mut Session) -> Result<(), SessionEnd> {
        if session.hello_received {
            return Ok(());
        }
        if let Some(previous) = session.connect_id.take() {
            debug!(id = %previous, "Superseding unsigned connect with challenge response");
            session.superseded.insert(previous);
        }

        let auth = self.select_auth();
        let params = self
            .build_connect_params(session.connect_nonce.as_deref(), &auth)
            .and_then(|params| {
                let value = serde_json::to_value(&params)
                    .map_err(|e| GatewayError::Validation(e.to_string()))?;
                schema::parse_connect_params(&value)?;
                Ok(value)
            });
        let params = match params {
            Ok(params) => params,
            Err(err) => return Err(self.fail_connect(session, err)),
        };

        let id = Uuid::new_v4().to_string();
        let frame = GatewayFrame::request(id.clone(), "connect", Some(params));
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => return Err(self.fail_connect(session, GatewayError::Validation(e.to_string()))),
        };
        debug!(
            id = %id,
            signed = session.connect_nonce.is_some(),
            stored_token = auth.from_store,
            "Sending connect"
        );
        session.send_text(text);
        session.connect_id = Some(id);
        session.used_stored_token = auth.from_store;
        Ok(())
    }

    fn fail_connect(&mut self, session: &mut Session, err: GatewayError) -> SessionEnd {
        if session.used_stored_token && non_empty(&self.options.shared_token).is_some() {
            if let (Some(identity), Some(store)) =
                (&self.options.device_identity, &self.options.token_store)
            {
                match store.clear(&identity.device_id, &self.options.role) {
                    Ok(()) => info!("Cleared rejected device token, falling back to shared token"),
                    Err(e) => warn!(%e, "Failed to clear device token"),
                }
            }
        }
        warn!(url = %self.options.url, %err, "Gateway connect failed");
        self.emit(ClientEvent::ConnectError(err));
        session.close(CLOSE_POLICY_VIOLATION, "connect failed");
        SessionEnd::Closed {
            code: CLOSE_POLICY_VIOLATION,
            reason: "connect failed".into(),
        }
    }

    fn on_hello(&mut self, session: &mut Session, hello: HelloOk) {
        if let (Some(auth), Some(identity), Some(store)) = (
            &hello.auth,
            &self.options.device_identity,
            &self.options.token_store,
        ) {
            let role = if auth.role.is_empty() {
                self.options.role.as_str()
            } else {
                auth.role.as_str()
            };
            if let Err(e) = store.store(&identity.device_id, role, &auth.device_token, &auth.scopes) {
                warn!(%e, "Failed to persist device token");
            }
        }

        self.backoff.reset();
        let tick_ms = match hello.policy.tick_interval_ms {
            0 => DEFAULT_TICK_INTERVAL_MS,
            ms => ms,
        };
        let tick = Duration::from_millis(tick_ms);
        let period = tick.max(MIN_WATCHDOG_PERIOD);
        let mut watchdog = interval_at(Instant::now() + period, period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        session.hello_received = true;
        session.connect_deadline = None;
        session.tick_interval = Some(tick);
        session.last_tick = Instant::now();
        session.watchdog = Some(watchdog);
        self.state.store(ConnectionState::Ready);
        info!(
            url = %self.options.url,
            conn_id = %hello.server.conn_id,
            protocol = hello.protocol,
            tick_ms,
            "Gateway handshake complete"
        );
        self.emit(ClientEvent::HelloOk(Box::new(hello)));
    }

    fn handle_command(&mut self, session: &mut Session, command: Command) {
        let Command::Request {
            method,
            params,
            expect_final,
            reply,
        } = command;
        let id = Uuid::new_v4().to_string();
        let frame = GatewayFrame::request(id.clone(), method, params);
        let value = match serde_json::to_value(&frame) {
            Ok(value) => value,
            Err(e) => {
                let _ = reply.send(Err(GatewayError::Validation(e.to_string())));
                return;
            }
        };
        if let Err(e) = schema::validate_request_frame(&value) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if !session.send_text(value.to_string()) {
            let _ = reply.send(Err(GatewayError::NotConnected));
            return;
        }
        session.pending.insert(
            id,
            Pending {
                reply,
                expect_final,
            },
        );
    }

    fn handle_text(&mut self, session: &mut Session, text: &str) -> Option<SessionEnd> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(%e, "Dropping non-JSON gateway message");
                return None;
            }
        };
        let frame = match schema::parse_frame(&value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%e, "Dropping invalid gateway frame");
                return None;
            }
        };
        match frame {
            GatewayFrame::Event {
                event,
                payload,
                seq,
                state_version,
            } => self.handle_event(session, event, payload, seq, state_version),
            GatewayFrame::Response {
                id,
                ok,
                payload,
                error,
            } => self.handle_response(session, id, ok, payload, error),
            GatewayFrame::Request { method, .. } => {
                debug!(method = %method, "Ignoring request frame from gateway");
                None
            }
        }
    }

    fn handle_event(
        &mut self,
        session: &mut Session,
        event: String,
        payload: Option<Value>,
        seq: Option<u64>,
        state_version: Option<StateVersion>,
    ) -> Option<SessionEnd> {
        if event == events::CONNECT_CHALLENGE {
            let nonce = payload
                .as_ref()
                .and_then(|p| schema::parse_challenge(p).ok())
                .map(|c| c.nonce);
            let Some(nonce) = nonce else {
                warn!("Ignoring connect.challenge without a nonce");
                return None;
            };
            if session.hello_received || session.connect_nonce.is_some() {
                debug!("Ignoring repeated connect.challenge");
                return None;
            }
            session.connect_nonce = Some(nonce);
            session.connect_deadline = None;
            return self.send_connect(session).err();
        }

        if let Some(seq) = seq {
            if let Some(expected) = session.last_seq.and_then(|last| last.checked_add(1))
                && seq > expected
            {
                warn!(expected, received = seq, "Gateway event gap");
                self.emit(ClientEvent::Gap {
                    expected,
                    received: seq,
                });
            }
            session.last_seq = Some(seq);
        }
        if event == events::TICK {
            session.last_tick = Instant::now();
        }
        self.emit(ClientEvent::Event {
            event,
            payload,
            seq,
            state_version,
        });
        None
    }

    fn handle_response(
        &mut self,
        session: &mut Session,
        id: String,
        ok: bool,
        payload: Option<Value>,
        error: Option<ErrorShape>,
    ) -> Option<SessionEnd> {
        if session.connect_id.as_deref() == Some(id.as_str()) {
            session.connect_id = None;
            let outcome = if ok {
                match payload.as_ref().map(schema::parse_hello_ok) {
                    Some(Ok(hello)) => Ok(hello),
                    Some(Err(e)) => Err(GatewayError::from(e)),
                    None => Err(GatewayError::Validation("hello-ok payload missing".into())),
                }
            } else {
                Err(request_error(error, "connect failed"))
            };
            return match outcome {
                Ok(hello) => {
                    self.on_hello(session, hello);
                    None
                }
                Err(err) => Some(self.fail_connect(session, err)),
            };
        }
        if session.superseded.remove(&id) {
            debug!(id = %id, "Dropping response to superseded connect");
            return None;
        }

        let Some(entry) = session.pending.get(&id) else {
            debug!(id = %id, "Response for unknown request");
            return None;
        };
        let accepted = payload
            .as_ref()
            .and_then(|p| p.get("status"))
            .and_then(Value::as_str)
            == Some("accepted");
        if entry.expect_final && accepted {
            debug!(id = %id, "Request accepted, waiting for final response");
            return None;
        }
        if let Some(entry) = session.pending.remove(&id) {
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                Err(request_error(error, "request failed"))
            };
            let _ = entry.reply.send(result);
        }
        None
    }
}

fn request_error(error: Option<ErrorShape>, fallback: &str) -> GatewayError {
    let shape = error.unwrap_or_else(|| ErrorShape::new(error_codes::UNAVAILABLE, fallback));
    GatewayError::Request {
        code: shape.code,
        message: shape.message,
        details: shape.details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clawlink_core::device_identity::{load_or_create_device_identity, verify_device_signature};
    use serde_json::json;

    struct StubServer {
        to_client: mpsc::UnboundedSender<WireMessage>,
        from_client: mpsc::UnboundedReceiver<WireMessage>,
    }

    impl StubServer {
        fn send(&self, value: Value) {
            self.to_client
                .send(WireMessage::Text(value.to_string()))
                .unwrap();
        }

        fn close(&self, code: u16, reason: &str) {
            let _ = self.to_client.send(WireMessage::Close {
                code,
                reason: reason.into(),
            });
        }

        /// Next request frame from the client, skipping close frames.
        async fn recv_request(&mut self) -> (String, String, Value) {
            loop {
                match self.from_client.recv().await.expect("client hung up") {
                    WireMessage::Text(text) => {
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        assert_eq!(frame["type"], "req");
                        return (
                            frame["id"].as_str().unwrap().to_string(),
                            frame["method"].as_str().unwrap().to_string(),
                            frame.get("params").cloned().unwrap_or(Value::Null),
                        );
                    }
                    WireMessage::Close { .. } => continue,
                }
            }
        }

        async fn recv_close(&mut self) -> (u16, String) {
            loop {
                match self.from_client.recv().await.expect("client hung up") {
                    WireMessage::Close { code, reason } => return (code, reason),
                    WireMessage::Text(_) => continue,
                }
            }
        }

        fn respond(&self, id: &str, payload: Value) {
            self.send(json!({"type": "res", "id": id, "ok": true, "payload": payload}));
        }

        fn hello(&self, id: &str, tick_ms: u64) {
            self.respond(id, hello_payload(tick_ms, None));
        }

        fn event(&self, event: &str, payload: Value, seq: Option<u64>) {
            let mut frame = json!({"type": "event", "event": event, "payload": payload});
            if let Some(seq) = seq {
                frame["seq"] = json!(seq);
            }
            self.send(frame);
        }
    }

    fn hello_payload(tick_ms: u64, auth: Option<Value>) -> Value {
        let mut payload = json!({
            "type": "hello-ok",
            "protocol": 3,
            "server": {"version": "test", "connId": "conn-1"},
            "features": {"methods": ["agents.list"], "events": ["tick"]},
            "snapshot": {},
            "policy": {"maxPayload": 1024, "maxBufferedBytes": 4096, "tickIntervalMs": tick_ms}
        });
        if let Some(auth) = auth {
            payload["auth"] = auth;
        }
        payload
    }

    struct StubConnector {
        servers: mpsc::UnboundedSender<StubServer>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(
            &self,
            _url: &str,
            _tls_fingerprint: Option<&str>,
        ) -> Result<Connection, GatewayError> {
            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            self.servers
                .send(StubServer {
                    to_client,
                    from_client,
                })
                .map_err(|_| GatewayError::Transport("stub server gone".into()))?;
            Ok(Connection { outgoing, incoming })
        }
    }

    fn stub() -> (Arc<dyn Connector>, mpsc::UnboundedReceiver<StubServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Arc::new(StubConnector { servers }), rx)
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn ready(
        options: GatewayClientOptions,
    ) -> (
        GatewayClient,
        mpsc::UnboundedReceiver<ClientEvent>,
        StubServer,
        mpsc::UnboundedReceiver<StubServer>,
    ) {
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(options, connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (id, method, _) = server.recv_request().await;
        assert_eq!(method, "connect");
        server.hello(&id, 30_000);
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;
        (client, events, server, servers)
    }

    fn identity_options(dir: &tempfile::TempDir) -> GatewayClientOptions {
        let identity =
            load_or_create_device_identity(&dir.path().join("identity/device.json")).unwrap();
        GatewayClientOptions {
            device_identity: Some(identity),
            token_store: Some(DeviceAuthStore::new(
                dir.path().join("identity/device-auth.json"),
            )),
            ..Default::default()
        }
    }

    fn signed_payload(options: &GatewayClientOptions, params: &Value) -> String {
        let identity = options.device_identity.as_ref().unwrap();
        build_device_auth_payload(&DeviceAuthPayload {
            device_id: identity.device_id.clone(),
            client_id: options.client_name.clone(),
            client_mode: options.mode.clone(),
            role: options.role.clone(),
            scopes: options.scopes.clone(),
            signed_at_ms: params["device"]["signedAt"].as_u64().unwrap(),
            token: params["auth"]["token"].as_str().map(String::from),
            nonce: params["device"]["nonce"].as_str().map(String::from),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_before_debounce_sends_only_signed_connect() {
        let dir = tempfile::tempdir().unwrap();
        let options = identity_options(&dir);
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(options.clone(), connector);
        client.start();

        let mut server = servers.recv().await.unwrap();
        server.event(events::CONNECT_CHALLENGE, json!({"nonce": "nonce-1", "ts": 1}), None);
        let (id, method, params) = server.recv_request().await;
        assert_eq!(method, "connect");
        assert_eq!(params["device"]["nonce"], "nonce-1");

        let payload = signed_payload(&options, &params);
        assert!(payload.starts_with("v2|"));
        assert!(payload.ends_with("|nonce-1"));
        assert!(verify_device_signature(
            params["device"]["publicKey"].as_str().unwrap(),
            &payload,
            params["device"]["signature"].as_str().unwrap(),
        ));

        server.hello(&id, 30_000);
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;
        assert_eq!(client.state(), ConnectionState::Ready);

        // No unsigned connect was ever queued.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_supersedes_unsigned_connect() {
        let dir = tempfile::tempdir().unwrap();
        let options = identity_options(&dir);
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(options.clone(), connector);
        client.start();

        let mut server = servers.recv().await.unwrap();
        let (v1_id, _, v1_params) = server.recv_request().await;
        assert!(v1_params["device"].get("nonce").is_none());
        assert!(signed_payload(&options, &v1_params).starts_with("v1|"));

        server.event(events::CONNECT_CHALLENGE, json!({"nonce": "late"}), None);
        let (v2_id, method, v2_params) = server.recv_request().await;
        assert_eq!(method, "connect");
        assert_ne!(v1_id, v2_id);
        assert_eq!(v2_params["device"]["nonce"], "late");

        // A late answer to the abandoned v1 attempt is ignored.
        server.send(json!({
            "type": "res", "id": v1_id, "ok": false,
            "error": {"code": "INVALID_REQUEST", "message": "stale"}
        }));
        server.hello(&v2_id, 30_000);
        let first = events.recv().await.unwrap();
        assert!(matches!(first, ClientEvent::HelloOk(_)), "got {first:?}");
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_challenge_v1_answer_is_authoritative() {
        let (client, _events, _server, _servers) = ready(GatewayClientOptions::default()).await;
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_round_trip_and_error() {
        let (client, _events, mut server, _servers) = ready(GatewayClientOptions::default()).await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("agents.list", Some(json!({})), RequestOptions::default())
                    .await
            })
        };
        let (id, method, params) = server.recv_request().await;
        assert_eq!(method, "agents.list");
        assert_eq!(params, json!({}));
        server.respond(&id, json!({"defaultId": "main"}));
        assert_eq!(call.await.unwrap().unwrap(), json!({"defaultId": "main"}));

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("sessions.delete", None, RequestOptions::default())
                    .await
            })
        };
        let (id, _, _) = server.recv_request().await;
        server.send(json!({
            "type": "res", "id": id, "ok": false,
            "error": {"code": "NOT_FOUND", "message": "no such session", "details": {"key": "x"}}
        }));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some("NOT_FOUND"));
        assert_eq!(err.to_string(), "no such session");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_final_skips_accepted() {
        let (client, _events, mut server, _servers) = ready(GatewayClientOptions::default()).await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(
                        "agent",
                        Some(json!({"message": "hi"})),
                        RequestOptions { expect_final: true },
                    )
                    .await
            })
        };
        let (id, _, _) = server.recv_request().await;
        server.respond(&id, json!({"status": "accepted", "runId": "r1"}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!call.is_finished());

        server.respond(&id, json!({"status": "done", "runId": "r1"}));
        assert_eq!(
            call.await.unwrap().unwrap(),
            json!({"status": "done", "runId": "r1"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_resolves_without_expect_final() {
        let (client, _events, mut server, _servers) = ready(GatewayClientOptions::default()).await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("agent", None, RequestOptions::default()).await })
        };
        let (id, _, _) = server.recv_request().await;
        server.respond(&id, json!({"status": "accepted"}));
        assert_eq!(call.await.unwrap().unwrap(), json!({"status": "accepted"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_detection_forwards_all_events() {
        let (_client, mut events, server, _servers) = ready(GatewayClientOptions::default()).await;
        for seq in [1, 2, 4] {
            server.event("presence", json!({"seq": seq}), Some(seq));
        }

        let mut forwarded = Vec::new();
        let mut gaps = Vec::new();
        while forwarded.len() < 3 {
            match events.recv().await.unwrap() {
                ClientEvent::Event { seq, .. } => forwarded.push(seq.unwrap()),
                ClientEvent::Gap { expected, received } => gaps.push((expected, received)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(forwarded, vec![1, 2, 4]);
        assert_eq!(gaps, vec![(3, 4)]);
    }

    #[test]
    fn test_missing_error_shape_is_unavailable() {
        let err = request_error(None, "request failed");
        assert!(matches!(
            err,
            GatewayError::Request { ref code, ref message, details: None }
                if code == error_codes::UNAVAILABLE && message == "request failed"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_seq_does_not_stop_event_delivery() {
        let (_client, mut events, server, _servers) = ready(GatewayClientOptions::default()).await;
        for seq in [u64::MAX, 1, 2] {
            server.event("presence", json!({}), Some(seq));
        }

        let mut forwarded = Vec::new();
        while forwarded.len() < 3 {
            match events.recv().await.unwrap() {
                ClientEvent::Event { seq, .. } => forwarded.push(seq.unwrap()),
                ClientEvent::Gap { .. } => panic!("sequence restart reported as a gap"),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(forwarded, vec![u64::MAX, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_never_forwarded_and_invalid_frames_dropped() {
        let (_client, mut events, server, _servers) = ready(GatewayClientOptions::default()).await;
        server.event(events::CONNECT_CHALLENGE, json!({"nonce": "again"}), None);
        server.send(json!({"type": "event", "event": "x", "bogus": true}));
        server.to_client.send(WireMessage::Text("not json".into())).unwrap();
        server.event("health", json!({}), None);
        match events.recv().await.unwrap() {
            ClientEvent::Event { event, .. } => assert_eq!(event, "health"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_resets_after_handshake() {
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(GatewayClientOptions::default(), connector);
        client.start();

        for expected in [1000, 2000, 4000] {
            let server = servers.recv().await.unwrap();
            drop(server);
            let event =
                wait_for(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;
            let ClientEvent::Reconnecting { delay } = event else {
                unreachable!()
            };
            assert_eq!(delay, Duration::from_millis(expected));
        }

        let mut server = servers.recv().await.unwrap();
        let (id, _, _) = server.recv_request().await;
        server.hello(&id, 30_000);
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;
        server.close(1001, "going away");

        let closed = wait_for(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
        assert!(matches!(closed, ClientEvent::Closed { code: 1001, .. }));
        let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;
        assert!(matches!(
            event,
            ClientEvent::Reconnecting { delay } if delay == Duration::from_millis(1000)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_timeout_closes_with_4000() {
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(GatewayClientOptions::default(), connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (id, _, _) = server.recv_request().await;
        server.hello(&id, 100);
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;

        let closed = wait_for(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
        assert!(matches!(
            closed,
            ClientEvent::Closed { code: 4000, ref reason } if reason == "tick timeout"
        ));
        assert_eq!(server.recv_close().await, (4000, "tick timeout".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_keep_connection_alive() {
        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(GatewayClientOptions::default(), connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (id, _, _) = server.recv_request().await;
        server.hello(&id, 1000);
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            server.event(events::TICK, json!({"ts": 0}), None);
        }
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_pending_requests() {
        let (client, _events, mut server, _servers) = ready(GatewayClientOptions::default()).await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("status", None, RequestOptions::default()).await })
        };
        server.recv_request().await;
        server.close(1006, "");
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::Closed { code: 1006, .. }));
        assert!(err.to_string().starts_with("gateway closed (1006 abnormal closure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_rejects_pending_and_prevents_reconnect() {
        let (client, mut events, mut server, mut servers) =
            ready(GatewayClientOptions::default()).await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("status", None, RequestOptions::default()).await })
        };
        server.recv_request().await;
        client.stop();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "gateway client stopped");
        assert_eq!(server.recv_close().await.0, CLOSE_NORMAL);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(servers.try_recv().is_err());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ClientEvent::Reconnecting { .. }));
        }
        assert!(matches!(
            client.request("status", None, RequestOptions::default()).await,
            Err(GatewayError::Stopped)
        ));
        // Starting a stopped client does nothing.
        client.start();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_before_connect_is_rejected() {
        let (connector, _servers) = stub();
        let (client, _events) = GatewayClient::new(GatewayClientOptions::default(), connector);
        let err = client
            .request("status", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_fails_before_send() {
        let (client, _events, mut server, _servers) = ready(GatewayClientOptions::default()).await;
        let err = client
            .request("", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_stored_token_falls_back_to_shared() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = identity_options(&dir);
        options.shared_token = Some("shared-secret".into());
        let identity = options.device_identity.clone().unwrap();
        let store = options.token_store.clone().unwrap();
        store
            .store(&identity.device_id, "operator", "stale-token", &[])
            .unwrap();

        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(options, connector);
        client.start();

        let mut server = servers.recv().await.unwrap();
        let (id, _, params) = server.recv_request().await;
        assert_eq!(params["auth"]["token"], "stale-token");
        server.send(json!({
            "type": "res", "id": id, "ok": false,
            "error": {"code": "UNAUTHORIZED", "message": "device token mismatch"}
        }));
        let err = wait_for(&mut events, |e| matches!(e, ClientEvent::ConnectError(_))).await;
        assert!(matches!(
            err,
            ClientEvent::ConnectError(GatewayError::Request { ref code, .. }) if code == "UNAUTHORIZED"
        ));
        assert_eq!(server.recv_close().await.0, CLOSE_POLICY_VIOLATION);
        assert!(store.load(&identity.device_id, "operator").is_none());

        let mut server = servers.recv().await.unwrap();
        let (id, _, params) = server.recv_request().await;
        assert_eq!(params["auth"]["token"], "shared-secret");
        server.respond(
            &id,
            hello_payload(
                30_000,
                Some(json!({"deviceToken": "fresh", "role": "operator", "scopes": ["operator.admin"]})),
            ),
        );
        wait_for(&mut events, |e| matches!(e, ClientEvent::HelloOk(_))).await;
        let entry = store.load(&identity.device_id, "operator").unwrap();
        assert_eq!(entry.token, "fresh");
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_token_beats_stored_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = identity_options(&dir);
        options.token = Some("explicit".into());
        options.shared_token = Some("shared".into());
        let identity = options.device_identity.clone().unwrap();
        options
            .token_store
            .as_ref()
            .unwrap()
            .store(&identity.device_id, "operator", "stored", &[])
            .unwrap();

        let (connector, mut servers) = stub();
        let (client, _events) = GatewayClient::new(options, connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (_, _, params) = server.recv_request().await;
        assert_eq!(params["auth"]["token"], "explicit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_without_shared_token_keeps_stored() {
        let dir = tempfile::tempdir().unwrap();
        let options = identity_options(&dir);
        let identity = options.device_identity.clone().unwrap();
        let store = options.token_store.clone().unwrap();
        store
            .store(&identity.device_id, "operator", "stored", &[])
            .unwrap();

        let (connector, mut servers) = stub();
        let (client, mut events) = GatewayClient::new(options, connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (id, _, _) = server.recv_request().await;
        server.send(json!({
            "type": "res", "id": id, "ok": false,
            "error": {"code": "UNAUTHORIZED", "message": "nope"}
        }));
        wait_for(&mut events, |e| matches!(e, ClientEvent::ConnectError(_))).await;
        assert_eq!(store.load(&identity.device_id, "operator").unwrap().token, "stored");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_with_plain_ws_never_connects() {
        let (connector, mut servers) = stub();
        let options = GatewayClientOptions {
            tls_fingerprint: Some("ab".repeat(32)),
            ..Default::default()
        };
        let (client, mut events) = GatewayClient::new(options, connector);
        client.start();
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ClientEvent::ConnectError(ref e)
                if e.to_string() == "gateway tls fingerprint requires wss:// gateway url"
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(servers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_params_shape() {
        let options = GatewayClientOptions {
            client_name: client_ids::CLI.into(),
            mode: client_modes::CLI.into(),
            client_display_name: Some("test cli".into()),
            password: Some("pw".into()),
            instance_id: Some("inst-1".into()),
            ..Default::default()
        };
        let (connector, mut servers) = stub();
        let (client, _events) = GatewayClient::new(options, connector);
        client.start();
        let mut server = servers.recv().await.unwrap();
        let (_, _, params) = server.recv_request().await;
        assert_eq!(params["minProtocol"], PROTOCOL_VERSION);
        assert_eq!(params["client"]["id"], "cli");
        assert_eq!(params["client"]["mode"], "cli");
        assert_eq!(params["client"]["instanceId"], "inst-1");
        assert_eq!(params["auth"], json!({"password": "pw"}));
        assert_eq!(params["role"], "operator");
        assert!(params.get("device").is_none());
        assert!(schema::parse_connect_params(&params).is_ok());
    }
}
