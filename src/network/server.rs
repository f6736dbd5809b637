//! WebSocket Game Server
//!
//! Async WebSocket front end for the engine. Each connection authenticates
//! with a JWT, sends commands, and receives every lifecycle event the engine
//! broadcasts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::GameEngine;
use crate::game::events::RoundEvent;
use crate::game::round::BetError;
use crate::game::state::PlayerId;
use crate::network::auth::{validate_token, AuthConfig};
use crate::network::protocol::{
    AuthRequest, AuthResult, BetRequest, BetSuccess, BetView, ClientMessage, CurrentRoundInfo,
    ErrorCode, LeaderboardEntry, RoundView, ServerMessage,
};
use crate::network::rate_limit::{BetRateLimiter, RateLimitConfig};

/// Largest page any list request may ask for.
pub const MAX_PAGE: usize = 100;

/// Largest window for outcome statistics.
pub const MAX_STATS_WINDOW: usize = 1000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for longer than this are closed.
    pub idle_timeout: Duration,
    /// How often idle connections are looked for.
    pub cleanup_interval: Duration,
    /// Where the store snapshot is kept, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    /// Per-player bet rate limit.
    pub bet_rate_limit: RateLimitConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            snapshot_path: None,
            bet_rate_limit: RateLimitConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("DICE_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("DICE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: std::env::var("DICE_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            snapshot_path: std::env::var("DICE_SNAPSHOT_PATH").ok().map(PathBuf::from),
            bet_rate_limit: RateLimitConfig::from_env(),
            ..defaults
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

// =============================================================================
// COMMAND HANDLING
// =============================================================================

/// Per-connection identity.
#[derive(Debug, Clone, Default)]
pub struct ClientSession {
    /// Player after a successful `auth`.
    pub player_id: Option<PlayerId>,
    /// Whether the token carried the admin claim.
    pub is_admin: bool,
}

/// Turns client commands into engine calls and replies.
pub struct CommandHandler {
    engine: Arc<GameEngine>,
    auth: AuthConfig,
    version: String,
    bet_limiter: BetRateLimiter,
}

impl CommandHandler {
    /// Create a handler with the default bet rate limit.
    pub fn new(engine: Arc<GameEngine>, auth: AuthConfig, version: String) -> Self {
        Self::with_rate_limit(engine, auth, version, RateLimitConfig::default())
    }

    /// Create a handler with an explicit bet rate limit.
    pub fn with_rate_limit(
        engine: Arc<GameEngine>,
        auth: AuthConfig,
        version: String,
        limit: RateLimitConfig,
    ) -> Self {
        Self {
            engine,
            auth,
            version,
            bet_limiter: BetRateLimiter::new(limit),
        }
    }

    /// Per-player bet limiter.
    pub fn bet_limiter(&self) -> &BetRateLimiter {
        &self.bet_limiter
    }

    /// Handle one command. `None` means no reply.
    pub async fn handle(&self, session: &mut ClientSession, msg: ClientMessage) -> Option<ServerMessage> {
        let reply = match msg {
            ClientMessage::Auth(req) => self.handle_auth(session, req).await,
            ClientMessage::JoinGame => {
                let round = self.engine.current_round().await;
                ServerMessage::CurrentRound(CurrentRoundInfo::from_snapshot(round.as_ref()))
            }
            ClientMessage::Ping { timestamp } => ServerMessage::Pong {
                timestamp,
                server_time: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            },
            ClientMessage::RecentRounds { limit } => {
                match self.engine.rounds().recent_rounds(limit.min(MAX_PAGE)).await {
                    Ok(rounds) => ServerMessage::RecentRounds {
                        rounds: rounds.iter().map(RoundView::from).collect(),
                    },
                    Err(e) => internal_error(e),
                }
            }
            ClientMessage::OutcomeStats { last_n } => {
                match self.engine.rounds().outcome_stats(last_n.min(MAX_STATS_WINDOW)).await {
                    Ok(outcomes) => ServerMessage::OutcomeStats { outcomes },
                    Err(e) => internal_error(e),
                }
            }
            ClientMessage::Leaderboard { limit } => {
                match self.engine.ledger().top_balances(limit.min(MAX_PAGE)).await {
                    Ok(top) => ServerMessage::Leaderboard {
                        entries: top
                            .into_iter()
                            .map(|(id, coins)| LeaderboardEntry {
                                player_ref: id.to_uuid_string(),
                                coins,
                            })
                            .collect(),
                    },
                    Err(e) => internal_error(e),
                }
            }
            other => {
                let Some(player) = session.player_id else {
                    return Some(ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first"));
                };
                self.handle_player_command(player, session.is_admin, other).await
            }
        };
        Some(reply)
    }

    async fn handle_auth(&self, session: &mut ClientSession, req: AuthRequest) -> ServerMessage {
        let failed = |error: String| {
            ServerMessage::AuthResult(AuthResult {
                success: false,
                player_ref: None,
                coins: None,
                error: Some(error),
                server_version: self.version.clone(),
            })
        };

        let claims = match validate_token(&req.token, &self.auth) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(code = ?e.code(), "Auth rejected: {}", e);
                return failed(e.to_string());
            }
        };

        let player = claims.player_id();
        let coins = match self.engine.open_account(player).await {
            Ok(coins) => coins,
            Err(e) => {
                error!(player = %player.short(), "Failed to open account: {}", e);
                return failed("account unavailable".into());
            }
        };

        session.player_id = Some(player);
        session.is_admin = claims.admin;
        info!(player = %player.short(), admin = claims.admin, client = %req.client_version, "Player authenticated");

        ServerMessage::AuthResult(AuthResult {
            success: true,
            player_ref: Some(player.to_uuid_string()),
            coins: Some(coins),
            error: None,
            server_version: self.version.clone(),
        })
    }

    async fn handle_player_command(&self, player: PlayerId, is_admin: bool, msg: ClientMessage) -> ServerMessage {
        match msg {
            ClientMessage::PlaceBet(req) => self.handle_bet(player, req).await,
            ClientMessage::RequestBalance => match self.engine.balance(player).await {
                Ok(coins) => ServerMessage::BalanceUpdate { coins },
                Err(e) => internal_error(e),
            },
            ClientMessage::History { limit, offset } => {
                match self.engine.rounds().player_history(player, limit.min(MAX_PAGE), offset).await {
                    Ok(bets) => ServerMessage::History {
                        bets: bets.iter().map(BetView::from).collect(),
                    },
                    Err(e) => internal_error(e),
                }
            }
            ClientMessage::Stats => match self.engine.rounds().player_stats(player).await {
                Ok(stats) => ServerMessage::Stats(stats),
                Err(e) => internal_error(e),
            },
            admin_msg if !is_admin => {
                warn!(player = %player.short(), ?admin_msg, "Admin command refused");
                ServerMessage::error(ErrorCode::Forbidden, "Admin rights required")
            }
            ClientMessage::SetHouseEdge { percent } => match self.engine.set_house_edge(percent).await {
                Ok(_) => self.settings_reply().await,
                Err(e) => ServerMessage::error(ErrorCode::InvalidInput, e.to_string()),
            },
            ClientMessage::SetMaintenance { enabled } => match self.engine.set_maintenance(enabled).await {
                Ok(()) => self.settings_reply().await,
                Err(e) => internal_error(e),
            },
            ClientMessage::SetBalance { player_ref, coins } => {
                let Some(target) = PlayerId::from_uuid_str(&player_ref) else {
                    return ServerMessage::error(ErrorCode::InvalidInput, "Invalid player reference");
                };
                match self.engine.ledger().set_balance(target, coins).await {
                    Ok(()) => {
                        info!(admin = %player.short(), target = %target.short(), coins, "Balance overwritten");
                        ServerMessage::BalanceUpdate { coins }
                    }
                    Err(e) => ServerMessage::error(ErrorCode::InvalidInput, e.to_string()),
                }
            }
            other => {
                debug!(?other, "Unexpected command");
                ServerMessage::error(ErrorCode::InvalidInput, "Unsupported command")
            }
        }
    }

    async fn handle_bet(&self, player: PlayerId, req: BetRequest) -> ServerMessage {
        if !self.bet_limiter.try_acquire(player).await {
            return ServerMessage::BetError { error: BetError::RateLimited.to_string() };
        }

        let result = match req.validate() {
            Ok((side, amount)) => self.engine.place_bet(player, side, amount).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => ServerMessage::BetSuccess(BetSuccess::from(receipt)),
            Err(e) => ServerMessage::BetError { error: e.to_string() },
        }
    }

    async fn settings_reply(&self) -> ServerMessage {
        ServerMessage::Settings {
            house_edge: self.engine.house_edge().await.percent(),
            maintenance: self.engine.maintenance().await.unwrap_or(false),
        }
    }
}

fn internal_error(e: impl std::fmt::Display) -> ServerMessage {
    error!("Store error while serving client: {}", e);
    ServerMessage::error(ErrorCode::InternalError, "Internal error")
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Anything written to a client socket.
#[derive(Debug, Clone)]
enum Outgoing {
    Reply(ServerMessage),
    Event(RoundEvent),
}

impl Outgoing {
    fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Outgoing::Reply(msg) => msg.to_json(),
            Outgoing::Event(event) => event.to_json(),
        }
    }
}

/// Connected client state.
struct ConnectedClient {
    /// Player identifier (after auth).
    player_id: Option<PlayerId>,
    /// Connection time.
    connected_at: Instant,
    /// Last message received.
    last_activity: Instant,
    /// Wakes the connection task to close it.
    closer: Arc<Notify>,
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Command handler shared by all connections.
    handler: Arc<CommandHandler>,
    /// Engine, for event subscriptions.
    engine: Arc<GameEngine>,
    /// Connected clients.
    clients: ClientMap,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, engine: Arc<GameEngine>, auth: AuthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = Arc::new(CommandHandler::with_rate_limit(
            engine.clone(),
            auth,
            config.version.clone(),
            config.bet_rate_limit,
        ));

        Self {
            config,
            handler,
            engine,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_handler = self.handler.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_every = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_handler, idle_timeout, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = self.check_capacity().await {
                                warn!("{}, rejecting {}", e, addr);
                                continue;
                            }
                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    async fn check_capacity(&self) -> Result<(), GameServerError> {
        if self.clients.read().await.len() >= self.config.max_connections {
            return Err(GameServerError::ConnectionLimitReached);
        }
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let handler = self.handler.clone();
        let mut events = self.engine.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = Self::run_connection(stream, addr, &clients, &handler, &mut events, &mut shutdown_rx).await {
                debug!("Connection {} ended with error: {}", addr, e);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    player = ?client.player_id.map(|p| p.short()),
                    connected_for = ?client.connected_at.elapsed(),
                    "Client {} cleaned up",
                    addr
                );
            }
        });
    }

    async fn run_connection(
        stream: TcpStream,
        addr: SocketAddr,
        clients: &ClientMap,
        handler: &CommandHandler,
        events: &mut broadcast::Receiver<RoundEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<Outgoing>(64);

        let closer = Arc::new(Notify::new());
        clients.write().await.insert(addr, ConnectedClient {
            player_id: None,
            connected_at: Instant::now(),
            last_activity: Instant::now(),
            closer: closer.clone(),
        });

        let sender_task = tokio::spawn(async move {
            while let Some(out) = msg_rx.recv().await {
                let text = match out.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session = ClientSession::default();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(client) = clients.write().await.get_mut(&addr) {
                                client.last_activity = Instant::now();
                            }

                            let reply = match ClientMessage::from_json(&text) {
                                Ok(cmd) => {
                                    let before = session.player_id;
                                    let reply = handler.handle(&mut session, cmd).await;
                                    if session.player_id != before {
                                        if let Some(client) = clients.write().await.get_mut(&addr) {
                                            client.player_id = session.player_id;
                                        }
                                    }
                                    reply
                                }
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    Some(ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format"))
                                }
                            };

                            if let Some(reply) = reply {
                                if msg_tx.send(Outgoing::Reply(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        // Pings are answered by tungstenite; binary frames are not part of the protocol
                        Some(Ok(_)) => {}
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if msg_tx.send(Outgoing::Event(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Client {} lagged, {} events dropped", addr, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = closer.notified() => {
                    info!("Closing idle client {}", addr);
                    break;
                }
                _ = shutdown_rx.recv() => {
                    let _ = msg_tx.send(Outgoing::Reply(ServerMessage::Shutdown {
                        reason: "Server shutting down".to_string(),
                    })).await;
                    break;
                }
            }
        }

        // Let queued messages flush before the socket closes
        drop(msg_tx);
        if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
            debug!("Sender for {} did not flush in time", addr);
        }

        Ok(())
    }

    /// Close connections that have been silent too long and forget idle rate buckets.
    async fn run_cleanup_loop(
        clients: ClientMap,
        handler: Arc<CommandHandler>,
        idle_timeout: Duration,
        every: Duration,
    ) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let now = Instant::now();
            let clients = clients.read().await;
            for (addr, client) in clients.iter() {
                if now.duration_since(client.last_activity) > idle_timeout {
                    debug!("Client {} idle, closing", addr);
                    client.closer.notify_one();
                }
            }
            drop(clients);

            let pruned = handler.bet_limiter().prune().await;
            if pruned > 0 {
                debug!("Dropped {} idle bet limiters", pruned);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get authenticated connection count.
    pub async fn player_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.player_id.is_some())
            .count()
    }
}
