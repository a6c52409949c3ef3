//! Application state management module.
//!
//! This module defines the live-connection registry, the per-connection record
//! with its attached `UserProfile`, and the `AppState` context handed to every
//! operation in the crate.

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::receive::TransportMode;
use crate::utils::truncate_chars;
use crate::Sender;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opaque handle of one transport session, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    /// Terminal notification seen; no longer selected by broadcasts.
    Closing,
    Closed,
}

/// Per-connection chat state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// Display name shown to other members.
    pub name: String,
    /// Channel whose chat content this connection receives.
    pub channel: String,
}

/// A live connection together with its attached profile.
#[derive(derive_more::Debug)]
pub struct Connection<S: Sender> {
    pub id: ConnectionId,
    pub mode: TransportMode,
    #[debug(skip)]
    sender: TokioMutex<S>,
    send_timeout: Duration,
    lifecycle: SyncRwLock<Lifecycle>,
    profile: SyncRwLock<Option<UserProfile>>,
}

impl<S: Sender> Connection<S> {
    fn new(
        id: ConnectionId,
        mode: TransportMode,
        sender: S,
        send_timeout: Duration,
        profile: UserProfile,
    ) -> Self {
        Connection {
            id,
            mode,
            sender: TokioMutex::new(sender),
            send_timeout,
            lifecycle: SyncRwLock::new(Lifecycle::Open),
            profile: SyncRwLock::new(Some(profile)),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Copy of the attached profile, `None` once the connection is closed.
    pub fn profile(&self) -> Option<UserProfile> {
        self.profile.read().clone()
    }

    /// Applies `update` to the attached profile. Returns `false` if it is already released.
    pub fn update_profile(&self, update: impl FnOnce(&mut UserProfile)) -> bool {
        match self.profile.write().as_mut() {
            Some(profile) => {
                update(profile);
                true
            }
            None => false,
        }
    }

    /// Writes one text payload to the transport.
    ///
    /// Waiting for a concurrent write to finish counts against `send_timeout`.
    ///
    /// # Errors
    ///
    /// `ChatError::ConnectionClosed` once the connection is unregistered,
    /// `ChatError::SendTimeout` if the write does not complete in time, or
    /// whatever the underlying `Sender` reports.
    pub async fn send(&self, payload: String) -> Result<(), ChatError> {
        if self.lifecycle() == Lifecycle::Closed {
            return Err(ChatError::ConnectionClosed);
        }
        let write = async { self.sender.lock().await.send(payload).await };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::SendTimeout(self.send_timeout)),
        }
    }

    fn selectable_profile(&self) -> Option<UserProfile> {
        if self.lifecycle() != Lifecycle::Open {
            return None;
        }
        self.profile()
    }

    fn begin_close(&self) -> bool {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Open {
            *lifecycle = Lifecycle::Closing;
            true
        } else {
            false
        }
    }

    fn close(&self) {
        *self.lifecycle.write() = Lifecycle::Closed;
        self.profile.write().take();
    }
}

/// The set of live connections. Broadcast selects its recipients here and nowhere else.
pub struct Registry<S: Sender> {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection<S>>>>,
    next_id: AtomicU64,
    default_channel: String,
    name_limit: usize,
    send_timeout: Duration,
}

impl<S: Sender> Registry<S> {
    /// Builds an empty registry from the naming and write limits of `config`.
    pub fn new(config: &ServerConfig) -> Self {
        Registry {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_channel: truncate_chars(&config.default_channel, config.name_limit),
            name_limit: config.name_limit,
            send_timeout: config.send_timeout,
        }
    }

    /// Allocates a fresh identifier. Identifiers are never reused within a registry.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn name_limit(&self) -> usize {
        self.name_limit
    }

    /// Inserts a connection with a default profile (`User<id>` in the default channel).
    ///
    /// # Errors
    ///
    /// Returns `ChatError::DuplicateConnection` if `id` is already live; the
    /// existing entry is left untouched.
    pub async fn register(
        &self,
        id: ConnectionId,
        mode: TransportMode,
        sender: S,
    ) -> Result<Arc<Connection<S>>, ChatError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            warn!("Connection {} is already registered", id);
            return Err(ChatError::DuplicateConnection(id));
        }
        let profile = UserProfile {
            name: truncate_chars(&format!("User{}", id), self.name_limit),
            channel: self.default_channel.clone(),
        };
        let connection = Arc::new(Connection::new(
            id,
            mode,
            sender,
            self.send_timeout,
            profile,
        ));
        connections.insert(id, connection.clone());
        debug!(
            "Connection {} registered ({:?}), {} live",
            id,
            mode,
            connections.len()
        );
        Ok(connection)
    }

    /// Stops `id` from being selected by broadcasts while its loop winds down.
    pub async fn begin_close(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.read().await.get(id) {
            if connection.begin_close() {
                debug!("Connection {} is closing", id);
            }
        }
    }

    /// Removes `id` and releases its profile. Returns `false` if it was not registered.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(id);
        match removed {
            Some(connection) => {
                connection.close();
                debug!("Connection {} unregistered", id);
                true
            }
            None => {
                debug!("Connection {} was not registered", id);
                false
            }
        }
    }

    /// Copy of the profile attached to `id`, or `None` if it is not live.
    pub async fn lookup_state(&self, id: &ConnectionId) -> Option<UserProfile> {
        self.connections.read().await.get(id)?.profile()
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection<S>>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Open connections whose profile satisfies `predicate`, captured under the lock.
    pub(crate) async fn select<F>(&self, predicate: F) -> Vec<Arc<Connection<S>>>
    where
        F: Fn(&ConnectionId, &UserProfile) -> bool,
    {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|connection| {
                connection
                    .selectable_profile()
                    .is_some_and(|profile| predicate(&connection.id, &profile))
            })
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

/// Context shared by every connection: registry, configuration and shutdown signal.
pub struct AppState<S: Sender> {
    /// All live connections.
    pub registry: Arc<Registry<S>>,
    /// Server configuration.
    pub config: ServerConfig,
    shutdown: CancellationToken,
}

impl<S: Sender> AppState<S> {
    /// Creates a new `AppState` instance with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        AppState {
            registry: Arc::new(Registry::new(&config)),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled once `shutdown` is called; receive loops select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Asks every listener and receive loop to stop. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down chat server");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<S: Sender> Clone for AppState<S> {
    /// Shallow clone: the registry and shutdown token are shared.
    fn clone(&self) -> Self {
        AppState {
            registry: self.registry.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Creates a new `AppState` for the chat server.
pub fn create_chat_state<S: Sender>(config: ServerConfig) -> AppState<S> {
    debug!("Creating new chat state with config: {:?}", config);
    AppState::new(config)
}
