//! # Channel-Scoped WebSocket Chat Server
//!
//! This library provides a small real-time chat server: clients pick a display
//! name, join a channel, and every chat line they send is relayed to the other
//! members of that channel. It is built on top of Axum and Tokio, with an
//! optional newline-delimited TCP listener that can terminate TLS itself.
//!
//! ## Features
//!
//! - WebSocket and raw TCP/TLS front-ends sharing one connection registry
//! - Channel-scoped broadcast that never echoes to the sender
//! - `/nick <name>` and `/join <channel>` commands
//! - A receive loop that treats would-block and interrupted reads as retries on
//!   both plaintext and TLS streams
//!
//! ## Main Components
//!
//! - `AppState`: The context shared by every connection: registry, configuration, shutdown.
//! - `Registry`: The live connections and their `UserProfile`s.
//! - `run_receive_loop`: Draws bytes from a `Transport` until end of stream, error or shutdown.
//! - `AppState::broadcast`: Sends one payload to a predicate-selected set of connections.
//! - `route_message`: Interprets one decoded text message.
//! - `ServerConfig`: Server configuration.
//!
//! ## Wire Format
//!
//! Chat lines are delivered as `{"user": ..., "channel": ..., "message": ...}`;
//! acknowledgments as `{"type": "welcome" | "system" | "error", "message": ...}`.
//!
//! ## Getting Started
//!
//! ```no_run
//! use wschat_server::{create_chat_state, serve, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig {
//!         line_port: Some(8082),
//!         ..ServerConfig::default()
//!     };
//!
//!     let state = create_chat_state(config);
//!
//!     let stopper = state.clone();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         stopper.shutdown();
//!     });
//!
//!     serve(state).await.unwrap();
//! }
//! ```
//!
//! ### Embedding in an existing Axum app
//!
//! ```no_run
//! use wschat_server::{chat_routes, create_chat_state, ServerConfig};
//! use std::net::SocketAddr;
//!
//! # async fn run() {
//! let state = create_chat_state(ServerConfig::default());
//! let app = chat_routes(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8081").await.unwrap();
//! axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await.unwrap();
//! # }
//! ```

mod broadcast;
mod config;
mod error;
mod handlers;
mod listener;
mod models;
mod receive;
mod router;
mod server;
mod state;
mod utils;

pub use broadcast::*;
pub use config::*;
pub use error::*;
pub use handlers::*;
pub use listener::*;
pub use models::*;
pub use receive::*;
pub use router::*;
pub use server::*;
pub use state::*;

#[cfg(test)]
#[path = "tests/mock.rs"]
mod mock;

#[cfg(test)]
#[path = "tests/test_messages.rs"]
mod test_messages;
