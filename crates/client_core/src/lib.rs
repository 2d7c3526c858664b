pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod outbound_queue;
pub mod reconnect;
pub mod rest;
pub mod session;
pub mod socket;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use auth::{StaticTokenProvider, StoredSession, StoredUser, TokenProvider};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection::{ChatConnection, ConnectionState};
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use error::TransportError;
pub use reconnect::ReconnectPolicy;
pub use rest::{ChatApi, HttpChatApi};
pub use session::{ChatSession, SessionEvent};
pub use socket::{SocketChannel, SocketConnector, SocketEvent, TungsteniteConnector};
