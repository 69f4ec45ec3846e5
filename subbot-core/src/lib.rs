pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;
pub mod pairing;
pub mod protocol;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SubbotConfig;
pub use error::SubbotError;
pub use protocol::{
    CloseReason, ConnectRequest, Connection, ConnectionHandle, LifecycleEvent, ProtocolClient,
    ProtocolError,
};
pub use store::{ActivationStore, MemoryStore, PgStore, SessionStore, Store};
