pub mod bridge;
pub mod connection;
pub mod error;
pub mod live;
pub mod live_message;
pub mod prompt;
pub mod protocol;
pub mod reconnect;
pub mod settings;
pub mod store;
pub mod token;
pub mod turn;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeDeps, ClientFrame, VoiceBridge};
pub use connection::{ConnectionRegistry, ConnectionSnapshot};
pub use error::BridgeError;
pub use settings::BridgeSettings;
