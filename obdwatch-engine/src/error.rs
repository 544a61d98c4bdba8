use derive_more::{Display, Error, From};

use crate::channel::TransportError;

#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    #[display("Configuration error: {_0}")]
    Configuration(#[error(not(source))] String),
    #[display("Adapter not connected ({})", address.as_deref().unwrap_or("no address"))]
    NotConnected { address: Option<String> },
    #[display("Transport error: {_0}")]
    #[from]
    Transport(TransportError),
    #[display("Timed out waiting for the channel task")]
    Timeout,
    #[display("Engine is shut down")]
    ShutDown,
    #[display("Failed to spawn channel task: {_0}")]
    #[from]
    Spawn(std::io::Error),
}

impl EngineError {
    /// Transport-level failures are distinct from configuration and lifecycle errors
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
