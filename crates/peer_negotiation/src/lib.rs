use async_trait::async_trait;
use shared::protocol::{IceCandidate, SessionDescription};
use tokio::sync::broadcast;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOptions {
    pub ice_servers: Vec<String>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    /// A locally gathered candidate that must be relayed to the peer.
    LocalCandidate(IceCandidate),
    /// First remote media track arrived.
    RemoteMediaStarted,
}

/// One peer connection plus the local microphone feeding it.
///
/// `release` stops local tracks and closes the connection. It is synchronous
/// so it can run from `Drop` and must tolerate being called more than once.
#[async_trait]
pub trait PeerNegotiator: Send + Sync {
    async fn acquire_local_audio(&self) -> anyhow::Result<()>;
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    /// Installs the remote offer and returns the local answer.
    async fn accept_offer(&self, offer: SessionDescription)
        -> anyhow::Result<SessionDescription>;
    async fn apply_answer(&self, answer: SessionDescription) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    fn release(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<NegotiatorEvent>;
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> anyhow::Result<std::sync::Arc<dyn PeerNegotiator>>;
}
