// Application callback traits for inbound traffic.
use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{Connection, Tunnel};

/// Callbacks for a registered service instance.
///
/// Handlers run on the connection's bounded worker pools and may call back
/// into the [`Connection`] they received at init time; no scheme locks are
/// held across handler invocations.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Called once during registration with the connection the service can
    /// use for reentrant calls.
    async fn init(&self, _connection: Connection) {}

    /// Called for every broadcast addressed to the service's cluster.
    async fn handle_broadcast(&self, _message: Bytes) {}

    /// Called for every inbound request; the reply (or the flattened error)
    /// is forwarded back to the caller.
    async fn handle_request(&self, _request: Bytes) -> anyhow::Result<Bytes> {
        Err(anyhow::anyhow!("request handling not supported"))
    }

    /// Called with the local endpoint of every inbound tunnel.
    async fn handle_tunnel(&self, _tunnel: Tunnel) {}
}

/// Callback for events arriving on a subscribed topic.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle_event(&self, event: Bytes);
}
