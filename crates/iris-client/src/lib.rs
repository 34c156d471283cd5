//! Client-side binding for the Iris cloud messaging fabric.
//!
//! The binding multiplexes four messaging primitives (broadcast,
//! request/reply, publish/subscribe, and tunnelled byte streams) onto a
//! single framed TCP connection to a locally running Iris relay node.
//! Delivery of broadcasts and events is best effort; requests are
//! load-balanced across the addressed cluster; tunnels are ordered,
//! reliable, and flow controlled.
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() -> iris_client::Result<()> {
//!     let conn = iris_client::connect(55555).await?;
//!     let reply = conn.request("echo", b"hello", 1000).await?;
//!     println!("{}", String::from_utf8_lossy(&reply));
//!     conn.close().await
//! }
//! ```
mod client;
mod config;
mod error;
mod handlers;
mod pool;
mod validate;

use std::sync::Arc;

pub use client::{Connection, Service, Tunnel};
pub use config::{ServiceLimits, TopicLimits};
pub use error::{Error, Result};
pub use handlers::{ServiceHandler, TopicHandler};

/// Connects to the Iris network as a simple client.
///
/// `port` is the listening TCP endpoint of the locally running relay node.
pub async fn connect(port: u16) -> Result<Connection> {
    Connection::establish(port, "", None, ServiceLimits::default()).await
}

/// Connects to the Iris network and registers a new service instance as a
/// member of the given cluster, with `handler` receiving the inbound
/// events. `limits` overrides the default quality-of-service limits.
pub async fn register(
    port: u16,
    cluster: &str,
    handler: Arc<dyn ServiceHandler>,
    limits: Option<ServiceLimits>,
) -> Result<Service> {
    validate::local_cluster(cluster)?;
    let connection = Connection::establish(
        port,
        cluster,
        Some(Arc::clone(&handler)),
        limits.unwrap_or_default(),
    )
    .await?;
    handler.init(connection.clone()).await;
    Ok(Service::new(connection))
}
