// Connection core: relay driver, scheme implementations, and facades.
pub(crate) mod broadcast;
pub(crate) mod connection;
pub(crate) mod publish;
pub(crate) mod relay;
pub(crate) mod request;
pub(crate) mod tunnel;

pub use connection::{Connection, Service};
pub use tunnel::Tunnel;
