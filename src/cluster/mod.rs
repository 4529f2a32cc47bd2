//! Cluster Module
//!
//! Peer links and the managers that keep them alive.

pub mod connection;
pub mod manager;
pub mod peer;

pub use connection::{ConnectionState, ConnectionTimers, ManagedConnection};
pub use manager::{ClusterConfig, ClusterManager, ReconcileReport};
pub use peer::{
    PeerCaller, PeerConnector, PeerEvent, PeerEventHandler, PeerLink, PeerLinkRemote, PeerRequest,
    TcpConnector,
};
