//! Connection establishment: TCP client, TCP server and USB tunnels

pub mod negotiator;
pub mod stream;
pub mod tunnel;

pub use negotiator::{connect, Listener, Negotiator};
pub use stream::PeerStream;
