//! Socket and logging helpers shared by the ingest threads

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, bind_udp_socket, connect_timeout};
pub use throttle::LogThrottler;
