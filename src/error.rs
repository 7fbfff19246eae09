use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Connection to {0} refused")]
    ConnectRefused(String),

    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("No pending connection")]
    WouldBlock,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("A control command is already pending")]
    ControlBusy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Whether the owning ingest thread may retry with a fresh connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::ConnectTimeout(_)
                | AppError::ConnectRefused(_)
                | AppError::Transport(_)
                | AppError::Io(_)
        )
    }
}

/// Failures of a USB tunnel provider, surfaced before any socket is opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("No devices detected: re-attach the device and check that it is visible to the host")]
    NoDevices,

    #[error("Error loading devices ({0}): check that the tunnel service is installed and running")]
    LoadError(String),

    #[error("Device is offline: re-attach the device")]
    Offline,

    #[error("Device is in unauthorized state: re-attach it and allow the debugging connection when prompted")]
    Unauthorized,

    #[error("Error forwarding the connection ({0}): make sure the phone app is open, then re-attach the device")]
    ForwardFailed(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Receives every fatal error exactly once, in human-readable form
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &AppError);
}

/// Reporter that writes fatal errors to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, context: &str, error: &AppError) {
        tracing::error!(
            error_type = error_kind(error),
            error_message = %error,
            "{}",
            context
        );
    }
}

fn error_kind(error: &AppError) -> &'static str {
    match error {
        AppError::ConnectTimeout(_) | AppError::ConnectRefused(_) => "connect",
        AppError::BindFailed { .. } | AppError::WouldBlock => "accept",
        AppError::Transport(_) | AppError::Io(_) => "transport",
        AppError::Protocol(_) => "protocol",
        AppError::Device(_) => "device",
        AppError::Tunnel(_) => "tunnel",
        AppError::ControlBusy => "control",
        AppError::Config(_) => "config",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(AppError::ConnectTimeout("1.2.3.4:4747".into()).is_transport());
        assert!(AppError::Transport("reset".into()).is_transport());
        assert!(!AppError::Protocol("bad magic".into()).is_transport());
        assert!(!AppError::Tunnel(TunnelError::NoDevices).is_transport());
    }

    #[test]
    fn test_tunnel_error_is_transparent() {
        let err = AppError::from(TunnelError::Offline);
        assert_eq!(err.to_string(), TunnelError::Offline.to_string());
    }
}
