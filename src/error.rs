use thiserror::Error;

/// Errors that can occur when working with LionChief locomotives
#[derive(Error, Debug)]
pub enum LionChiefError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// A command parameter is outside its documented range
    #[error("Invalid command parameter: {0}")]
    InvalidParameter(String),

    /// The locomotive could not be reached (timeout, not found, pairing required)
    #[error("Failed to connect to locomotive: {0}")]
    ConnectFailed(String),

    /// The primary service or one of its characteristics is missing
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),

    /// Enabling notifications on the notify characteristic failed
    #[error("Failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),

    /// Writing a command frame failed
    #[error("Failed to write command: {reason}")]
    WriteFailed {
        /// Transport-level failure description
        reason: String,
        /// Whether the link dropped while writing
        link_lost: bool,
    },

    /// Reading a characteristic failed
    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    /// Automatic reconnection gave up
    #[error("Reconnect gave up after {attempts} attempt(s) - explicit connect required")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// The session is not connected or was torn down while the command was pending
    #[error("Session closed")]
    SessionClosed,

    /// A notification payload did not match any known layout
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for LionChief operations
pub type Result<T> = std::result::Result<T, LionChiefError>;

impl LionChiefError {
    /// Check if this error means the BLE link itself dropped
    ///
    /// Link-level failures move an active session into reconnection; every
    /// other failure only affects the command that raised it.
    #[must_use]
    pub const fn is_link_level(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed {
                link_lost: true,
                ..
            } | Self::Ble(btleplug::Error::NotConnected)
        )
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailed(_)
                | Self::ServiceDiscoveryFailed(_)
                | Self::SubscribeFailed(_)
                | Self::ReconnectExhausted { .. }
                | Self::SessionClosed
        )
    }

    /// Check if this error is recoverable without reconnecting
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter(_)
                | Self::MalformedFrame(_)
                | Self::ReadFailed(_)
                | Self::WriteFailed {
                    link_lost: false,
                    ..
                }
        )
    }

    /// Check if an explicit `connect()` is needed before commands are accepted again
    #[must_use]
    pub const fn requires_reconnect(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. } | Self::SessionClosed)
    }

    /// Copy of the error for fanning one failure out to several waiters
    ///
    /// `btleplug::Error` is not `Clone`; a wrapped BLE error is carried over as
    /// [`Self::ConnectFailed`] with the same message, except `NotConnected`.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Ble(btleplug::Error::NotConnected) => Self::Ble(btleplug::Error::NotConnected),
            Self::Ble(e) => Self::ConnectFailed(e.to_string()),
            Self::InvalidParameter(m) => Self::InvalidParameter(m.clone()),
            Self::ConnectFailed(m) => Self::ConnectFailed(m.clone()),
            Self::ServiceDiscoveryFailed(m) => Self::ServiceDiscoveryFailed(m.clone()),
            Self::SubscribeFailed(m) => Self::SubscribeFailed(m.clone()),
            Self::WriteFailed { reason, link_lost } => Self::WriteFailed {
                reason: reason.clone(),
                link_lost: *link_lost,
            },
            Self::ReadFailed(m) => Self::ReadFailed(m.clone()),
            Self::ReconnectExhausted { attempts } => Self::ReconnectExhausted {
                attempts: *attempts,
            },
            Self::SessionClosed => Self::SessionClosed,
            Self::MalformedFrame(m) => Self::MalformedFrame(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connect_error = LionChiefError::ConnectFailed("test".to_string());
        assert!(connect_error.is_connection_error());
        assert!(!connect_error.is_recoverable());
        assert!(!connect_error.is_link_level());

        let dropped = LionChiefError::WriteFailed {
            reason: "gatt".to_string(),
            link_lost: true,
        };
        assert!(dropped.is_link_level());
        assert!(!dropped.is_recoverable());

        let rejected = LionChiefError::WriteFailed {
            reason: "gatt".to_string(),
            link_lost: false,
        };
        assert!(!rejected.is_link_level());
        assert!(rejected.is_recoverable());

        assert!(LionChiefError::Ble(btleplug::Error::NotConnected).is_link_level());

        let exhausted = LionChiefError::ReconnectExhausted { attempts: 3 };
        assert!(exhausted.requires_reconnect());
        assert!(exhausted.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = LionChiefError::InvalidParameter("speed out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameter"));
        assert!(error_string.contains("speed out of range"));

        let exhausted = LionChiefError::ReconnectExhausted { attempts: 3 };
        assert!(format!("{exhausted}").contains("3 attempt"));
    }

    #[test]
    fn test_duplicate_keeps_classification() {
        let lost = LionChiefError::Ble(btleplug::Error::NotConnected).duplicate();
        assert!(lost.is_link_level());

        let timeout = LionChiefError::Ble(btleplug::Error::TimedOut(
            std::time::Duration::from_secs(1),
        ))
        .duplicate();
        assert!(matches!(timeout, LionChiefError::ConnectFailed(_)));

        let discovery = LionChiefError::ServiceDiscoveryFailed("no service".to_string());
        assert_eq!(discovery.duplicate().to_string(), discovery.to_string());
    }
}
