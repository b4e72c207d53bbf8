use std::array::TryFromSliceError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The primary error type for the `bandlink` library.
///
/// Every failure reaches the caller with one of these kinds; nothing is
/// downgraded to a default value on the way up.
#[derive(Error, Debug)]
pub enum BandError {
    #[error("Band not available: {0}")]
    DeviceUnavailable(String),

    #[error("Radio access denied by the platform")]
    PermissionDenied,

    #[error("Service {0} not found on peripheral")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected by band (status {status:#04x})")]
    AuthenticationRejected { status: u8 },

    #[error("Authentication did not complete within {0:?}")]
    AuthenticationTimeout(Duration),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid auth key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Session is not authenticated")]
    NotAuthenticated,

    #[error("No stable heart-rate reading within {0:?}")]
    MeasurementTimeout(Duration),

    #[error("Command {command} timed out after {timeout:?}")]
    CommandTimeout { command: &'static str, timeout: Duration },

    #[error("Wrong band: expected {expected}, found {found}")]
    WrongDevice { expected: String, found: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BandError {
    /// Stable machine-readable code for UI layers.
    pub fn code(&self) -> &'static str {
        match self {
            BandError::DeviceUnavailable(_) => "device_unavailable",
            BandError::PermissionDenied => "permission_denied",
            BandError::ServiceNotFound(_) => "service_not_found",
            BandError::CharacteristicNotFound { .. } => "characteristic_not_found",
            BandError::Transport(_) => "transport_error",
            BandError::AuthenticationRejected { .. } => "authentication_rejected",
            BandError::AuthenticationTimeout(_) => "authentication_timeout",
            BandError::ProtocolViolation(_) => "protocol_violation",
            BandError::MalformedFrame(_) => "malformed_frame",
            BandError::InvalidKeyFormat(_) => "invalid_key_format",
            BandError::NotAuthenticated => "not_authenticated",
            BandError::MeasurementTimeout(_) => "measurement_timeout",
            BandError::CommandTimeout { .. } => "command_timeout",
            BandError::WrongDevice { .. } => "wrong_device",
            BandError::InvalidArgument(_) => "invalid_argument",
            BandError::Registry(_) => "registry_error",
            BandError::Io(_) => "io_error",
            BandError::Json(_) => "json_error",
        }
    }

    /// Whether re-invoking the failed operation may succeed without user action.
    ///
    /// Transport-level failures other than an unreachable band need the user
    /// to re-select the device, and a rejected key needs a new key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BandError::DeviceUnavailable(_)
                | BandError::AuthenticationTimeout(_)
                | BandError::MeasurementTimeout(_)
                | BandError::CommandTimeout { .. }
        )
    }
}

impl From<TryFromSliceError> for BandError {
    fn from(_: TryFromSliceError) -> Self {
        BandError::MalformedFrame("Failed to convert slice to array".to_string())
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for BandError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => BandError::PermissionDenied,
            btleplug::Error::DeviceNotFound => BandError::DeviceUnavailable(err.to_string()),
            other => BandError::Transport(other.to_string()),
        }
    }
}
