use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    NotInRange(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// A session is still pending; carries its id.
    SessionBusy(String),
    RosterEmpty,
    /// A roster entry is not a usable node identifier.
    InvalidNode(String),
    NotFound(String),
    AssemblerUnavailable,
    StorageError(StorageError),
    BusError(BusError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::SessionBusy(id) => write!(f, "Session {} is still pending", id),
            SessionError::RosterEmpty => write!(f, "No nodes targeted or known"),
            SessionError::InvalidNode(id) => write!(f, "Invalid node identifier {:?}", id),
            SessionError::NotFound(id) => write!(f, "Session {} not found", id),
            SessionError::AssemblerUnavailable => write!(f, "Session assembler is not running"),
            SessionError::StorageError(e) => write!(f, "Storage error: {}", e),
            SessionError::BusError(e) => write!(f, "Status bus error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::StorageError(err)
    }
}

impl From<BusError> for SessionError {
    fn from(err: BusError) -> Self {
        SessionError::BusError(err)
    }
}

#[derive(Debug)]
pub enum StorageError {
    WriteFailed,
    ReadFailed,
    NotFound,
    InvalidKey(String),
    Serialization(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::NotFound => write!(f, "Storage entry not found"),
            StorageError::InvalidKey(k) => write!(f, "Invalid storage key: {}", k),
            StorageError::Serialization(e) => write!(f, "Storage serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum UploadError {
    EmptyPayload,
    PayloadTooLarge { size: usize, max: usize },
    InvalidIdentifier(String),
    InvalidAttempt(u32),
    StorageError(StorageError),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::EmptyPayload => write!(f, "Upload payload is empty"),
            UploadError::PayloadTooLarge { size, max } => {
                write!(f, "Upload payload of {} bytes exceeds limit of {} bytes", size, max)
            }
            UploadError::InvalidIdentifier(id) => write!(f, "Invalid identifier: {:?}", id),
            UploadError::InvalidAttempt(n) => write!(f, "Invalid attempt number: {}", n),
            UploadError::StorageError(e) => write!(f, "Upload storage error: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        UploadError::StorageError(err)
    }
}

#[derive(Debug)]
pub enum BusError {
    Disconnected,
    PublishFailed(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Disconnected => write!(f, "Status bus disconnected"),
            BusError::PublishFailed(e) => write!(f, "Status bus publish failed: {}", e),
        }
    }
}

impl std::error::Error for BusError {}

#[derive(Debug)]
pub enum NodeError {
    SensorAcquisitionFailure(String),
    TransportFailure(String),
    PersistFailed(String),
    Bus(BusError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::SensorAcquisitionFailure(e) => write!(f, "Sensor acquisition failed: {}", e),
            NodeError::TransportFailure(e) => write!(f, "Transport failure: {}", e),
            NodeError::PersistFailed(e) => write!(f, "Local persistence failed: {}", e),
            NodeError::Bus(e) => write!(f, "Control channel error: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<BusError> for NodeError {
    fn from(err: BusError) -> Self {
        NodeError::Bus(err)
    }
}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "Web server bind failed: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    BusError(BusError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::BusError(e) => write!(f, "Status bus error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::StorageError(err)
    }
}

impl From<BusError> for ControllerError {
    fn from(err: BusError) -> Self {
        ControllerError::BusError(err)
    }
}

impl From<WebError> for ControllerError {
    fn from(err: WebError) -> Self {
        ControllerError::WebError(err)
    }
}
