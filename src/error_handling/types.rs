use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingField(String),
    UnsupportedAuth(String),
    DuplicateUser(String),
    BadFingerprint(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingField(e) => write!(f, "Missing configuration field: {}", e),
            ConfigError::UnsupportedAuth(e) => write!(f, "Unsupported authentication: {}", e),
            ConfigError::DuplicateUser(e) => write!(f, "Duplicate user entry: {}", e),
            ConfigError::BadFingerprint(e) => write!(f, "Host key fingerprint error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

#[derive(Debug)]
pub enum IdentityError {
    IoError(std::io::Error),
    KeyError(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::IoError(e) => write!(f, "Host key IO error: {}", e),
            IdentityError::KeyError(e) => write!(f, "Host key error: {}", e),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        IdentityError::IoError(err)
    }
}

#[derive(Debug)]
pub enum NetworkError {
    BindError(std::io::Error),
    Identity(IdentityError),
    AlreadyRunning,
    ServerStopped,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindError(e) => write!(f, "Network bind error: {}", e),
            NetworkError::Identity(e) => write!(f, "Server identity error: {}", e),
            NetworkError::AlreadyRunning => write!(f, "Proxy server is already running"),
            NetworkError::ServerStopped => write!(f, "Proxy server has been stopped"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<IdentityError> for NetworkError {
    fn from(err: IdentityError) -> Self {
        NetworkError::Identity(err)
    }
}

/// Reasons a client credential was refused. Only ever logged; the client always sees the
/// same generic rejection.
#[derive(Debug, PartialEq)]
pub enum AuthError {
    UnknownUser(String),
    MethodMismatch(String),
    BadCredential(String),
    KeyFile(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::UnknownUser(u) => write!(f, "Unknown user: {}", u),
            AuthError::MethodMismatch(u) => {
                write!(f, "Authentication method not allowed for user: {}", u)
            }
            AuthError::BadCredential(u) => write!(f, "Invalid credential for user: {}", u),
            AuthError::KeyFile(e) => write!(f, "Authorized key file error: {}", e),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum UpstreamError {
    ConfigError(String),
    KeyLoadError(String),
    DialError(String),
    ChannelOpen(String),
    NotConnected,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::ConfigError(e) => write!(f, "Upstream configuration error: {}", e),
            UpstreamError::KeyLoadError(e) => write!(f, "Upstream key load error: {}", e),
            UpstreamError::DialError(e) => write!(f, "Upstream connection failed: {}", e),
            UpstreamError::ChannelOpen(e) => write!(f, "Upstream channel open failed: {}", e),
            UpstreamError::NotConnected => write!(f, "Upstream transport is not connected"),
        }
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Debug, PartialEq)]
pub enum RequestError {
    Malformed(String),
    Unsupported(String),
    ChannelClosed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Malformed(e) => write!(f, "Malformed channel request: {}", e),
            RequestError::Unsupported(e) => write!(f, "Unsupported channel request: {}", e),
            RequestError::ChannelClosed => write!(f, "Channel closed before request completed"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<ssh_encoding::Error> for RequestError {
    fn from(err: ssh_encoding::Error) -> Self {
        RequestError::Malformed(err.to_string())
    }
}

#[derive(Debug)]
pub enum CaptureError {
    IoError(std::io::Error),
    Closed,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::IoError(e) => write!(f, "Transcript IO error: {}", e),
            CaptureError::Closed => write!(f, "Transcript already closed"),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err)
    }
}

#[derive(Debug)]
pub enum SessionError {
    Upstream(UpstreamError),
    Capture(CaptureError),
    Request(RequestError),
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Upstream(e) => write!(f, "{}", e),
            SessionError::Capture(e) => write!(f, "{}", e),
            SessionError::Request(e) => write!(f, "{}", e),
            SessionError::Io(e) => write!(f, "Relay IO error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<UpstreamError> for SessionError {
    fn from(err: UpstreamError) -> Self {
        SessionError::Upstream(err)
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::Capture(err)
    }
}

impl From<RequestError> for SessionError {
    fn from(err: RequestError) -> Self {
        SessionError::Request(err)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err)
    }
}

#[derive(Debug)]
pub enum SummaryError {
    IoError(std::io::Error),
    Http(String),
    BadResponse(String),
    UnsupportedProvider(String),
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryError::IoError(e) => write!(f, "Summary IO error: {}", e),
            SummaryError::Http(e) => write!(f, "Summary request failed: {}", e),
            SummaryError::BadResponse(e) => write!(f, "Unexpected summary response: {}", e),
            SummaryError::UnsupportedProvider(p) => write!(f, "Unsupported summary provider: {}", p),
        }
    }
}

impl std::error::Error for SummaryError {}

impl From<std::io::Error> for SummaryError {
    fn from(err: std::io::Error) -> Self {
        SummaryError::IoError(err)
    }
}

impl From<reqwest::Error> for SummaryError {
    fn from(err: reqwest::Error) -> Self {
        SummaryError::Http(err.to_string())
    }
}
