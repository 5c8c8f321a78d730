use thiserror::Error;

/// Refusals and failures from the scratch-root path sandbox.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("path is empty")]
    EmptyPath,

    #[error("path traversal rejected: {0}")]
    TraversalRejected(String),

    #[error("symbolic link rejected: {0}")]
    SymlinkRejected(String),

    #[error("path escapes scratch root: {0}")]
    EscapesRoot(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons the egress guard refuses a URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EgressError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Blocked protocol: {0}")]
    BlockedProtocol(String),

    #[error("Blocked hostname: {0}")]
    BlockedHostname(String),

    #[error("Blocked address: {host} resolves to {addr} ({range})")]
    BlockedAddress {
        host: String,
        addr: std::net::IpAddr,
        range: &'static str,
    },

    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),
}

/// Failures inside a bounded fetch. Rendered into `FetchResult::error`.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{0}")]
    Egress(#[from] EgressError),

    #[error("Redirect blocked: {target} ({reason})")]
    RedirectBlocked { target: String, reason: EgressError },

    #[error("Too many redirects (max {0})")]
    TooManyRedirects(u32),

    #[error("Redirect without a valid Location header (status {0})")]
    MissingLocation(u16),

    #[error("Request timed out after {0}ms")]
    TimedOut(u64),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Refusals and failures from the script sandbox.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Invalid script name: {0}")]
    InvalidScriptName(String),

    #[error("Invalid JSON input: {0}")]
    InvalidJsonInput(#[from] serde_json::Error),

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Failed to spawn interpreter: {0}")]
    SpawnFailed(std::io::Error),

    #[error("Script timed out after {0}ms")]
    TimedOut(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox violation: {0}")]
    Path(#[from] PathError),

    #[error("tool not found: {0}")]
    ToolNotFound(String),
}

pub type Result<T> = std::result::Result<T, GuardError>;
