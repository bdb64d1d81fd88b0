use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("unknown device token format {0:?} (expected \"hex\" or \"base64\")")]
    UnknownTokenFormat(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {which} file {path}: {source}")]
    ReadFile {
        which: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(std::path::PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(std::path::PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in table {table} (rowid {rowid}): {reason}")]
    CorruptRow {
        table: &'static str,
        rowid: i64,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },
    #[error("payload too long: {0} bytes (max 256)")]
    PayloadTooLong(usize),
    #[error("unrecognized command byte {0}")]
    UnknownCommand(u8),
}

#[derive(Debug, Error)]
pub enum TokenParseError {
    #[error("wrong device token length ({got} != 32) for input {input:?}")]
    WrongLength { got: usize, input: String },
    #[error("invalid base64 encoding for device token {0:?}")]
    InvalidBase64(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed send command: {0}")]
    Malformed(String),
    #[error("invalid expiry value {0:?}")]
    InvalidExpiry(String),
    #[error(transparent)]
    Token(#[from] TokenParseError),
    #[error("payload too long ({0} bytes, max 256)")]
    PayloadTooLong(usize),
}
