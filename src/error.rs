use thiserror::Error;

/// Schema-level failures: these are fatal and never retried by the worker.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("required column missing: {table}.{column}")]
    MissingColumn { table: String, column: String },

    #[error("receiver database not found at {0}")]
    ReceiverNotFound(String),

    #[error("DSN is not a supported MySQL DSN: {0}")]
    InvalidDsn(String),

    #[error("MySQL backend is recognized but not implemented for {0}")]
    MysqlNotImplemented(String),
}

/// Parser-registry failures: unknown parser names are fatal per job.
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("no handler registered for parser '{name}'. known: {known}")]
    UnknownParser { name: String, known: String },

    #[error("handler for parser '{0}' is already registered")]
    DuplicateHandler(String),
}

/// Storage (image deletion) client failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage base_url must be a valid http(s) URL")]
    InvalidBaseUrl,

    #[error("storage api_token must be non-empty")]
    MissingToken,

    #[error("storage delete failed for {name}: HTTP {status}")]
    DeleteFailed { name: String, status: u16 },

    #[error("storage delete failed for {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Top-level error type the binary converges on.
#[derive(Error, Debug)]
pub enum ConverterError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ConverterError>;
