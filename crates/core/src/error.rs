use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("writer or reader already closed")]
    Closed,

    #[error("writer already closed")]
    AlreadyClosed,

    #[error("invalid webhook url: {message}")]
    InvalidWebhook { message: String },

    #[error("seek target out of range: {pos}")]
    InvalidSeek { pos: i64 },

    #[error("invalid name: {name}")]
    InvalidName { name: String },

    #[error("already exists: {name}")]
    Exist { name: String },

    #[error("does not exist: {path}")]
    NotExist { path: String },

    #[error("invalid parent: {message}")]
    InvalidParent { message: String },

    #[error("permission denied: {message}")]
    Permission { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("remote error: http {status}")]
    Remote { status: u16 },

    #[error("malformed response: {message}")]
    Malformed { message: String },

    #[error("invalid range: {message}")]
    InvalidRange { message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    /// A writer poisoned by an earlier upload failure returns this on every
    /// subsequent call. `Error` cannot derive `Clone` (its `Io`/`Sqlite`
    /// variants wrap non-`Clone` library errors), so the poisoning error is
    /// latched once behind an `Arc` and handed back by reference from then on.
    #[error("writer poisoned by a prior failure: {0}")]
    Poisoned(Arc<Error>),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport {
            message: e.to_string(),
        }
    }
}
