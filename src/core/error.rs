use thiserror::Error;

/// Which session operation a collaborator failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOp {
    Open,
    Commit,
    Rollback,
    Close,
    Execute,
}

impl std::fmt::Display for TransactionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Close => "close",
            Self::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Failure reported by the underlying engine while driving a session.
///
/// These come from the database collaborator, not from `dbscope` itself.
#[derive(Error, Debug)]
#[error("transaction {op} failed: {message}")]
pub struct TransactionError {
    pub op: TransactionOp,
    pub message: String,
}

impl TransactionError {
    pub fn new(op: TransactionOp, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbScopeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "session not initialised: ensure DbSessionLayer has been installed (or the \
         SessionFactory configured) before attempting database access"
    )]
    SessionNotInitialised,

    #[error(
        "no session found: either you are not currently handling a request, or you need to \
         open a session scope manually, e.g. `db.scope().run(|session| async move {{ .. }})`"
    )]
    MissingSession,

    #[error(
        "no ambient task context: wrap the future in `dbscope::in_context` or install \
         DbSessionLayer before opening a suspending session scope"
    )]
    NoAmbientContext,

    #[error("session is closed: its owning scope has already exited")]
    SessionClosed,

    #[error("lock error: {0}")]
    Lock(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbScopeError>;

impl<T> From<std::sync::PoisonError<T>> for DbScopeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for DbScopeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
