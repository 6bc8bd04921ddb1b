pub mod error;

pub use error::{DbScopeError, Result, TransactionError, TransactionOp};
