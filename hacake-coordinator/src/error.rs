use std::time::Duration;

use hacake_ledger::InvalidSpec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaError {
    #[error("A deployment with id {0:?} already exists.")]
    /// The external id is already in use somewhere in the cluster.
    DuplicateDeployment(String),

    #[error("No deployment with id {0:?} is owned by this node.")]
    UnknownDeployment(String),

    #[error("Deployment driver failure: {0}")]
    /// The local driver failed to start or stop a unit.
    Driver(anyhow::Error),

    #[error("Ledger failure: {0}")]
    /// The replicated ledger could not be read or written.
    Ledger(anyhow::Error),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error(transparent)]
    InvalidSpec(#[from] InvalidSpec),
}

#[derive(Debug, Error)]
#[error("Operation did not complete within {0:?}.")]
/// A driver or ledger call exceeded the configured operation timeout.
pub struct OperationTimeout(pub Duration);
