//! Error taxonomy.
//!
//! [`Error`] is the only error type callers ever see. The narrower internal
//! types ([`ConnectionError`], [`RoutingError`], [`TopologyError`]) describe
//! recoverable conditions that the dispatcher handles itself; they are
//! converted into an [`Error`] only once retries or the deadline run out.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::Status;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The node answered with a definitive, non-routing status.
    #[error("operation failed: {0}")]
    Application(Status),

    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("gave up after {retries} retries; last failure: {last}")]
    RetriesExhausted { retries: u32, last: String },

    #[error("no node owns partition {partition}")]
    NoRoute { partition: u16 },

    #[error("cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("client is shut down")]
    Shutdown,
}

impl Error {
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Application(status) => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(Status::KeyNotFound)
    }

    /// True for both "key already exists" and CAS mismatches.
    pub fn is_exists(&self) -> bool {
        self.status() == Some(Status::KeyExists)
    }

    pub fn is_locked(&self) -> bool {
        self.status() == Some(Status::Locked)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Failure to establish or use a single node connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connect to {node} failed: {reason}")]
    Connect { node: String, reason: String },

    #[error("authentication to {node} rejected: {reason}")]
    Auth { node: String, reason: String },

    #[error("connection to {node} is closed")]
    Closed { node: String },

    #[error("connection pool is closed")]
    PoolClosed,
}

/// The table has no owner for the partition a key hashed to.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("topology has no owner for partition {partition}")]
pub struct RoutingError {
    pub partition: u16,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The administrative endpoint could not supply a table at all.
    #[error("{0}")]
    Unavailable(String),

    #[error("malformed bucket configuration: {0}")]
    Malformed(String),
}

impl From<TopologyError> for Error {
    fn from(err: TopologyError) -> Self {
        Error::TopologyUnavailable(err.to_string())
    }
}
