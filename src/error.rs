use crate::types::OrderKey;
use thiserror::Error;

/// Failures reported by a [`RecordStore`](crate::traits::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order #{0} not found")]
    NotFound(OrderKey),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Failure of a non-database backend.
    #[error("record store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Typed outcome of a failed cache lookup, suitable for mapping onto distinct client responses.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("order #{0} not found")]
    NotFound(OrderKey),

    #[error("storage error while looking up order #{key}: {source}")]
    Storage {
        key:    OrderKey,
        #[source]
        source: StoreError,
    },
}

impl LookupError {
    pub(crate) fn from_store(key: OrderKey, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => LookupError::NotFound(key),
            source => LookupError::Storage { key, source },
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection '{0}' is closed")]
    Closed(String),

    #[error("subscription to '{subject}' rejected: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("durable subscription '{0}' is already active")]
    DurableInUse(String),

    #[error("unknown subscription #{0}")]
    UnknownSubscription(u64),

    #[error("message #{0} cannot be acknowledged: subscription is gone")]
    SubscriptionGone(u64),

    #[error("message #{0} is not awaiting acknowledgment")]
    NotInFlight(u64),
}

/// Failures local to processing one inbound message.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed order message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to persist order: {0}")]
    Storage(#[from] StoreError),
}

#[cfg(feature = "service")]
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cli(#[from] clap::Error),

    #[error(transparent)]
    FieldX(#[from] fieldx::error::FieldXError),

    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Config(String),
}
