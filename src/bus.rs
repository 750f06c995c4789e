//! Message bus contract consumed by the ingestion pipeline.
//!
//! The semantics follow a streaming server with durable subscriptions: messages are acknowledged manually, a
//! subscription has at most `max_in_flight` unacknowledged messages, and a message not acknowledged within
//! `ack_wait` is delivered again. A durable subscription resumes where its previous session left off, so only
//! what was unacknowledged at the time of a crash is redelivered.

pub mod memory;

use async_trait::async_trait;
use fieldx::fxstruct;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;

/// Server-assigned sequence number of a published message.
pub type MessageId = u64;

/// Where a subscription without durable history starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published after subscribing.
    #[default]
    NewOnly,
    /// Everything the server still has.
    AllAvailable,
}

/// ```ignore
/// let options = SubscriptionOptions::builder()
///     .subject("orders")
///     .durable_name("ingest")
///     .max_in_flight(1)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
#[fxstruct(no_new, builder, get)]
pub struct SubscriptionOptions {
    #[fieldx(builder(required, into))]
    subject:       String,
    /// Subscriptions with a durable name resume where the previous session with the same name left off.
    #[fieldx(optional, builder(into), get(as_ref))]
    durable_name:  String,
    /// Number of delivered but not yet acknowledged messages the subscription may hold.
    #[fieldx(get(copy), default(10))]
    max_in_flight: usize,
    /// How long a delivered message may stay unacknowledged before it is delivered again.
    #[fieldx(get(copy), default(Duration::from_secs(30)))]
    ack_wait:      Duration,
    #[fieldx(get(copy), default(StartPosition::NewOnly))]
    start:         StartPosition,
}

/// The bus side of an acknowledgment.
pub trait AckHandle: Send + Sync + 'static {
    fn ack(&self, sequence: MessageId) -> Result<(), BusError>;
}

/// A delivered message. It stays outstanding until [`ack()`](Message::ack) is called or its ack wait expires.
pub struct Message {
    subject:     String,
    sequence:    MessageId,
    data:        Vec<u8>,
    redelivered: bool,
    acker:       Arc<dyn AckHandle>,
}

impl Message {
    pub fn new(
        subject: String,
        sequence: MessageId,
        data: Vec<u8>,
        redelivered: bool,
        acker: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            subject,
            sequence,
            data,
            redelivered,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn sequence(&self) -> MessageId {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn ack(&self) -> Result<(), BusError> {
        self.acker.ack(self.sequence)
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Acknowledging the message, or not, is up to the handler.
    async fn handle(&self, message: Message);
}

/// Handle of an active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id:           u64,
    pub(crate) subject:      String,
    pub(crate) durable_name: Option<String>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn durable_name(&self) -> Option<&str> {
        self.durable_name.as_deref()
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn subscribe(
        &self,
        options: SubscriptionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    /// Stop delivery. Durable progress is kept.
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError>;

    /// Returns once the server has stored the message.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<MessageId, BusError>;

    /// Cancel all subscriptions of the connection and refuse further use.
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn subscribe(
        &self,
        options: SubscriptionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        (**self).subscribe(options, handler).await
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError> {
        (**self).unsubscribe(subscription).await
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<MessageId, BusError> {
        (**self).publish(subject, payload).await
    }

    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}
