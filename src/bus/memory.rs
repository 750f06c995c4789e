//! In-process streaming bus.
//!
//! [`BusServer`] plays the role of the streaming server: it keeps every published message per subject and the
//! progress of durable subscriptions. [`MemoryBus`] is a client connection to it. Dropping a connection, or calling
//! [`MemoryBus::crash()`], stops delivery without acknowledging anything, so a new connection with the same client
//! id and durable name picks up exactly what was left unacknowledged.
//!
//! [`unsubscribe()`](MessageBus::unsubscribe) and [`close()`](MessageBus::close) are the orderly way out: no new
//! message is handed out, and they only return once every handler already running has finished. Those handlers
//! can still acknowledge their messages.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::AckHandle;
use super::Message;
use super::MessageBus;
use super::MessageHandler;
use super::MessageId;
use super::StartPosition;
use super::Subscription;
use super::SubscriptionOptions;
use crate::error::BusError;

type DurableKey = (String, String);

#[derive(Debug, Default)]
struct DurableState {
    subject: String,
    // Last sequence handed out to any session of this durable.
    cursor:  MessageId,
    unacked: BTreeSet<MessageId>,
    active:  bool,
}

#[derive(Default)]
struct ServerState {
    subjects:  HashMap<String, Vec<Vec<u8>>>,
    durables:  HashMap<DurableKey, DurableState>,
    listeners: HashMap<String, Vec<Weak<Notify>>>,
}

/// The streaming server.
#[derive(Default)]
pub struct BusServer {
    state:  Mutex<ServerState>,
    sub_id: AtomicU64,
}

impl BusServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect<S: ToString>(self: &Arc<Self>, client_id: S) -> MemoryBus {
        MemoryBus {
            server:        self.clone(),
            client_id:     client_id.to_string(),
            subscriptions: Mutex::new(HashMap::new()),
            closed:        AtomicBool::new(false),
        }
    }

    /// Number of messages ever published on the subject.
    pub fn message_count(&self, subject: &str) -> usize {
        self.state.lock().subjects.get(subject).map_or(0, |log| log.len())
    }

    /// Delivered but not yet acknowledged sequences of a durable subscription.
    pub fn durable_unacked(&self, client_id: &str, durable_name: &str) -> Option<Vec<MessageId>> {
        self.state
            .lock()
            .durables
            .get(&(client_id.to_string(), durable_name.to_string()))
            .map(|d| d.unacked.iter().copied().collect())
    }

    fn append(&self, subject: &str, payload: Vec<u8>) -> MessageId {
        let (seq, listeners) = {
            let mut state = self.state.lock();
            let log = state.subjects.entry(subject.to_string()).or_default();
            log.push(payload);
            let seq = log.len() as MessageId;

            let registered = state.listeners.entry(subject.to_string()).or_default();
            registered.retain(|l| l.strong_count() > 0);
            (seq, registered.iter().filter_map(Weak::upgrade).collect::<Vec<_>>())
        };

        for listener in listeners {
            listener.notify_one();
        }

        seq
    }

    fn message(&self, subject: &str, seq: MessageId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let log = state.subjects.get(subject)?;
        seq.checked_sub(1).and_then(|idx| log.get(idx as usize)).cloned()
    }

    fn last_seq(&self, subject: &str) -> MessageId {
        self.message_count(subject) as MessageId
    }

    fn listen(&self, subject: &str, notify: &Arc<Notify>) {
        self.state
            .lock()
            .listeners
            .entry(subject.to_string())
            .or_default()
            .push(Arc::downgrade(notify));
    }

    // Returns the starting cursor and the backlog to redeliver.
    fn attach_durable(
        &self,
        key: &DurableKey,
        subject: &str,
        start: StartPosition,
    ) -> Result<(MessageId, Vec<MessageId>), BusError> {
        let mut state = self.state.lock();
        let last_seq = state.subjects.get(subject).map_or(0, |log| log.len() as MessageId);

        let durable = state.durables.entry(key.clone()).or_insert_with(|| DurableState {
            subject: subject.to_string(),
            cursor: match start {
                StartPosition::NewOnly => last_seq,
                StartPosition::AllAvailable => 0,
            },
            ..Default::default()
        });

        if durable.active {
            return Err(BusError::DurableInUse(key.1.clone()));
        }
        if durable.subject != subject {
            return Err(BusError::Subscribe {
                subject: subject.to_string(),
                reason:  format!("durable '{}' is bound to subject '{}'", key.1, durable.subject),
            });
        }

        durable.active = true;
        Ok((durable.cursor, durable.unacked.iter().copied().collect()))
    }

    fn detach_durable(&self, key: &DurableKey) {
        if let Some(durable) = self.state.lock().durables.get_mut(key) {
            durable.active = false;
        }
    }

    fn durable_delivered(&self, key: &DurableKey, seq: MessageId) {
        if let Some(durable) = self.state.lock().durables.get_mut(key) {
            durable.cursor = durable.cursor.max(seq);
            durable.unacked.insert(seq);
        }
    }

    fn durable_acked(&self, key: &DurableKey, seq: MessageId) {
        if let Some(durable) = self.state.lock().durables.get_mut(key) {
            durable.unacked.remove(&seq);
        }
    }
}

struct InFlight {
    deadline: Instant,
    _permit:  OwnedSemaphorePermit,
}

#[derive(Default)]
struct SubInner {
    cursor:    MessageId,
    backlog:   VecDeque<MessageId>,
    in_flight: BTreeMap<MessageId, InFlight>,
    // Nothing new is handed out, acknowledgments are still taken.
    draining:  bool,
    closed:    bool,
}

// Lock order: a subscription's inner lock may be held while taking the server lock, never the other way around.
struct SubState {
    id:        u64,
    subject:   String,
    durable:   Option<DurableKey>,
    ack_wait:  Duration,
    server:    Arc<BusServer>,
    notify:    Arc<Notify>,
    semaphore: Arc<Semaphore>,
    inner:     Mutex<SubInner>,
    handlers:  Mutex<JoinSet<()>>,
}

impl SubState {
    fn ack(&self, seq: MessageId) -> Result<(), BusError> {
        let released = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BusError::SubscriptionGone(seq));
            }
            inner.in_flight.remove(&seq).ok_or(BusError::NotInFlight(seq))?
        };

        if let Some(key) = &self.durable {
            self.server.durable_acked(key, seq);
        }
        drop(released);
        self.notify.notify_one();
        trace!(subscription = self.id, "message #{seq} acknowledged");

        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.in_flight.clear();
        inner.backlog.clear();
    }

    fn detach(&self) {
        if let Some(key) = &self.durable {
            self.server.detach_durable(key);
        }
    }

    fn reap_handlers(&self) {
        let mut handlers = self.handlers.lock();
        while let Some(res) = handlers.try_join_next() {
            self.report_handler(res);
        }
    }

    fn report_handler(&self, res: Result<(), tokio::task::JoinError>) {
        if let Err(err) = res {
            if err.is_panic() {
                warn!(subscription = self.id, "message handler panicked: {err}");
            }
        }
    }

    // Hand out what is due. Returns the earliest ack deadline, if anything is in flight.
    fn pump(self: &Arc<Self>, handler: &Arc<dyn MessageHandler>) -> Option<Instant> {
        let now = Instant::now();
        let mut due = Vec::new();

        let next_deadline = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.draining {
                return None;
            }

            for (seq, flight) in inner.in_flight.iter_mut() {
                if flight.deadline <= now {
                    flight.deadline = now + self.ack_wait;
                    due.push((*seq, true));
                }
            }

            while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                let (seq, redelivered) = if let Some(seq) = inner.backlog.pop_front() {
                    (seq, true)
                }
                else if inner.cursor < self.server.last_seq(&self.subject) {
                    inner.cursor += 1;
                    (inner.cursor, false)
                }
                else {
                    break;
                };

                inner.in_flight.insert(
                    seq,
                    InFlight {
                        deadline: now + self.ack_wait,
                        _permit:  permit,
                    },
                );
                if let Some(key) = &self.durable {
                    self.server.durable_delivered(key, seq);
                }
                due.push((seq, redelivered));
            }

            inner.in_flight.values().map(|f| f.deadline).min()
        };

        self.reap_handlers();

        let acker: Arc<dyn AckHandle> = Arc::new(AckRef(Arc::downgrade(self)));
        let mut handlers = self.handlers.lock();
        for (seq, redelivered) in due {
            let Some(data) = self.server.message(&self.subject, seq)
            else {
                warn!(subscription = self.id, "message #{seq} vanished from '{}'", self.subject);
                continue;
            };
            if redelivered {
                debug!(subscription = self.id, "redelivering message #{seq}");
            }

            let message = Message::new(self.subject.clone(), seq, data, redelivered, acker.clone());
            let handler = handler.clone();
            handlers.spawn(async move { handler.handle(message).await });
        }

        next_deadline
    }

    async fn run(self: Arc<Self>, handler: Arc<dyn MessageHandler>) {
        loop {
            match self.pump(&handler) {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }

            if self.inner.lock().closed {
                break;
            }
        }
        trace!(subscription = self.id, "delivery loop finished");
    }
}

struct AckRef(Weak<SubState>);

impl AckHandle for AckRef {
    fn ack(&self, sequence: MessageId) -> Result<(), BusError> {
        self.0
            .upgrade()
            .ok_or(BusError::SubscriptionGone(sequence))?
            .ack(sequence)
    }
}

struct ActiveSubscription {
    state: Arc<SubState>,
    task:  JoinHandle<()>,
}

impl ActiveSubscription {
    // Stop handing out messages and wait for the handlers already running.
    async fn shutdown(self) {
        let Self { state, task } = self;

        state.inner.lock().draining = true;
        task.abort();
        let _ = task.await;

        let mut handlers = std::mem::take(&mut *state.handlers.lock());
        let pending = handlers.len();
        if pending > 0 {
            debug!(subscription = state.id, "waiting for {pending} message handler(s)");
        }
        while let Some(res) = handlers.join_next().await {
            state.report_handler(res);
        }

        state.close();
        state.detach();
    }

    // Connection loss: running handlers are cancelled and their acknowledgments are refused.
    fn abort(self) {
        self.state.close();
        self.task.abort();
        self.state.handlers.lock().abort_all();
        self.state.detach();
    }
}

/// A client connection to a [`BusServer`].
pub struct MemoryBus {
    server:        Arc<BusServer>,
    client_id:     String,
    subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
    closed:        AtomicBool,
}

impl MemoryBus {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server(&self) -> &Arc<BusServer> {
        &self.server
    }

    /// Messages of the subscription currently awaiting acknowledgment.
    pub fn in_flight(&self, subscription: &Subscription) -> usize {
        self.subscriptions
            .lock()
            .get(&subscription.id)
            .map_or(0, |s| s.state.inner.lock().in_flight.len())
    }

    /// Lose the connection abruptly, as a crashing process would.
    pub fn crash(self) {
        warn!("Connection '{}' lost", self.client_id);
    }

    fn check_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed(self.client_id.clone()))
        }
        else {
            Ok(())
        }
    }

    fn take_all(&self) -> HashMap<u64, ActiveSubscription> {
        std::mem::take(&mut *self.subscriptions.lock())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    #[instrument(level = "trace", skip(self, handler))]
    async fn subscribe(
        &self,
        options: SubscriptionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        self.check_open()?;

        let subject = options.subject();

        if options.max_in_flight() == 0 {
            return Err(BusError::Subscribe {
                subject: subject.clone(),
                reason:  "max in flight must be positive".to_string(),
            });
        }
        if options.ack_wait().is_zero() {
            return Err(BusError::Subscribe {
                subject: subject.clone(),
                reason:  "ack wait must be positive".to_string(),
            });
        }

        let durable = options
            .durable_name()
            .map(|name| (self.client_id.clone(), name.clone()));

        let (cursor, backlog) = match &durable {
            Some(key) => self.server.attach_durable(key, subject, options.start())?,
            None => (
                match options.start() {
                    StartPosition::NewOnly => self.server.last_seq(subject),
                    StartPosition::AllAvailable => 0,
                },
                vec![],
            ),
        };

        let id = self.server.sub_id.fetch_add(1, Ordering::Relaxed) + 1;
        let notify = Arc::new(Notify::new());
        self.server.listen(subject, &notify);

        debug!(
            "Subscribed #{id} to '{subject}' for '{}': cursor={cursor}, backlog={}",
            self.client_id,
            backlog.len()
        );

        let state = Arc::new(SubState {
            id,
            subject: subject.clone(),
            durable,
            ack_wait: options.ack_wait(),
            server: self.server.clone(),
            notify,
            semaphore: Arc::new(Semaphore::new(options.max_in_flight())),
            inner: Mutex::new(SubInner {
                cursor,
                backlog: backlog.into(),
                ..Default::default()
            }),
            handlers: Mutex::new(JoinSet::new()),
        });

        let task = tokio::spawn(state.clone().run(handler));
        self.subscriptions.lock().insert(id, ActiveSubscription { state, task });

        Ok(Subscription {
            id,
            subject: subject.clone(),
            durable_name: options.durable_name().cloned(),
        })
    }

    #[instrument(level = "trace", skip(self))]
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError> {
        let active = self
            .subscriptions
            .lock()
            .remove(&subscription.id)
            .ok_or(BusError::UnknownSubscription(subscription.id))?;
        active.shutdown().await;
        debug!("Unsubscribed #{} from '{}'", subscription.id, subscription.subject);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<MessageId, BusError> {
        self.check_open()?;
        let seq = self.server.append(subject, payload);
        trace!("published #{seq} on '{subject}'");
        Ok(seq)
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for (_, subscription) in self.take_all() {
                subscription.shutdown().await;
            }
            debug!("Connection '{}' closed", self.client_id);
        }
        Ok(())
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        for (_, subscription) in self.take_all() {
            subscription.abort();
        }
    }
}
