//! Router loop
//!
//! The loop owns the queue and the performance ledger. Each tick it pulls
//! newly submitted messages off its inbox, then processes up to
//! `max_messages_per_tick` ready entries:
//!
//! ```text
//! queued -> routing -> attempting -> delivered | stored | requeued | dropped
//! ```
//!
//! A requeued entry goes back into the queue and is routed again once its
//! backoff delay has elapsed. Every state change is written to the shared
//! outcome map and terminal states are published as [`DeliveryReport`]s.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use hoppmesh_protocol::{Message, MessageId, NodeId, Route};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::decision::{DecisionEngine, RetryStrategy};
use crate::error::{Result, RoutingError};
use crate::ledger::PerformanceLedger;
use crate::path_finder::build_route;
use crate::queue::{MessageQueue, QueuedMessage};
use crate::topology::{TopologyGraph, TopologyStore};
use crate::transport::{bounded, Collaborators};

/// Buffered delivery reports per subscriber
pub const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Where a message is in its routing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Queued,
    Routing,
    Attempting,
    Delivered,
    Stored,
    Requeued,
    Dropped,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Delivered | MessageState::Stored | MessageState::Dropped
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageState::Queued => "queued",
            MessageState::Routing => "routing",
            MessageState::Attempting => "attempting",
            MessageState::Delivered => "delivered",
            MessageState::Stored => "stored",
            MessageState::Requeued => "requeued",
            MessageState::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// Latest known state of one message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageOutcome {
    pub state: MessageState,
    pub reason: String,
    /// Delivery attempts made in the current routing pass
    pub attempts: usize,
    pub updated_at: DateTime<Utc>,
}

/// Published once a message reaches a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    pub state: MessageState,
    pub reason: String,
    pub attempts: usize,
    /// Path that accepted the message, when delivered
    pub path: Option<Vec<NodeId>>,
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub messages_delivered: u64,
    pub messages_stored: u64,
    pub messages_dropped: u64,
    pub messages_requeued: u64,
    pub delivery_attempts: u64,
    pub broadcasts: u64,
    pub released_from_store: u64,
}

/// The parts of a router other tasks may touch
#[derive(Clone)]
pub struct RouterShared {
    inbox: mpsc::UnboundedSender<Message>,
    outcomes: Arc<DashMap<MessageId, MessageOutcome>>,
    reports: broadcast::Sender<DeliveryReport>,
    pending: Arc<AtomicUsize>,
    stats: Arc<RwLock<RouterStats>>,
}

impl RouterShared {
    /// Hand a message to the loop; never blocks
    ///
    /// Once the loop has stopped the message is reported as dropped instead.
    pub fn submit(&self, message: Message) -> MessageId {
        let id = message.id;
        record_outcome(&self.outcomes, id, MessageState::Queued, "accepted", 0);
        self.pending.fetch_add(1, Ordering::SeqCst);

        if self.inbox.send(message).is_err() {
            warn!("Message {} submitted after router shutdown", id);
            release_pending(&self.pending);
            record_outcome(
                &self.outcomes,
                id,
                MessageState::Dropped,
                &RoutingError::Shutdown.to_string(),
                0,
            );
        }
        id
    }

    pub fn outcome(&self, id: &MessageId) -> Option<MessageOutcome> {
        self.outcomes.get(id).map(|entry| entry.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    /// Messages accepted and not yet in a terminal state
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }
}

fn record_outcome(
    outcomes: &DashMap<MessageId, MessageOutcome>,
    id: MessageId,
    state: MessageState,
    reason: &str,
    attempts: usize,
) {
    outcomes.insert(
        id,
        MessageOutcome {
            state,
            reason: reason.to_string(),
            attempts,
            updated_at: Utc::now(),
        },
    );
}

fn release_pending(pending: &AtomicUsize) {
    let _ = pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// Message router for one local node
pub struct Router {
    local_id: NodeId,
    config: RouterConfig,
    engine: DecisionEngine,
    topology: Arc<TopologyStore>,
    collaborators: Collaborators,
    ledger: PerformanceLedger,
    queue: MessageQueue,
    inbox: mpsc::UnboundedReceiver<Message>,
    released_tx: mpsc::UnboundedSender<Result<Vec<Message>>>,
    released_rx: mpsc::UnboundedReceiver<Result<Vec<Message>>>,
    shared: RouterShared,
    known_gateways: usize,
}

impl Router {
    pub fn new(
        local_id: NodeId,
        config: RouterConfig,
        topology: Arc<TopologyStore>,
        collaborators: Collaborators,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let (released_tx, released_rx) = mpsc::unbounded_channel();

        Router {
            engine: DecisionEngine::new().with_max_alternatives(config.max_alternatives),
            ledger: PerformanceLedger::new(config.ledger_capacity),
            local_id,
            config,
            topology,
            collaborators,
            queue: MessageQueue::new(),
            inbox,
            released_tx,
            released_rx,
            shared: RouterShared {
                inbox: inbox_tx,
                outcomes: Arc::new(DashMap::new()),
                reports,
                pending: Arc::new(AtomicUsize::new(0)),
                stats: Arc::new(RwLock::new(RouterStats::default())),
            },
            known_gateways: 0,
        }
    }

    /// Replace the decision engine (e.g. a different scoring model)
    pub fn with_engine(mut self, engine: DecisionEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Start from previously learned path history
    pub fn with_ledger(mut self, ledger: PerformanceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn shared(&self) -> RouterShared {
        self.shared.clone()
    }

    pub fn ledger(&self) -> &PerformanceLedger {
        &self.ledger
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drive the loop until `shutdown` fires, then hand back the ledger
    ///
    /// Messages still queued at shutdown are handed to the message store.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> PerformanceLedger {
        let mut gateways: watch::Receiver<usize> = self.topology.subscribe_gateways();
        let initial = *gateways.borrow_and_update();
        self.on_gateways_changed(initial).await;

        let mut ticker = interval(self.config.process_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Router loop shutting down");
                    break;
                }
                Ok(()) = gateways.changed() => {
                    let count = *gateways.borrow_and_update();
                    self.on_gateways_changed(count).await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.persist_pending().await;
        self.ledger
    }

    /// One loop iteration; returns how many messages were processed
    pub async fn tick(&mut self) -> usize {
        self.drain_released().await;
        self.drain_inbox();
        self.prune_outcomes();

        let mut processed = 0;
        while processed < self.config.max_messages_per_tick {
            match self.queue.pop_ready(Instant::now()) {
                Some(entry) => self.process(entry).await,
                None => break,
            }
            processed += 1;
        }

        if processed > 0 {
            debug!(
                "Router tick processed {} messages, {} still queued",
                processed,
                self.queue.len()
            );
        }
        processed
    }

    /// React to a new gateway count; stored messages are released when the
    /// mesh goes from no gateway to at least one
    pub async fn on_gateways_changed(&mut self, count: usize) {
        let previous = std::mem::replace(&mut self.known_gateways, count);
        if previous > 0 || count == 0 {
            return;
        }

        info!("{} gateway(s) reachable, releasing stored messages", count);
        let store = Arc::clone(&self.collaborators.store);
        let released = self.released_tx.clone();
        // take_stored empties the store, so it runs to completion on its own
        // task; a late result is picked up on a later tick
        tokio::spawn(async move {
            let result = store.take_stored().await;
            if let Err(mpsc::error::SendError(Ok(messages))) = released.send(result) {
                for message in messages {
                    if let Err(e) = store.store(&message).await {
                        warn!("Lost released message {}: {}", message.id, e);
                    }
                }
            }
        });

        let limit = self.config.store_timeout();
        match timeout(limit, self.released_rx.recv()).await {
            Ok(Some(result)) => self.readmit_released(result).await,
            Ok(None) => {}
            Err(_) => warn!(
                "Stored messages not released within {}ms, requeueing them once the store answers",
                limit.as_millis()
            ),
        }
    }

    async fn readmit_released(&mut self, result: Result<Vec<Message>>) {
        match result {
            Ok(messages) => {
                let released = messages.len();
                for message in messages {
                    self.readmit(message);
                }
                self.shared.stats.write().await.released_from_store += released as u64;
                if released > 0 {
                    info!("Requeued {} stored messages", released);
                }
            }
            Err(e) => warn!("Failed to release stored messages: {}", e),
        }
    }

    async fn drain_released(&mut self) {
        while let Ok(result) = self.released_rx.try_recv() {
            self.readmit_released(result).await;
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.queue.push(message);
        }
    }

    fn readmit(&mut self, message: Message) {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.transition(message.id, MessageState::Queued, "released from store", 0);
        self.queue.push(message);
    }

    fn prune_outcomes(&self) {
        let Some(cutoff) = chrono::Duration::from_std(self.config.outcome_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return;
        };
        self.shared
            .outcomes
            .retain(|_, outcome| !outcome.state.is_terminal() || outcome.updated_at > cutoff);
    }

    async fn process(&mut self, entry: QueuedMessage) {
        let mut entry = entry;
        let id = entry.message.id;

        if entry.message.is_expired() {
            self.expire(&entry.message, 0).await;
            return;
        }

        self.transition(id, MessageState::Routing, "routing", 0);
        let graph = self.topology.snapshot().await;

        let decision = match self
            .engine
            .decide(&self.local_id, &entry.message, &graph, &self.ledger)
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Routing decision for {} failed: {}", id, e);
                self.finish(&entry.message, MessageState::Dropped, e.to_string(), 0, None)
                    .await;
                return;
            }
        };
        self.shared.stats.write().await.messages_routed += 1;

        info!(
            "Routing {} via {} (confidence {:.2}, {} alternatives, on failure {}): {}",
            id,
            decision.selected_route.path_key(),
            decision.confidence,
            decision.alternative_routes.len(),
            decision.retry_strategy,
            decision.reasoning
        );

        if decision.should_store {
            let reason = if decision.selected_route.is_local() {
                RoutingError::NoRouteFound.to_string()
            } else {
                format!("held by decision: {}", decision.reasoning)
            };
            self.hold(entry, reason, 0).await;
            return;
        }

        let mut attempts = 0;
        for route in decision.routes() {
            if route.is_local() {
                continue;
            }
            if route.hop_count() > entry.message.ttl as usize {
                debug!(
                    "Skipping {} for {}: {} hops exceed TTL {}",
                    route.path_key(),
                    id,
                    route.hop_count(),
                    entry.message.ttl
                );
                continue;
            }
            if entry.message.consume_hop().is_err() {
                break;
            }

            attempts += 1;
            let key = route.path_key();
            self.transition(id, MessageState::Attempting, &format!("attempting {}", key), attempts);

            let started = Instant::now();
            let result = self.attempt(route, &entry.message, &graph).await;
            self.ledger.record(&key, result.is_ok(), started.elapsed());
            self.shared.stats.write().await.delivery_attempts += 1;

            match result {
                Ok(()) => {
                    if let Some(next) = route.path().get(1) {
                        entry.message.record_traversal(next.clone());
                    }
                    self.finish(
                        &entry.message,
                        MessageState::Delivered,
                        format!("delivered via {}", key),
                        attempts,
                        Some(route.path().to_vec()),
                    )
                    .await;
                    return;
                }
                Err(e) => debug!("Message {}: {}", id, e),
            }

            if entry.message.is_expired() {
                break;
            }
        }

        if entry.message.is_expired() {
            self.expire(&entry.message, attempts).await;
            return;
        }

        debug!("Message {}: {}", id, RoutingError::AllRoutesExhausted { attempts });

        let strategy = match decision.retry_strategy {
            RetryStrategy::Immediate if entry.immediate_retry => RetryStrategy::Backoff,
            strategy => strategy,
        };

        match strategy {
            RetryStrategy::Broadcast => self.broadcast(entry, &graph, attempts).await,
            RetryStrategy::WaitForGateway => {
                self.hold(entry, "waiting for a gateway".to_string(), attempts)
                    .await
            }
            RetryStrategy::Immediate => {
                entry.message.retry_count += 1;
                self.requeue(entry, Duration::ZERO, true, attempts).await;
            }
            RetryStrategy::Backoff => self.backoff(entry, attempts).await,
        }
    }

    /// One delivery attempt, including the gateway hand-off when the
    /// message is bound for the internet
    async fn attempt(&self, route: &Route, message: &Message, graph: &TopologyGraph) -> Result<()> {
        let path = route.path_key();

        bounded(
            self.config.attempt_timeout(),
            self.collaborators.transport.send(route, message),
        )
        .await
        .map_err(|e| RoutingError::AttemptFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let gateway = route.target();
        let at_gateway = graph.node(gateway).map_or(false, |n| n.has_internet_access);
        if message.needs_gateway() && at_gateway {
            bounded(
                self.config.forward_timeout(),
                self.collaborators.forwarder.forward(gateway, message),
            )
            .await
            .map_err(|e| {
                let unavailable = RoutingError::GatewayUnavailable {
                    gateway: gateway.clone(),
                    reason: e.to_string(),
                };
                RoutingError::AttemptFailed {
                    path,
                    reason: unavailable.to_string(),
                }
            })?;
        }

        Ok(())
    }

    /// Offer the message to every direct neighbor at once
    ///
    /// Each offer is a full attempt, so a gateway neighbor also hands an
    /// internet-bound message off to the forwarder.
    async fn broadcast(&mut self, entry: QueuedMessage, graph: &TopologyGraph, attempts: usize) {
        let mut entry = entry;
        let routes: Vec<Route> = graph
            .neighbors(&self.local_id)
            .into_iter()
            .filter_map(|neighbor| build_route(vec![self.local_id.clone(), neighbor], graph).ok())
            .collect();

        if routes.is_empty() {
            self.finish(
                &entry.message,
                MessageState::Dropped,
                "broadcast found no neighbors".to_string(),
                attempts,
                None,
            )
            .await;
            return;
        }

        if entry.message.consume_hop().is_err() {
            self.expire(&entry.message, attempts).await;
            return;
        }

        let router = &*self;
        let message = &entry.message;
        let results = join_all(routes.iter().map(|route| async move {
            let started = Instant::now();
            let result = router.attempt(route, message, graph).await;
            (result, started.elapsed())
        }))
        .await;

        let mut accepted: Option<&Route> = None;
        let mut accepted_count = 0;
        for (route, (result, latency)) in routes.iter().zip(results) {
            self.ledger.record(&route.path_key(), result.is_ok(), latency);
            if result.is_ok() {
                accepted_count += 1;
                accepted.get_or_insert(route);
            }
        }

        {
            let mut stats = self.shared.stats.write().await;
            stats.broadcasts += 1;
            stats.delivery_attempts += routes.len() as u64;
        }

        let attempts = attempts + routes.len();
        match accepted {
            Some(route) => {
                self.finish(
                    &entry.message,
                    MessageState::Delivered,
                    format!("broadcast accepted by {} of {} neighbors", accepted_count, routes.len()),
                    attempts,
                    Some(route.path().to_vec()),
                )
                .await
            }
            None => {
                self.finish(
                    &entry.message,
                    MessageState::Dropped,
                    format!("broadcast to {} neighbors failed", routes.len()),
                    attempts,
                    None,
                )
                .await
            }
        }
    }

    async fn backoff(&mut self, entry: QueuedMessage, attempts: usize) {
        let mut entry = entry;
        entry.message.retry_count += 1;

        if entry.message.retry_count > self.config.max_retries {
            let reason = format!("retry limit of {} reached", self.config.max_retries);
            self.hold(entry, reason, attempts).await;
            return;
        }

        let delay = self.config.backoff_delay(entry.message.retry_count);
        self.requeue(entry, delay, false, attempts).await;
    }

    async fn requeue(&mut self, entry: QueuedMessage, delay: Duration, immediate: bool, attempts: usize) {
        let mut entry = entry;
        entry.eligible_at = Instant::now() + delay;
        entry.immediate_retry = immediate;

        let reason = format!(
            "retry {} in {}ms",
            entry.message.retry_count,
            delay.as_millis()
        );
        self.transition(entry.message.id, MessageState::Requeued, &reason, attempts);
        debug!("Requeued {}: {}", entry.message.id, reason);

        self.shared.stats.write().await.messages_requeued += 1;
        self.queue.push_entry(entry);
    }

    /// Hand the message to the store; if the store refuses, fall back to a
    /// backoff retry until the retry budget runs out
    async fn hold(&mut self, entry: QueuedMessage, reason: String, attempts: usize) {
        let mut entry = entry;
        let stored = bounded(
            self.config.store_timeout(),
            self.collaborators.store.store(&entry.message),
        )
        .await;

        match stored {
            Ok(()) => {
                self.finish(&entry.message, MessageState::Stored, reason, attempts, None)
                    .await
            }
            Err(e) => {
                warn!("Failed to store message {}: {}", entry.message.id, e);
                if entry.message.retry_count >= self.config.max_retries {
                    let reason = RoutingError::Storage(e.to_string()).to_string();
                    self.finish(&entry.message, MessageState::Dropped, reason, attempts, None)
                        .await;
                } else {
                    entry.message.retry_count += 1;
                    let delay = self.config.backoff_delay(entry.message.retry_count);
                    self.requeue(entry, delay, false, attempts).await;
                }
            }
        }
    }

    async fn persist_pending(&mut self) {
        self.drain_released().await;
        self.drain_inbox();
        let entries = self.queue.drain();
        if entries.is_empty() {
            return;
        }

        info!("Storing {} queued messages before shutdown", entries.len());
        for entry in entries {
            let stored = bounded(
                self.config.store_timeout(),
                self.collaborators.store.store(&entry.message),
            )
            .await;
            let (state, reason) = match stored {
                Ok(()) => (MessageState::Stored, "router shut down".to_string()),
                Err(e) => (
                    MessageState::Dropped,
                    RoutingError::Storage(e.to_string()).to_string(),
                ),
            };
            self.finish(&entry.message, state, reason, 0, None).await;
        }
    }

    async fn expire(&self, message: &Message, attempts: usize) {
        let reason = RoutingError::TtlExpired.to_string();
        self.finish(message, MessageState::Dropped, reason, attempts, None)
            .await;
    }

    fn transition(&self, id: MessageId, state: MessageState, reason: &str, attempts: usize) {
        record_outcome(&self.shared.outcomes, id, state, reason, attempts);
    }

    async fn finish(
        &self,
        message: &Message,
        state: MessageState,
        reason: String,
        attempts: usize,
        path: Option<Vec<NodeId>>,
    ) {
        let id = message.id;
        self.transition(id, state, &reason, attempts);
        release_pending(&self.shared.pending);

        {
            let mut stats = self.shared.stats.write().await;
            match state {
                MessageState::Delivered => stats.messages_delivered += 1,
                MessageState::Stored => stats.messages_stored += 1,
                MessageState::Dropped => stats.messages_dropped += 1,
                _ => {}
            }
        }

        match state {
            MessageState::Dropped => warn!("Message {} dropped: {}", id, reason),
            _ => info!("Message {} {}: {}", id, state, reason),
        }

        let _ = self.shared.reports.send(DeliveryReport {
            message_id: id,
            state,
            reason,
            attempts,
            path,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InternetForwarder, MemoryMessageStore, MessageStore, Transport};
    use async_trait::async_trait;
    use hoppmesh_protocol::{Edge, Node, Priority, Recipient, TransportKind};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    /// Accepts routes whose key is listed, records every attempt
    #[derive(Default)]
    struct ScriptedTransport {
        accept: HashSet<String>,
        /// Sends refused regardless of route before the script applies
        refuse_first: usize,
        sent: Mutex<Vec<String>>,
        ttls: Mutex<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn accepting(keys: &[&str]) -> Self {
            ScriptedTransport {
                accept: keys.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, route: &Route, message: &Message) -> Result<()> {
            let key = route.path_key();
            let count = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(key.clone());
                sent.len()
            };
            self.ttls.lock().unwrap().push(message.ttl);
            if count > self.refuse_first && self.accept.contains(&key) {
                Ok(())
            } else {
                Err(RoutingError::AttemptFailed {
                    path: key,
                    reason: "no ack".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingForwarder {
        fail: bool,
        forwarded: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl InternetForwarder for RecordingForwarder {
        async fn forward(&self, gateway: &NodeId, _message: &Message) -> Result<()> {
            self.forwarded.lock().unwrap().push(gateway.clone());
            if self.fail {
                Err(RoutingError::GatewayUnavailable {
                    gateway: gateway.clone(),
                    reason: "uplink down".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        router: Router,
        transport: Arc<ScriptedTransport>,
        forwarder: Arc<RecordingForwarder>,
        store: Arc<MemoryMessageStore>,
        topology: Arc<TopologyStore>,
    }

    /// Local node `A` with full trust, so a route's reliability is decided by
    /// the nodes added on top
    async fn harness(transport: ScriptedTransport, forwarder: RecordingForwarder) -> Harness {
        let topology = Arc::new(TopologyStore::new());
        topology
            .upsert_node(Node::new(id("A"), "local").with_trust(1.0))
            .await
            .unwrap();

        let transport = Arc::new(transport);
        let forwarder = Arc::new(forwarder);
        let store = Arc::new(MemoryMessageStore::new());
        let collaborators = Collaborators {
            transport: transport.clone(),
            forwarder: forwarder.clone(),
            store: store.clone(),
        };

        let router = Router::new(id("A"), RouterConfig::default(), topology.clone(), collaborators);
        Harness {
            router,
            transport,
            forwarder,
            store,
            topology,
        }
    }

    async fn add_node(topology: &TopologyStore, name: &str, internet: bool, trust: f64) {
        topology
            .upsert_node(Node::new(id(name), name).with_internet(internet).with_trust(trust))
            .await
            .unwrap();
    }

    async fn link(topology: &TopologyStore, a: &str, b: &str) {
        topology
            .upsert_link(Edge::new(id(a), id(b), 0.9, 100.0, TransportKind::WifiDirect))
            .await
            .unwrap();
    }

    fn text(recipient: Recipient, priority: Priority, internet: bool) -> Message {
        Message::new(id("A"), recipient, "hello", priority, internet)
    }

    #[tokio::test]
    async fn test_delivery_to_gateway_forwards_and_records() {
        let transport = ScriptedTransport::accepting(&["A-G"]);
        let mut h = harness(transport, RecordingForwarder::default()).await;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "G").await;

        let shared = h.router.shared();
        let mut reports = shared.subscribe();
        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Normal, true));
        assert_eq!(shared.pending(), 1);

        assert_eq!(h.router.tick().await, 1);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.message_id, msg_id);
        assert_eq!(report.state, MessageState::Delivered);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.path, Some(vec![id("A"), id("G")]));
        assert_eq!(*h.forwarder.forwarded.lock().unwrap(), vec![id("G")]);
        assert_eq!(h.router.ledger().get("A-G").unwrap().successes, 1);
        assert_eq!(shared.outcome(&msg_id).unwrap().state, MessageState::Delivered);
        assert_eq!(shared.pending(), 0);
    }

    #[tokio::test]
    async fn test_isolated_node_stores_message() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        let shared = h.router.shared();

        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Normal, true));
        h.router.tick().await;

        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Stored);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(h.store.len().await, 1);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_one_dropped_after_first_failure() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        add_node(&h.topology, "B", false, 1.0).await;
        link(&h.topology, "A", "B").await;

        let shared = h.router.shared();
        let msg = text(Recipient::Node(id("B")), Priority::Normal, false).with_ttl(1);
        let msg_id = shared.submit(msg);
        h.router.tick().await;

        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Dropped);
        assert_eq!(outcome.reason, RoutingError::TtlExpired.to_string());
        assert_eq!(h.transport.sent(), vec!["A-B"]);
        assert_eq!(h.router.ledger().get("A-B").unwrap().attempts, 1);
        assert_eq!(h.router.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_counts_as_failed_attempt() {
        let forwarder = RecordingForwarder {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(ScriptedTransport::accepting(&["A-G"]), forwarder).await;
        h.router.config.max_messages_per_tick = 1;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "G").await;

        let shared = h.router.shared();
        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Normal, true));
        h.router.tick().await;

        let stats = h.router.ledger().get("A-G").unwrap();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 0);

        // reliable internet path: the first retry is immediate
        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Requeued);
        assert_eq!(outcome.reason, "retry 1 in 0ms");
        assert_eq!(h.router.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_retry_only_once_in_a_row() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "G").await;

        let shared = h.router.shared();
        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Normal, true));

        // the immediate requeue is picked up again in the same tick and its
        // failure falls back to backoff
        h.router.tick().await;
        assert_eq!(h.transport.sent(), vec!["A-G", "A-G"]);
        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Requeued);
        assert_eq!(outcome.reason, "retry 2 in 4000ms");

        h.router.tick().await;
        assert_eq!(h.transport.sent().len(), 2);

        tokio::time::advance(Duration::from_secs(4)).await;
        h.router.tick().await;
        assert_eq!(h.transport.sent().len(), 4);
        assert_eq!(shared.outcome(&msg_id).unwrap().reason, "retry 4 in 16000ms");
    }

    #[tokio::test]
    async fn test_emergency_broadcast_reaches_neighbors() {
        let transport = ScriptedTransport::accepting(&["A-C"]);
        let mut h = harness(transport, RecordingForwarder::default()).await;
        add_node(&h.topology, "B", false, 1.0).await;
        add_node(&h.topology, "C", false, 0.5).await;
        link(&h.topology, "A", "B").await;
        link(&h.topology, "A", "C").await;

        let shared = h.router.shared();
        let mut reports = shared.subscribe();
        shared.submit(text(Recipient::Node(id("B")), Priority::Emergency, false));
        h.router.tick().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.state, MessageState::Delivered);
        assert_eq!(report.path, Some(vec![id("A"), id("C")]));
        assert_eq!(report.attempts, 3);
        assert_eq!(h.transport.sent()[0], "A-B");
        assert_eq!(shared.stats().await.broadcasts, 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_gateway_neighbor_forwards() {
        let transport = ScriptedTransport {
            refuse_first: 1,
            ..ScriptedTransport::accepting(&["A-G"])
        };
        let mut h = harness(transport, RecordingForwarder::default()).await;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "G").await;

        let shared = h.router.shared();
        let mut reports = shared.subscribe();
        shared.submit(text(Recipient::Broadcast, Priority::Emergency, true));
        h.router.tick().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.state, MessageState::Delivered);
        assert_eq!(report.path, Some(vec![id("A"), id("G")]));
        assert_eq!(h.transport.sent(), vec!["A-G", "A-G"]);
        assert_eq!(*h.forwarder.forwarded.lock().unwrap(), vec![id("G")]);
        assert_eq!(shared.stats().await.broadcasts, 1);

        let stats = h.router.ledger().get("A-G").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn test_broadcast_gateway_refusal_is_a_failed_attempt() {
        let forwarder = RecordingForwarder {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(ScriptedTransport::accepting(&["A-G"]), forwarder).await;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "G").await;

        let shared = h.router.shared();
        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Emergency, true));
        h.router.tick().await;

        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Dropped);
        assert_eq!(outcome.reason, "broadcast to 1 neighbors failed");
        assert_eq!(h.forwarder.forwarded.lock().unwrap().len(), 2);

        let stats = h.router.ledger().get("A-G").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test]
    async fn test_multi_hop_delivery_spends_one_hop() {
        let transport = ScriptedTransport::accepting(&["A-B-G"]);
        let mut h = harness(transport, RecordingForwarder::default()).await;
        add_node(&h.topology, "B", false, 1.0).await;
        add_node(&h.topology, "G", true, 1.0).await;
        link(&h.topology, "A", "B").await;
        link(&h.topology, "B", "G").await;

        let shared = h.router.shared();
        let mut reports = shared.subscribe();
        shared.submit(text(Recipient::Broadcast, Priority::Normal, true).with_ttl(5));
        h.router.tick().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.state, MessageState::Delivered);
        assert_eq!(report.path, Some(vec![id("A"), id("B"), id("G")]));
        assert_eq!(*h.transport.ttls.lock().unwrap(), vec![4]);
    }

    /// Empties its buffer, then takes a while to answer
    struct SlowStore {
        inner: MemoryMessageStore,
        delay: Duration,
    }

    #[async_trait]
    impl MessageStore for SlowStore {
        async fn store(&self, message: &Message) -> Result<()> {
            self.inner.store(message).await
        }

        async fn take_stored(&self) -> Result<Vec<Message>> {
            let taken = self.inner.take_stored().await?;
            tokio::time::sleep(self.delay).await;
            Ok(taken)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_release_requeued_on_later_tick() {
        let store = Arc::new(SlowStore {
            inner: MemoryMessageStore::new(),
            delay: Duration::from_secs(3),
        });
        let held = text(Recipient::Broadcast, Priority::Normal, true);
        store.store(&held).await.unwrap();

        let topology = Arc::new(TopologyStore::new());
        topology
            .upsert_node(Node::new(id("A"), "local").with_trust(1.0))
            .await
            .unwrap();
        let collaborators = Collaborators {
            transport: Arc::new(ScriptedTransport::default()),
            forwarder: Arc::new(RecordingForwarder::default()),
            store: store.clone(),
        };
        let mut router = Router::new(id("A"), RouterConfig::default(), topology, collaborators);
        router.config.max_messages_per_tick = 0;
        let shared = router.shared();

        // the store answers after the 2s deadline
        router.on_gateways_changed(1).await;
        assert_eq!(router.queue_len(), 0);
        assert!(shared.outcome(&held.id).is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        router.tick().await;
        assert_eq!(router.queue_len(), 1);
        assert_eq!(shared.outcome(&held.id).unwrap().state, MessageState::Queued);
        assert_eq!(shared.pending(), 1);
        assert_eq!(shared.stats().await.released_from_store, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_outliving_router_returns_to_store() {
        let store = Arc::new(SlowStore {
            inner: MemoryMessageStore::new(),
            delay: Duration::from_secs(3),
        });
        let held = text(Recipient::Broadcast, Priority::Normal, true);
        store.store(&held).await.unwrap();

        let topology = Arc::new(TopologyStore::new());
        let collaborators = Collaborators {
            transport: Arc::new(ScriptedTransport::default()),
            forwarder: Arc::new(RecordingForwarder::default()),
            store: store.clone(),
        };
        let mut router = Router::new(id("A"), RouterConfig::default(), topology, collaborators);
        router.on_gateways_changed(1).await;
        drop(router);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn test_backoff_limit_stores_message() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        add_node(&h.topology, "G", true, 0.5).await;
        add_node(&h.topology, "B", false, 1.0).await;
        link(&h.topology, "A", "B").await;

        let shared = h.router.shared();
        let mut msg = text(Recipient::Node(id("B")), Priority::Normal, false);
        msg.retry_count = RouterConfig::default().max_retries;
        let msg_id = shared.submit(msg);
        h.router.tick().await;

        let outcome = shared.outcome(&msg_id).unwrap();
        assert_eq!(outcome.state, MessageState::Stored);
        assert_eq!(outcome.reason, "retry limit of 5 reached");
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_stored_messages_released_on_first_gateway() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        let held = text(Recipient::Broadcast, Priority::Normal, true);
        h.store.store(&held).await.unwrap();

        h.router.on_gateways_changed(0).await;
        assert_eq!(h.router.queue_len(), 0);

        h.router.on_gateways_changed(1).await;
        assert_eq!(h.router.queue_len(), 1);
        assert!(h.store.is_empty().await);

        let shared = h.router.shared();
        assert_eq!(shared.outcome(&held.id).unwrap().state, MessageState::Queued);
        assert_eq!(shared.pending(), 1);

        // only the empty -> non-empty transition releases
        h.store.store(&held).await.unwrap();
        h.router.on_gateways_changed(2).await;
        assert_eq!(h.router.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_expired_message_dropped_without_attempt() {
        let mut h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        let shared = h.router.shared();
        let msg = text(Recipient::Broadcast, Priority::Normal, false).with_ttl(0);
        let msg_id = shared.submit(msg);
        h.router.tick().await;

        assert_eq!(shared.outcome(&msg_id).unwrap().state, MessageState::Dropped);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_persists_queue_and_returns_ledger() {
        let h = harness(ScriptedTransport::default(), RecordingForwarder::default()).await;
        let shared = h.router.shared();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut router = h.router;
        router.config.max_messages_per_tick = 0;
        let handle = tokio::spawn(router.run(shutdown_rx));

        let msg_id = shared.submit(text(Recipient::Broadcast, Priority::Low, false));
        shutdown_tx.send(()).unwrap();
        let ledger = handle.await.unwrap();

        assert!(ledger.is_empty());
        assert_eq!(shared.outcome(&msg_id).unwrap().state, MessageState::Stored);
        assert_eq!(h.store.len().await, 1);

        let late = shared.submit(text(Recipient::Broadcast, Priority::Low, false));
        assert_eq!(shared.outcome(&late).unwrap().state, MessageState::Dropped);
        assert_eq!(shared.pending(), 0);
    }
}
