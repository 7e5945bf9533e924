//! Device nodes
//!
//! A [`Node`] is a typed, watchable device value. Node kinds form a closed set
//! ([`NodeKind`]) and every consumer matches on it exhaustively:
//!
//! - **Readable**: value pushed by the device driver
//! - **Writable**: bidirectional value with a current and a target, guarded by a
//!   [`Claimable`]
//! - **Polled**: readable value refreshed at the fastest interval requested by
//!   its watchers
//! - **Collection**: groups child nodes and republishes their changes
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──configure()──▶ Configuring ──▶ Connected
//!       ▲                            │               │
//!       └────────(unavailable)───────┴──unconfigure()┘
//! ```
//!
//! Change notifications use the same `tokio::sync::watch` revision pattern as
//! observable parameters: every observable change bumps a counter, and watchers
//! wait on [`WatchRegistration::changed`].

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::claim::{Claim, ClaimMarker, Claimable};
use super::value::NodeValue;
use crate::error::{AppResult, EngineError, NodeError};

/// Driver contract supplied by device plugins.
#[async_trait]
pub trait NodeDriver: Send + Sync + 'static {
    /// Read the value from the device.
    ///
    /// Returns [`NodeError::Unavailable`] when the node is temporarily absent on
    /// the device, e.g. because of a configuration or disconnection issue.
    async fn read(&self) -> Result<NodeValue, NodeError>;

    /// Write a value to the device.
    async fn write(&self, _value: &NodeValue) -> Result<(), NodeError> {
        Err(NodeError::Io("driver does not support writes".to_string()))
    }
}

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Not reachable, or never configured
    Disconnected,
    /// Initial read in progress
    Configuring,
    /// Reachable and up to date
    Connected,
}

/// Value node fed by its driver.
pub struct ReadableNode {
    driver: Arc<dyn NodeDriver>,
    value: Mutex<Option<NodeValue>>,
}

/// Bidirectional node with a current and a target value.
pub struct WritableNode {
    driver: Arc<dyn NodeDriver>,
    current: Mutex<Option<NodeValue>>,
    target: Mutex<Option<NodeValue>>,
    claimable: Claimable,
    in_flight: watch::Sender<usize>,
}

/// Readable node refreshed at an interval.
pub struct PolledNode {
    driver: Arc<dyn NodeDriver>,
    value: Mutex<Option<NodeValue>>,
    min_interval: Duration,
    intervals: Mutex<Vec<(u64, Duration)>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// Node grouping child nodes.
pub struct CollectionNode {
    model: Option<String>,
    children: Vec<Arc<Node>>,
    wiring: Mutex<CollectionWiring>,
}

#[derive(Default)]
struct CollectionWiring {
    watchers: usize,
    child_registrations: Vec<WatchRegistration>,
    forwarder: Option<JoinHandle<()>>,
}

/// Closed set of node variants.
pub enum NodeKind {
    /// See [`ReadableNode`]
    Readable(ReadableNode),
    /// See [`WritableNode`]
    Writable(WritableNode),
    /// See [`PolledNode`]
    Polled(PolledNode),
    /// See [`CollectionNode`]
    Collection(CollectionNode),
}

/// A typed, watchable device value.
pub struct Node {
    id: String,
    label: Option<String>,
    connection: watch::Sender<ConnectionState>,
    revision: watch::Sender<u64>,
    next_watch_id: Mutex<u64>,
    kind: NodeKind,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Readable(_) => "readable",
            NodeKind::Writable(_) => "writable",
            NodeKind::Polled(_) => "polled",
            NodeKind::Collection(_) => "collection",
        };

        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("connection", &self.connection_state())
            .finish()
    }
}

/// Serializable state of a single node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Whether the node is connected
    pub connected: bool,
    /// Last known (current) value
    pub value: Option<NodeValue>,
    /// Target value of writable nodes
    pub target: Option<NodeValue>,
    /// Current claim owner of writable nodes
    pub owner: Option<ClaimMarker>,
}

impl Node {
    fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (revision, _) = watch::channel(0);

        Self {
            id: id.into(),
            label: None,
            connection,
            revision,
            next_watch_id: Mutex::new(0),
            kind,
        }
    }

    /// Create a readable node.
    pub fn readable(id: impl Into<String>, driver: Arc<dyn NodeDriver>) -> Self {
        Self::new(
            id,
            NodeKind::Readable(ReadableNode {
                driver,
                value: Mutex::new(None),
            }),
        )
    }

    /// Create a bidirectional writable node.
    pub fn writable(id: impl Into<String>, driver: Arc<dyn NodeDriver>) -> Self {
        let id = id.into();
        let (in_flight, _) = watch::channel(0);

        Self::new(
            id.clone(),
            NodeKind::Writable(WritableNode {
                driver,
                current: Mutex::new(None),
                target: Mutex::new(None),
                claimable: Claimable::new(id),
                in_flight,
            }),
        )
    }

    /// Create a polled node that never polls faster than `min_interval`.
    pub fn polled(id: impl Into<String>, driver: Arc<dyn NodeDriver>, min_interval: Duration) -> Self {
        Self::new(
            id,
            NodeKind::Polled(PolledNode {
                driver,
                value: Mutex::new(None),
                min_interval,
                intervals: Mutex::new(Vec::new()),
                poll_task: Mutex::new(None),
            }),
        )
    }

    /// Create a collection of child nodes.
    pub fn collection(id: impl Into<String>, children: Vec<Arc<Node>>) -> Self {
        Self::new(
            id,
            NodeKind::Collection(CollectionNode {
                model: None,
                children,
                wiring: Mutex::new(CollectionWiring::default()),
            }),
        )
    }

    /// Set the human-readable label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the device model of a collection node.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        if let NodeKind::Collection(collection) = &mut self.kind {
            collection.model = Some(model.into());
        }
        self
    }

    /// Node identifier, unique among siblings.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Node variant.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Whether the node is connected.
    pub fn connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Subscribe to connection changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Child nodes of a collection; empty for value nodes.
    pub fn children(&self) -> &[Arc<Node>] {
        match &self.kind {
            NodeKind::Collection(collection) => &collection.children,
            NodeKind::Readable(_) | NodeKind::Writable(_) | NodeKind::Polled(_) => &[],
        }
    }

    /// Device model of a collection node.
    pub fn model(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Collection(collection) => collection.model.as_deref(),
            NodeKind::Readable(_) | NodeKind::Writable(_) | NodeKind::Polled(_) => None,
        }
    }

    /// Whether the node accepts writes.
    pub fn is_writable(&self) -> bool {
        matches!(self.kind, NodeKind::Writable(_))
    }

    /// Claimable guarding a writable node.
    pub fn claimable(&self) -> Option<&Claimable> {
        match &self.kind {
            NodeKind::Writable(writable) => Some(&writable.claimable),
            NodeKind::Readable(_) | NodeKind::Polled(_) | NodeKind::Collection(_) => None,
        }
    }

    /// Current value: the last read value, or the current value of a writable node.
    pub fn value(&self) -> Option<NodeValue> {
        match &self.kind {
            NodeKind::Readable(readable) => readable.value.lock().clone(),
            NodeKind::Writable(writable) => writable.current.lock().clone(),
            NodeKind::Polled(polled) => polled.value.lock().clone(),
            NodeKind::Collection(_) => None,
        }
    }

    /// Target value of a writable node.
    pub fn target(&self) -> Option<NodeValue> {
        match &self.kind {
            NodeKind::Writable(writable) => writable.target.lock().clone(),
            NodeKind::Readable(_) | NodeKind::Polled(_) | NodeKind::Collection(_) => None,
        }
    }

    /// Serializable state snapshot.
    pub fn state(&self) -> NodeState {
        NodeState {
            connected: self.connected(),
            value: self.value(),
            target: self.target(),
            owner: self.claimable().and_then(Claimable::owner),
        }
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn set_connection(&self, state: ConnectionState) {
        self.connection.send_replace(state);
    }

    // -- Producer side --------------------------------------------------------

    /// Push a new value from the driver side of a readable node.
    pub fn publish(&self, value: NodeValue) {
        if let NodeKind::Readable(readable) = &self.kind {
            let changed = {
                let mut current = readable.value.lock();
                let changed = current.as_ref() != Some(&value);
                *current = Some(value);
                changed
            };

            if changed {
                self.notify();
            }
        }
    }

    /// Connect the node (and, for collections, all descendants).
    ///
    /// A driver read reporting [`NodeError::Unavailable`] leaves the node
    /// disconnected; it is not an error.
    pub fn configure(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let node = self.clone();

        async move {
            node.set_connection(ConnectionState::Configuring);

            match &node.kind {
                NodeKind::Collection(collection) => {
                    for child in &collection.children {
                        child.configure().await;
                    }

                    node.set_connection(ConnectionState::Connected);
                }
                NodeKind::Readable(readable) => match readable.driver.read().await {
                    Ok(value) => {
                        *readable.value.lock() = Some(value);
                        node.set_connection(ConnectionState::Connected);
                    }
                    Err(err) => node.absorb_configure_error(err),
                },
                NodeKind::Polled(polled) => match polled.driver.read().await {
                    Ok(value) => {
                        *polled.value.lock() = Some(value);
                        node.set_connection(ConnectionState::Connected);

                        if node.effective_interval().is_some() {
                            node.start_polling();
                        }
                    }
                    Err(err) => node.absorb_configure_error(err),
                },
                NodeKind::Writable(writable) => match writable.driver.read().await {
                    Ok(current) => {
                        *writable.current.lock() = Some(current.clone());

                        let target = {
                            let mut target = writable.target.lock();
                            target.get_or_insert_with(|| current.clone()).clone()
                        };

                        node.set_connection(ConnectionState::Connected);

                        if target != current {
                            debug!(node = %node.id, %target, "Reconciling target on connect");

                            if let Err(err) = node.write_connected(writable, target).await {
                                warn!(node = %node.id, error = %err, "Reconciliation write failed");
                            }
                        }
                    }
                    Err(err) => node.absorb_configure_error(err),
                },
            }

            node.notify();
        }
        .boxed()
    }

    /// Disconnect the node (and, for collections, all descendants).
    ///
    /// Watchers are always notified, even if the node never connected.
    pub fn unconfigure(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let node = self.clone();

        async move {
            if let NodeKind::Collection(collection) = &node.kind {
                for child in &collection.children {
                    child.unconfigure().await;
                }
            }

            if let NodeKind::Polled(polled) = &node.kind {
                if let Some(task) = polled.poll_task.lock().take() {
                    task.abort();
                }
            }

            node.set_connection(ConnectionState::Disconnected);
            node.notify();
        }
        .boxed()
    }

    fn absorb_configure_error(&self, err: NodeError) {
        match err {
            NodeError::Unavailable => {
                debug!(node = %self.id, "Node unavailable, staying disconnected");
            }
            NodeError::Io(message) => {
                warn!(node = %self.id, error = %message, "Failed to configure node");
            }
        }

        self.set_connection(ConnectionState::Disconnected);
    }

    // -- Consumer side --------------------------------------------------------

    /// Write a writable node under `claim`.
    ///
    /// The target is recorded unconditionally; the device write only happens
    /// while connected. Writing without holding the node's active claim, or
    /// writing any other node kind, is an error.
    pub async fn write(&self, claim: &Claim, value: NodeValue) -> AppResult<()> {
        let NodeKind::Writable(writable) = &self.kind else {
            return Err(EngineError::ReadOnlyNode(self.id.clone()));
        };

        if !claim.owns(&writable.claimable) {
            return Err(EngineError::ClaimNotActive(self.id.clone()));
        }

        *writable.target.lock() = Some(value.clone());

        let result = if self.connected() {
            self.write_connected(writable, value).await
        } else {
            Ok(())
        };

        self.notify();
        result
    }

    async fn write_connected(&self, writable: &WritableNode, value: NodeValue) -> AppResult<()> {
        let _guard = InFlightGuard::new(&writable.in_flight);

        match writable.driver.write(&value).await {
            Ok(()) => {
                *writable.current.lock() = Some(value);
                Ok(())
            }
            Err(NodeError::Unavailable) => {
                debug!(node = %self.id, "Node became unavailable during write");
                self.set_connection(ConnectionState::Disconnected);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wait until no device write is in flight on this node.
    ///
    /// Resolves immediately for non-writable nodes.
    pub async fn wait_settled(&self) {
        if let NodeKind::Writable(writable) = &self.kind {
            let mut rx = writable.in_flight.subscribe();
            let _ = rx.wait_for(|count| *count == 0).await;
        }
    }

    /// Register a watcher, optionally asking for polling at `interval`.
    ///
    /// The returned registration is cancelled when dropped.
    pub fn watch(self: &Arc<Self>, interval: Option<Duration>) -> WatchRegistration {
        let watch_id = {
            let mut next = self.next_watch_id.lock();
            *next += 1;
            *next
        };

        let mut polled_interval = None;

        match &self.kind {
            NodeKind::Polled(polled) => {
                if let Some(interval) = interval {
                    polled.intervals.lock().push((watch_id, interval));
                    polled_interval = Some(watch_id);

                    let running = polled
                        .poll_task
                        .lock()
                        .as_ref()
                        .is_some_and(|task| !task.is_finished());

                    if !running && self.connected() {
                        self.start_polling();
                    }
                }
            }
            NodeKind::Collection(collection) => {
                let mut wiring = collection.wiring.lock();
                wiring.watchers += 1;

                if wiring.watchers == 1 {
                    self.wire_children(collection, &mut wiring, interval);
                }
            }
            NodeKind::Readable(_) | NodeKind::Writable(_) => {}
        }

        WatchRegistration {
            node: self.clone(),
            receiver: self.revision.subscribe(),
            polled_interval,
            released: false,
        }
    }

    fn wire_children(
        self: &Arc<Self>,
        collection: &CollectionNode,
        wiring: &mut CollectionWiring,
        interval: Option<Duration>,
    ) {
        let registrations: Vec<WatchRegistration> = collection
            .children
            .iter()
            .map(|child| child.watch(interval))
            .collect();

        let mut receivers: Vec<watch::Receiver<u64>> = registrations
            .iter()
            .map(|registration| registration.receiver.clone())
            .collect();

        let parent: Weak<Node> = Arc::downgrade(self);

        wiring.child_registrations = registrations;
        wiring.forwarder = Some(tokio::spawn(async move {
            if receivers.is_empty() {
                return;
            }

            loop {
                let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
                let (result, _, _) = futures::future::select_all(changes).await;

                if result.is_err() {
                    break;
                }

                match parent.upgrade() {
                    Some(parent) => parent.notify(),
                    None => break,
                }
            }
        }));

        debug!(node = %self.id, children = collection.children.len(), "Wired collection watchers");
    }

    fn unwatch(&self, polled_interval: Option<u64>) {
        match &self.kind {
            NodeKind::Polled(polled) => {
                if let Some(watch_id) = polled_interval {
                    let empty = {
                        let mut intervals = polled.intervals.lock();
                        intervals.retain(|(id, _)| *id != watch_id);
                        intervals.is_empty()
                    };

                    if empty {
                        if let Some(task) = polled.poll_task.lock().take() {
                            debug!(node = %self.id, "Stopping poll loop");
                            task.abort();
                        }
                    }
                }
            }
            NodeKind::Collection(collection) => {
                let mut wiring = collection.wiring.lock();
                wiring.watchers = wiring.watchers.saturating_sub(1);

                if wiring.watchers == 0 {
                    if let Some(task) = wiring.forwarder.take() {
                        task.abort();
                    }

                    wiring.child_registrations.clear();
                }
            }
            NodeKind::Readable(_) | NodeKind::Writable(_) => {}
        }
    }

    /// Effective poll interval: the fastest watcher interval, bounded below by
    /// the node's minimum interval. `None` when no watcher asked for polling or
    /// the node is not polled.
    pub fn effective_interval(&self) -> Option<Duration> {
        match &self.kind {
            NodeKind::Polled(polled) => polled
                .intervals
                .lock()
                .iter()
                .map(|(_, interval)| *interval)
                .min()
                .map(|interval| interval.max(polled.min_interval)),
            NodeKind::Readable(_) | NodeKind::Writable(_) | NodeKind::Collection(_) => None,
        }
    }

    /// Whether a poll loop is currently running.
    pub fn is_polling(&self) -> bool {
        match &self.kind {
            NodeKind::Polled(polled) => polled
                .poll_task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished()),
            NodeKind::Readable(_) | NodeKind::Writable(_) | NodeKind::Collection(_) => false,
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let NodeKind::Polled(polled) = &self.kind else {
            return;
        };

        let node = Arc::downgrade(self);
        debug!(node = %self.id, "Starting poll loop");

        let task = tokio::spawn(async move {
            loop {
                let Some(interval) = node.upgrade().and_then(|node| node.effective_interval()) else {
                    break;
                };

                tokio::time::sleep(interval).await;

                let Some(node) = node.upgrade() else {
                    break;
                };

                if !node.poll_once().await {
                    break;
                }
            }
        });

        if let Some(previous) = polled.poll_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Read a polled node once. Returns `false` when polling should stop.
    async fn poll_once(&self) -> bool {
        let NodeKind::Polled(polled) = &self.kind else {
            return false;
        };

        match polled.driver.read().await {
            Ok(value) => {
                let changed = {
                    let mut current = polled.value.lock();
                    let changed = current.as_ref() != Some(&value);
                    *current = Some(value);
                    changed
                };

                if changed {
                    self.notify();
                }

                true
            }
            Err(NodeError::Unavailable) => {
                debug!(node = %self.id, "Polled node unavailable, disconnecting");
                self.set_connection(ConnectionState::Disconnected);
                self.notify();
                false
            }
            Err(NodeError::Io(message)) => {
                warn!(node = %self.id, error = %message, "Poll read failed");
                true
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        match &mut self.kind {
            NodeKind::Polled(polled) => {
                if let Some(task) = polled.poll_task.get_mut().take() {
                    task.abort();
                }
            }
            NodeKind::Collection(collection) => {
                if let Some(task) = collection.wiring.get_mut().forwarder.take() {
                    task.abort();
                }
            }
            NodeKind::Readable(_) | NodeKind::Writable(_) => {}
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a watch::Sender<usize>,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// A watcher registration on a node.
///
/// Cancelling (or dropping) the registration removes its poll interval and,
/// for collections, releases the per-child wiring once no watcher remains.
pub struct WatchRegistration {
    node: Arc<Node>,
    receiver: watch::Receiver<u64>,
    polled_interval: Option<u64>,
    released: bool,
}

impl fmt::Debug for WatchRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistration")
            .field("node", &self.node.id)
            .finish()
    }
}

impl WatchRegistration {
    /// Wait for the next change. Returns `false` if the node was dropped.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Watched node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Cancel the registration.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.node.unwatch(self.polled_interval);
        }
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedDriver;

    fn master() -> ClaimMarker {
        ClaimMarker::Master {
            chip_id: "chip".into(),
        }
    }

    #[tokio::test]
    async fn test_unavailable_read_keeps_node_disconnected() {
        let driver = SimulatedDriver::new(NodeValue::Number(1.0));
        driver.set_available(false);

        let node = Arc::new(Node::readable("temp", driver.clone()));
        node.configure().await;

        assert_eq!(node.connection_state(), ConnectionState::Disconnected);
        assert_eq!(node.value(), None);
    }

    #[tokio::test]
    async fn test_unconfigure_notifies_without_connect() {
        let node = Arc::new(Node::readable("temp", SimulatedDriver::new(NodeValue::Null)));
        let mut registration = node.watch(None);

        node.unconfigure().await;
        assert!(registration.changed().await);
    }

    #[tokio::test]
    async fn test_writable_reconciles_target_on_connect() {
        let driver = SimulatedDriver::new(NodeValue::Number(0.0));
        driver.set_available(false);

        let node = Arc::new(Node::writable("speed", driver.clone()));
        let claim = node.claimable().unwrap().claim(master(), false);

        // Disconnected: target recorded, no device write.
        node.write(&claim, NodeValue::Number(5.0)).await.unwrap();
        assert_eq!(node.target(), Some(NodeValue::Number(5.0)));
        assert!(driver.writes().is_empty());

        driver.set_available(true);
        node.configure().await;

        assert!(node.connected());
        assert_eq!(driver.writes(), vec![NodeValue::Number(5.0)]);
        assert_eq!(node.value(), Some(NodeValue::Number(5.0)));
    }

    #[tokio::test]
    async fn test_write_requires_active_claim() {
        let node = Arc::new(Node::writable("speed", SimulatedDriver::new(NodeValue::Number(0.0))));
        node.configure().await;

        let claimable = node.claimable().unwrap();
        let _owner = claimable.claim(master(), false);
        let queued = claimable.claim(master(), false);

        let result = node.write(&queued, NodeValue::Number(1.0)).await;
        assert!(matches!(result, Err(EngineError::ClaimNotActive(_))));
    }

    #[tokio::test]
    async fn test_write_to_readable_is_rejected() {
        let writable = Arc::new(Node::writable("speed", SimulatedDriver::new(NodeValue::Null)));
        let claim = writable.claimable().unwrap().claim(master(), false);

        let readable = Node::readable("temp", SimulatedDriver::new(NodeValue::Null));
        let result = readable.write(&claim, NodeValue::Null).await;
        assert!(matches!(result, Err(EngineError::ReadOnlyNode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_effective_interval_tracks_fastest_watcher() {
        let node = Arc::new(Node::polled(
            "pressure",
            SimulatedDriver::new(NodeValue::Number(1.0)),
            Duration::from_millis(500),
        ));
        node.configure().await;

        let slow = node.watch(Some(Duration::from_secs(5)));
        assert!(node.is_polling());

        let fast = node.watch(Some(Duration::from_secs(2)));
        assert_eq!(node.effective_interval(), Some(Duration::from_secs(2)));

        fast.cancel();
        assert_eq!(node.effective_interval(), Some(Duration::from_secs(5)));

        slow.cancel();
        assert_eq!(node.effective_interval(), None);
        assert!(!node.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_bounds_polling() {
        let node = Arc::new(Node::polled(
            "pressure",
            SimulatedDriver::new(NodeValue::Number(1.0)),
            Duration::from_secs(1),
        ));

        let _registration = node.watch(Some(Duration::from_millis(10)));
        assert_eq!(node.effective_interval(), Some(Duration::from_secs(1)));

        // Not connected yet: no poll loop.
        assert!(!node.is_polling());
        node.configure().await;
        assert!(node.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_publishes_changes() {
        let driver = SimulatedDriver::new(NodeValue::Number(1.0));
        let node = Arc::new(Node::polled("pressure", driver.clone(), Duration::ZERO));
        node.configure().await;

        let mut registration = node.watch(Some(Duration::from_millis(100)));
        driver.set_value(NodeValue::Number(2.0));

        tokio::time::timeout(Duration::from_secs(1), registration.changed())
            .await
            .unwrap();
        assert_eq!(node.value(), Some(NodeValue::Number(2.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_unavailable_disconnects() {
        let driver = SimulatedDriver::new(NodeValue::Number(1.0));
        let node = Arc::new(Node::polled("pressure", driver.clone(), Duration::ZERO));
        node.configure().await;

        let _registration = node.watch(Some(Duration::from_millis(100)));
        driver.set_available(false);

        let mut connection = node.subscribe_connection();
        tokio::time::timeout(
            Duration::from_secs(1),
            connection.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_collection_republishes_child_changes() {
        let child_driver = SimulatedDriver::new(NodeValue::Number(1.0));
        let child = Arc::new(Node::readable("temp", child_driver));
        let device = Arc::new(Node::collection("sensor", vec![child.clone()]));

        let mut first = device.watch(None);
        let second = device.watch(None);

        child.publish(NodeValue::Number(3.0));
        tokio::time::timeout(Duration::from_secs(1), first.changed())
            .await
            .unwrap();

        second.cancel();
        first.cancel();

        let NodeKind::Collection(collection) = device.kind() else {
            unreachable!()
        };
        let wiring = collection.wiring.lock();
        assert_eq!(wiring.watchers, 0);
        assert!(wiring.child_registrations.is_empty());
        assert!(wiring.forwarder.is_none());
    }
}
