//! Exclusive write access to device nodes.
//!
//! A [`Claimable`] guards one writable node. Any number of agents may request a
//! [`Claim`] on it, but at most one claim is `Active` at a time:
//!
//! ```text
//! Pending ──(owner released)──▶ Active ──(forced out)──▶ Lost
//!    │                            │                        │
//!    └────────────(destroy)───────┴──────(destroy)─────────┴──▶ Destroyed
//! ```
//!
//! Claims are RAII guards in the manner of a serial port guard: dropping a claim
//! destroys it, which promotes the next pending claim in FIFO order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Identifies who holds a claim, for audit and display purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClaimMarker {
    /// Automated owner: the master running a protocol on a chip
    #[serde(rename_all = "camelCase")]
    Master {
        /// Chip whose master owns the claim
        chip_id: String,
    },
    /// Interactive owner, e.g. a client writing a node by hand
    User {
        /// Agent identifier
        agent: String,
    },
}

impl ClaimMarker {
    /// Whether this owner is protocol-driven rather than interactive.
    pub fn is_automated(&self) -> bool {
        matches!(self, ClaimMarker::Master { .. })
    }
}

/// Lifecycle state of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClaimState {
    /// Waiting behind the current owner
    Pending,
    /// Current owner of the node
    Active,
    /// Superseded by a forcing claim; never becomes active again
    Lost,
    /// Released
    Destroyed,
}

#[derive(Debug)]
struct ClaimEntry {
    id: u64,
    marker: ClaimMarker,
    state: watch::Sender<ClaimState>,
}

impl ClaimEntry {
    fn set(&self, state: ClaimState) {
        self.state.send_replace(state);
    }
}

#[derive(Debug, Default)]
struct ClaimQueue {
    owner: Option<Arc<ClaimEntry>>,
    pending: VecDeque<Arc<ClaimEntry>>,
    next_id: u64,
}

/// Arbitrates claims on a single writable node.
#[derive(Clone)]
pub struct Claimable {
    label: Arc<str>,
    queue: Arc<Mutex<ClaimQueue>>,
    owner_tx: watch::Sender<Option<ClaimMarker>>,
}

impl fmt::Debug for Claimable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claimable")
            .field("label", &self.label)
            .field("owner", &self.owner())
            .finish()
    }
}

impl Claimable {
    /// Create an unowned claimable for the node labelled `label`.
    pub fn new(label: impl Into<String>) -> Self {
        let (owner_tx, _) = watch::channel(None);

        Self {
            label: Arc::from(label.into()),
            queue: Arc::new(Mutex::new(ClaimQueue::default())),
            owner_tx,
        }
    }

    /// Request a claim.
    ///
    /// A forcing claim takes over immediately and the incumbent becomes `Lost`;
    /// otherwise the claim is queued and becomes active once every earlier claim
    /// has been released.
    pub fn claim(&self, marker: ClaimMarker, force: bool) -> Claim {
        let mut queue = self.queue.lock();
        let id = queue.next_id;
        queue.next_id += 1;

        let (state, _) = watch::channel(ClaimState::Pending);
        let entry = Arc::new(ClaimEntry { id, marker, state });

        if force {
            if let Some(incumbent) = queue.owner.take() {
                debug!(node = %self.label, claim = incumbent.id, "Claim lost to forcing claim");
                incumbent.set(ClaimState::Lost);
            }
        }

        if queue.owner.is_none() && (force || queue.pending.is_empty()) {
            entry.set(ClaimState::Active);
            queue.owner = Some(entry.clone());
            self.owner_tx.send_replace(Some(entry.marker.clone()));
            debug!(node = %self.label, claim = id, "Claim active");
        } else {
            queue.pending.push_back(entry.clone());
            debug!(node = %self.label, claim = id, "Claim pending");
        }

        Claim {
            entry,
            claimable: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Marker of the current owner, if any.
    pub fn owner(&self) -> Option<ClaimMarker> {
        self.queue.lock().owner.as_ref().map(|entry| entry.marker.clone())
    }

    /// Subscribe to ownership changes.
    pub fn subscribe_owner(&self) -> watch::Receiver<Option<ClaimMarker>> {
        self.owner_tx.subscribe()
    }

    /// Number of claims waiting behind the owner.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending.len()
    }

    fn release(&self, entry: &Arc<ClaimEntry>) {
        let mut queue = self.queue.lock();

        let was_owner = queue
            .owner
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, entry));

        if was_owner {
            queue.owner = None;

            if let Some(next) = queue.pending.pop_front() {
                next.set(ClaimState::Active);
                debug!(node = %self.label, claim = next.id, "Pending claim promoted");
                queue.owner = Some(next);
            }

            self.owner_tx
                .send_replace(queue.owner.as_ref().map(|owner| owner.marker.clone()));
        } else {
            queue.pending.retain(|pending| !Arc::ptr_eq(pending, entry));
        }

        entry.set(ClaimState::Destroyed);
        debug!(node = %self.label, claim = entry.id, "Claim destroyed");
    }

    fn is_owner(&self, entry: &Arc<ClaimEntry>) -> bool {
        self.queue
            .lock()
            .owner
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, entry))
    }
}

/// An exclusive-access ticket on a writable node.
///
/// Released when dropped, or earlier through [`Claim::release`] when the claim
/// is shared.
pub struct Claim {
    entry: Arc<ClaimEntry>,
    claimable: Claimable,
    released: AtomicBool,
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("node", &self.claimable.label)
            .field("id", &self.entry.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Claim {
    /// Current state.
    pub fn state(&self) -> ClaimState {
        *self.entry.state.borrow()
    }

    /// Whether this claim currently owns the node.
    pub fn is_active(&self) -> bool {
        self.state() == ClaimState::Active
    }

    /// Marker this claim was created with.
    pub fn marker(&self) -> &ClaimMarker {
        &self.entry.marker
    }

    /// Wait until the claim becomes active.
    ///
    /// Resolves immediately when already active. Returns `false` if the claim
    /// ended (lost or destroyed) before ever becoming active.
    pub async fn wait(&self) -> bool {
        let mut rx = self.entry.state.subscribe();

        let active = match rx.wait_for(|state| *state != ClaimState::Pending).await {
            Ok(state) => *state == ClaimState::Active,
            Err(_) => false,
        };

        active
    }

    /// Wait until the claim is superseded by a forcing claim.
    pub async fn lost(&self) {
        let mut rx = self.entry.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, ClaimState::Lost | ClaimState::Destroyed))
            .await;
    }

    /// Release the claim, promoting the next pending claim if this one was active.
    pub fn destroy(self) {
        self.release();
    }

    /// Whether `claimable` is the node this claim was issued for.
    pub fn belongs_to(&self, claimable: &Claimable) -> bool {
        Arc::ptr_eq(&self.claimable.queue, &claimable.queue)
    }

    pub(crate) fn owns(&self, claimable: &Claimable) -> bool {
        self.belongs_to(claimable) && claimable.is_owner(&self.entry)
    }

    /// Release the claim now, even while other holders keep a reference to it.
    ///
    /// Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.claimable.release(&self.entry);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.release();
    }
}

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(1);

/// Hierarchical identity of a run instance.
///
/// Mirrors the path of the program tree. A fresh symbol is minted for every run
/// invocation, so two successive runs of the same block never compare equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClaimSymbol {
    ids: Arc<[u64]>,
}

impl ClaimSymbol {
    /// Mint a new root symbol.
    pub fn root() -> Self {
        Self {
            ids: Arc::from(vec![NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed)]),
        }
    }

    /// Mint a new symbol nested under this one.
    pub fn child(&self) -> Self {
        let mut ids = self.ids.to_vec();
        ids.push(NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed));
        Self { ids: Arc::from(ids) }
    }

    /// Number of run instances from the root to this one, inclusive.
    pub fn depth(&self) -> usize {
        self.ids.len()
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &ClaimSymbol) -> bool {
        other.ids.starts_with(&self.ids)
    }

    /// Identifiers from the root to this symbol.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }
}

impl fmt::Debug for ClaimSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimSymbol({:?})", self.ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn master() -> ClaimMarker {
        ClaimMarker::Master {
            chip_id: "chip".into(),
        }
    }

    fn user() -> ClaimMarker {
        ClaimMarker::User {
            agent: "alice".into(),
        }
    }

    #[tokio::test]
    async fn test_first_claim_is_active() {
        let claimable = Claimable::new("valve");
        let claim = claimable.claim(master(), false);

        assert!(claim.is_active());
        assert!(claim.wait().await);
        assert_eq!(claimable.owner(), Some(master()));
    }

    #[tokio::test]
    async fn test_pending_claim_promoted_on_destroy() {
        let claimable = Claimable::new("valve");
        let first = claimable.claim(master(), false);
        let second = claimable.claim(user(), false);

        assert_eq!(second.state(), ClaimState::Pending);
        assert_eq!(claimable.pending_count(), 1);

        first.destroy();

        assert!(second.wait().await);
        assert_eq!(claimable.owner(), Some(user()));
    }

    #[tokio::test]
    async fn test_drop_releases_claim() {
        let claimable = Claimable::new("valve");

        {
            let _claim = claimable.claim(master(), false);
            assert!(claimable.owner().is_some());
        }

        assert!(claimable.owner().is_none());
    }

    #[tokio::test]
    async fn test_forcing_claim_preempts_incumbent() {
        let claimable = Claimable::new("valve");
        let incumbent = claimable.claim(master(), false);
        let forcing = claimable.claim(user(), true);

        assert_eq!(incumbent.state(), ClaimState::Lost);
        assert!(forcing.is_active());

        tokio::time::timeout(Duration::from_millis(10), incumbent.lost())
            .await
            .unwrap();

        // Lost claims stay out of the queue; destroying it must not disturb the owner.
        incumbent.destroy();
        assert_eq!(claimable.owner(), Some(user()));
        assert!(!claimable.owner().unwrap().is_automated());
    }

    #[tokio::test]
    async fn test_pending_claim_ends_without_activation() {
        let claimable = Claimable::new("valve");
        let _owner = claimable.claim(master(), false);
        let pending = claimable.claim(user(), false);
        let entry = pending.entry.clone();

        let waiter = tokio::spawn(async move { pending.wait().await });
        tokio::task::yield_now().await;

        entry.set(ClaimState::Lost);
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_claim_symbols_are_unique_and_nested() {
        let root = ClaimSymbol::root();
        let first = root.child();
        let second = root.child();

        assert_ne!(first, second);
        assert_eq!(first.depth(), 2);
        assert!(root.contains(&first));
        assert!(!first.contains(&second));
    }

    #[test]
    fn test_marker_export() {
        let json = serde_json::to_value(master()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "master", "chipId": "chip" }));
    }
}
