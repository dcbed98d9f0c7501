#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use taskhive_domain::GroupKey;
use taskhive_protocol::ChatBroadcast;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport handle id; unique per connection.
pub type ConnId = u64;

/// Process-wide mapping from broadcast group to connected listeners.
///
/// Groups are independent: each has its own member lock, so a slow fan-out in
/// one room never holds up joins or sends in another. The outer map lock is
/// only held to find, create or drop a group.
#[derive(Debug, Clone)]
pub struct BroadcastRegistry {
	inner: Arc<RwLock<HashMap<GroupKey, Arc<GroupSlot>>>>,
	cfg: BroadcastConfig,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
	/// Maximum queued items per listener.
	pub listener_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for BroadcastConfig {
	fn default() -> Self {
		Self {
			listener_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items delivered to a listener queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerItem {
	Chat(ChatBroadcast),

	/// Items were dropped because this listener's queue was full.
	Lagged { dropped: u64 },
}

/// Sending half of a listener queue, owned by the registry while joined.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
	id: ConnId,
	tx: mpsc::Sender<ListenerItem>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
	pub delivered: usize,
	pub dropped: usize,
	pub pruned: usize,
}

#[derive(Debug, Default)]
struct GroupSlot {
	members: Mutex<Vec<Listener>>,

	/// Held across persist + send so stored order equals broadcast order.
	turn: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug)]
struct Listener {
	handle: ListenerHandle,
	pending_lag: u64,
}

impl BroadcastRegistry {
	pub fn new(cfg: BroadcastConfig) -> Self {
		Self {
			inner: Arc::new(RwLock::new(HashMap::new())),
			cfg,
		}
	}

	/// Create a bounded listener queue for connection `id`.
	pub fn listener(&self, id: ConnId) -> (ListenerHandle, mpsc::Receiver<ListenerItem>) {
		let (tx, rx) = mpsc::channel(self.cfg.listener_queue_capacity.max(1));
		(ListenerHandle { id, tx }, rx)
	}

	/// Register `handle` under `key`. Re-joining with the same id replaces the previous entry.
	pub fn join(&self, key: &GroupKey, handle: ListenerHandle) {
		self.join_slot(key, handle);
	}

	fn join_slot(&self, key: &GroupKey, handle: ListenerHandle) -> Arc<GroupSlot> {
		let mut groups = self.inner.write().unwrap_or_else(PoisonError::into_inner);
		let slot = Arc::clone(groups.entry(key.clone()).or_default());

		let mut members = slot.members.lock().unwrap_or_else(PoisonError::into_inner);
		members.retain(|l| l.handle.id != handle.id && !l.handle.tx.is_closed());
		members.push(Listener {
			handle,
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(group = %key, listeners = members.len(), "broadcast: joined");
		}
		metrics::gauge!("taskhive_chat_broadcast_groups").set(groups.len() as f64);

		drop(members);
		slot
	}

	/// Remove connection `id` from `key`. Returns whether it was registered; calling it again is a no-op.
	pub fn leave(&self, key: &GroupKey, id: ConnId) -> bool {
		let Some(slot) = self.slot(key) else {
			return false;
		};

		let (removed, now_empty) = {
			let mut members = slot.members.lock().unwrap_or_else(PoisonError::into_inner);
			let before = members.len();
			members.retain(|l| l.handle.id != id);
			(members.len() != before, members.is_empty())
		};

		if now_empty {
			self.remove_if_empty(key, &slot);
		}

		if self.cfg.debug_logs && removed {
			debug!(group = %key, conn_id = id, "broadcast: left");
		}

		removed
	}

	/// Deliver `event` to every listener of `key`, the sender included.
	///
	/// Full queues drop the event for that listener only; closed queues are pruned.
	pub fn send(&self, key: &GroupKey, event: &ChatBroadcast) -> SendReport {
		let Some(slot) = self.slot(key) else {
			return SendReport::default();
		};

		let mut report = SendReport::default();
		let now_empty = {
			let mut members = slot.members.lock().unwrap_or_else(PoisonError::into_inner);

			for listener in members.iter_mut() {
				match listener.handle.tx.try_send(ListenerItem::Chat(event.clone())) {
					Ok(()) => {
						report.delivered += 1;
						if listener.pending_lag > 0
							&& listener
								.handle
								.tx
								.try_send(ListenerItem::Lagged {
									dropped: listener.pending_lag,
								})
								.is_ok()
						{
							listener.pending_lag = 0;
						}
					}
					Err(mpsc::error::TrySendError::Full(_)) => {
						report.dropped += 1;
						listener.pending_lag = listener.pending_lag.saturating_add(1);
					}
					Err(mpsc::error::TrySendError::Closed(_)) => {
						report.pruned += 1;
					}
				}
			}

			if report.pruned > 0 {
				members.retain(|l| !l.handle.tx.is_closed());
			}
			members.is_empty()
		};

		if now_empty {
			self.remove_if_empty(key, &slot);
		}

		if report.dropped > 0 {
			metrics::counter!("taskhive_chat_broadcast_dropped_total").increment(report.dropped as u64);
			if self.cfg.debug_logs {
				debug!(group = %key, dropped = report.dropped, "broadcast: dropped due to full listener queues");
			}
		}

		report
	}

	/// Join and return a guard that leaves on drop.
	pub fn register(&self, key: GroupKey, handle: ListenerHandle) -> Registration {
		let id = handle.id;
		let slot = self.join_slot(&key, handle);
		Registration {
			registry: self.clone(),
			key,
			id,
			turn: Arc::clone(&slot.turn),
			active: true,
		}
	}

	/// Snapshot of open listener counts per group.
	pub fn listener_counts(&self) -> BTreeMap<GroupKey, usize> {
		let groups = self.inner.read().unwrap_or_else(PoisonError::into_inner);
		groups
			.iter()
			.map(|(k, slot)| {
				let members = slot.members.lock().unwrap_or_else(PoisonError::into_inner);
				(k.clone(), members.iter().filter(|l| !l.handle.tx.is_closed()).count())
			})
			.collect()
	}

	pub fn is_joined(&self, key: &GroupKey, id: ConnId) -> bool {
		self.slot(key).is_some_and(|slot| {
			slot.members
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.iter()
				.any(|l| l.handle.id == id)
		})
	}

	fn slot(&self, key: &GroupKey) -> Option<Arc<GroupSlot>> {
		let groups = self.inner.read().unwrap_or_else(PoisonError::into_inner);
		groups.get(key).cloned()
	}

	fn remove_if_empty(&self, key: &GroupKey, slot: &Arc<GroupSlot>) {
		let mut groups = self.inner.write().unwrap_or_else(PoisonError::into_inner);
		// A join may have landed between releasing the member lock and taking the map lock.
		let still_empty = slot.members.lock().unwrap_or_else(PoisonError::into_inner).is_empty();
		if still_empty && groups.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
			groups.remove(key);
			metrics::gauge!("taskhive_chat_broadcast_groups").set(groups.len() as f64);
		}
	}
}

/// A live group registration. Dropping it leaves the group.
#[derive(Debug)]
pub struct Registration {
	registry: BroadcastRegistry,
	key: GroupKey,
	id: ConnId,
	turn: Arc<tokio::sync::Mutex<()>>,
	active: bool,
}

impl Registration {
	pub fn key(&self) -> &GroupKey {
		&self.key
	}

	/// Per-group lock that orders persist-then-send across connections.
	pub fn turn(&self) -> Arc<tokio::sync::Mutex<()>> {
		Arc::clone(&self.turn)
	}

	pub fn is_active(&self) -> bool {
		self.active
	}

	/// Leave now. Later calls, and the eventual drop, do nothing.
	pub fn release(&mut self) -> bool {
		if !self.is_active() {
			return false;
		}
		self.active = false;
		self.registry.leave(&self.key, self.id)
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		self.release();
	}
}
