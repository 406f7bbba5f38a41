//! Server-side pub/sub broker: key → subscriber multimap with a
//! per-connection reverse index so teardown is one pass. Fan-out never
//! blocks; frames go onto each subscriber's write queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::errors::RpcError;
use crate::payload;
use crate::wire::{Closer, WireMsg, WriterTx};

/// What the broker needs from a connection: an id, a write queue, and a way
/// to tell it is gone.
pub(crate) struct SubscriberHandle {
	pub conn_id: u64,
	writer: WriterTx,
	closer: Closer,
}

impl SubscriberHandle {
	pub(crate) fn new(conn_id: u64, writer: WriterTx, closer: Closer) -> Arc<Self> {
		Arc::new(SubscriberHandle {
			conn_id,
			writer,
			closer,
		})
	}

	fn is_closed(&self) -> bool {
		self.closer.is_closed()
	}

	fn send(&self, body: bytes::Bytes) {
		let _ = self.writer.send(WireMsg::publish(body));
	}
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PublishOutcome {
	Delivered(usize),
	/// Nobody listens on this key. `any_subscribers` distinguishes a fully
	/// idle broker from a misrouted topic.
	NoSuchTopic { any_subscribers: bool },
}

#[derive(Default)]
struct Inner {
	topics: HashMap<String, Vec<(u64, Weak<SubscriberHandle>)>>,
	by_conn: HashMap<u64, HashSet<String>>,
}

#[derive(Default)]
pub struct Broker {
	inner: Mutex<Inner>,
}

impl Broker {
	/// Returns false when this connection already subscribes to `key`.
	pub(crate) fn subscribe(&self, key: &str, handle: &Arc<SubscriberHandle>) -> bool {
		let mut inner = self.inner.lock().expect("broker lock");
		let entries = inner.topics.entry(key.to_string()).or_default();
		if entries.iter().any(|(id, _)| *id == handle.conn_id) {
			return false;
		}
		entries.push((handle.conn_id, Arc::downgrade(handle)));
		inner
			.by_conn
			.entry(handle.conn_id)
			.or_default()
			.insert(key.to_string());
		true
	}

	pub(crate) fn unsubscribe(&self, key: &str, conn_id: u64) -> bool {
		let mut inner = self.inner.lock().expect("broker lock");
		let mut removed = false;
		if let Some(entries) = inner.topics.get_mut(key) {
			let before = entries.len();
			entries.retain(|(id, _)| *id != conn_id);
			removed = entries.len() != before;
			if entries.is_empty() {
				inner.topics.remove(key);
			}
		}
		if let Some(keys) = inner.by_conn.get_mut(&conn_id) {
			keys.remove(key);
			if keys.is_empty() {
				inner.by_conn.remove(&conn_id);
			}
		}
		removed
	}

	/// Drop every subscription of a closing connection in one pass.
	pub(crate) fn remove_connection(&self, conn_id: u64) {
		let mut inner = self.inner.lock().expect("broker lock");
		let Some(keys) = inner.by_conn.remove(&conn_id) else {
			return;
		};
		for key in keys {
			if let Some(entries) = inner.topics.get_mut(&key) {
				entries.retain(|(id, _)| *id != conn_id);
				if entries.is_empty() {
					inner.topics.remove(&key);
				}
			}
		}
	}

	/// Fan `data` out to every live subscriber of `key`. The fan-out body is
	/// encoded once and shared.
	pub(crate) fn publish_raw(&self, key: &str, data: &[u8]) -> Result<PublishOutcome, RpcError> {
		let targets: Vec<Arc<SubscriberHandle>> = {
			let mut inner = self.inner.lock().expect("broker lock");
			match inner.topics.get_mut(key) {
				Some(entries) => {
					entries.retain(|(_, weak)| weak.strong_count() > 0);
					entries
						.iter()
						.filter_map(|(_, weak)| weak.upgrade())
						.filter(|h| !h.is_closed())
						.collect()
				},
				None => Vec::new(),
			}
		};
		if targets.is_empty() {
			let any_subscribers = !self.inner.lock().expect("broker lock").topics.is_empty();
			return Ok(PublishOutcome::NoSuchTopic { any_subscribers });
		}
		let body = payload::pack_fanout(key, data)?;
		for handle in &targets {
			handle.send(body.clone());
		}
		Ok(PublishOutcome::Delivered(targets.len()))
	}

	#[cfg(test)]
	pub(crate) fn indexes_agree(&self) -> bool {
		let inner = self.inner.lock().expect("broker lock");
		for (key, entries) in &inner.topics {
			for (conn_id, _) in entries {
				let ok = inner
					.by_conn
					.get(conn_id)
					.map(|keys| keys.contains(key))
					.unwrap_or(false);
				if !ok {
					return false;
				}
			}
		}
		for (conn_id, keys) in &inner.by_conn {
			for key in keys {
				let ok = inner
					.topics
					.get(key)
					.map(|entries| entries.iter().any(|(id, _)| id == conn_id))
					.unwrap_or(false);
				if !ok {
					return false;
				}
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::mpsc;

	use super::*;

	fn handle(conn_id: u64) -> (Arc<SubscriberHandle>, mpsc::UnboundedReceiver<WireMsg>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(SubscriberHandle::new(conn_id, tx, Closer::new()), rx)
	}

	#[test]
	fn subscribe_unsubscribe_keeps_indexes_consistent() {
		let broker = Broker::default();
		let (a, _rxa) = handle(1);
		let (b, _rxb) = handle(2);

		assert!(broker.subscribe("k", &a));
		assert!(!broker.subscribe("k", &a));
		assert!(broker.subscribe("k", &b));
		assert!(broker.subscribe("other", &a));
		assert!(broker.indexes_agree());

		assert!(broker.unsubscribe("k", 1));
		assert!(!broker.unsubscribe("k", 1));
		assert!(broker.indexes_agree());

		broker.remove_connection(2);
		assert!(broker.indexes_agree());
		assert_eq!(
			broker.publish_raw("k", b"x").unwrap(),
			PublishOutcome::NoSuchTopic { any_subscribers: true }
		);
	}

	#[test]
	fn publish_reaches_each_subscriber_once() {
		let broker = Broker::default();
		let (a, mut rxa) = handle(1);
		let (b, mut rxb) = handle(2);
		broker.subscribe("k", &a);
		broker.subscribe("k", &b);

		let inner = payload::pack(&"msg").unwrap();
		assert_eq!(
			broker.publish_raw("k", &inner).unwrap(),
			PublishOutcome::Delivered(2)
		);
		for rx in [&mut rxa, &mut rxb] {
			let WireMsg::Frame { req_id, body, .. } = rx.try_recv().unwrap() else {
				panic!("expected frame")
			};
			assert_eq!(req_id, 0);
			let (code, key, data) = payload::unpack_fanout(&body).unwrap();
			assert_eq!((code, key.as_str()), (payload::CODE_OK, "k"));
			assert_eq!(payload::unpack::<String>(&data).unwrap(), "msg");
			assert!(rx.try_recv().is_err());
		}
	}

	#[test]
	fn vanished_subscriber_is_skipped() {
		let broker = Broker::default();
		let (a, _rxa) = handle(1);
		broker.subscribe("k", &a);
		drop(a);
		assert_eq!(
			broker.publish_raw("k", b"x").unwrap(),
			PublishOutcome::NoSuchTopic { any_subscribers: true }
		);
	}

	#[test]
	fn idle_broker_is_not_a_misroute() {
		let broker = Broker::default();
		assert_eq!(
			broker.publish_raw("k", b"x").unwrap(),
			PublishOutcome::NoSuchTopic { any_subscribers: false }
		);
	}
}
