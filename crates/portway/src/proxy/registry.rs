//! Runtime-refreshable table mapping `(service, token, field)` to an
//! upstream endpoint. Lookups copy out a snapshot so replacements never
//! tear an in-flight decision.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
	pub host: String,
	pub service: String,
}

impl UpstreamAddr {
	pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
		UpstreamAddr {
			host: host.into(),
			service: service.into(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServiceEntry {
	pub token: String,
	pub fields: HashMap<String, UpstreamAddr>,
}

impl ServiceEntry {
	pub fn new(token: impl Into<String>) -> Self {
		ServiceEntry {
			token: token.into(),
			fields: HashMap::new(),
		}
	}

	pub fn field(mut self, name: impl Into<String>, upstream: UpstreamAddr) -> Self {
		self.fields.insert(name.into(), upstream);
		self
	}
}

#[derive(Default)]
pub struct ProxyRegistry {
	inner: RwLock<HashMap<String, ServiceEntry>>,
}

impl ProxyRegistry {
	pub fn insert(&self, service: impl Into<String>, entry: ServiceEntry) {
		self
			.inner
			.write()
			.expect("registry lock")
			.insert(service.into(), entry);
	}

	pub fn remove(&self, service: &str) {
		self.inner.write().expect("registry lock").remove(service);
	}

	/// Swap the whole table; readers keep whatever snapshot they already
	/// took.
	pub fn replace_all(&self, table: HashMap<String, ServiceEntry>) {
		*self.inner.write().expect("registry lock") = table;
	}

	/// Point-in-time lookup. The token must match exactly.
	pub fn lookup(&self, service: &str, token: &str, field: &str) -> Option<UpstreamAddr> {
		let inner = self.inner.read().expect("registry lock");
		let entry = inner.get(service)?;
		if entry.token != token {
			return None;
		}
		entry.fields.get(field).cloned()
	}
}
