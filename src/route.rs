use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::balance::{Balance, new_balance};
use crate::config::{BalanceKind, HostConfig, RouterConfig};
use crate::metadata::{Descriptor, MetaData, Uri};
use crate::middleware::{Feature, Handle, Handler};
use crate::proxy::MeshError;

/// Immutable map from the lowercased `/service/method` key to the method's
/// descriptor, plus the configured host set. Replaced wholesale on reload.
pub struct RouteTable {
	pub routes: HashMap<String, Arc<Descriptor>>,
	pub hosts: HashMap<String, HostConfig>,
}

impl RouteTable {
	pub fn build(cfg: &RouterConfig) -> RouteTable {
		info!("loading router config, {} routes", cfg.routers.len());
		let mut routes = HashMap::new();
		for r in &cfg.routers {
			let desc = Descriptor {
				uri: Uri {
					http_verb: r.method_type.to_uppercase(),
					service_name: r.service_name.clone(),
					method: r.method.clone(),
					params: Default::default(),
				},
				host: r.host.clone(),
				request_message: r.in_message.clone(),
				response_message: r.out_message.clone(),
			};
			routes.insert(desc.route_key(), Arc::new(desc));
		}
		let hosts = cfg
			.hosts
			.iter()
			.map(|h| (h.host.clone(), h.clone()))
			.collect();
		RouteTable { routes, hosts }
	}

	/// Addresses that need a connection pool: the live host set, or with
	/// direct routing every distinct route host.
	pub fn pool_targets(&self) -> Vec<String> {
		if !self.hosts.is_empty() {
			return self
				.hosts
				.values()
				.filter(|h| h.status)
				.map(|h| h.host.clone())
				.collect();
		}
		let mut targets: Vec<String> = self
			.routes
			.values()
			.map(|d| d.host.clone())
			.filter(|h| !h.is_empty())
			.collect();
		targets.sort();
		targets.dedup();
		targets
	}

	pub fn dump(&self) -> Value {
		let routes: HashMap<&String, &Descriptor> =
			self.routes.iter().map(|(k, v)| (k, v.as_ref())).collect();
		json!({ "routes": routes, "hosts": self.hosts })
	}
}

/// Delivers the routing record; the transport behind it is opaque.
pub trait RegistryCenter: Send + Sync {
	fn load(&self) -> anyhow::Result<RouterConfig>;
}

/// File-backed registry center (JSON).
pub struct LocalCenter {
	path: PathBuf,
}

impl LocalCenter {
	pub fn new(path: impl Into<PathBuf>) -> LocalCenter {
		LocalCenter { path: path.into() }
	}
}

impl RegistryCenter for LocalCenter {
	fn load(&self) -> anyhow::Result<RouterConfig> {
		let raw = std::fs::read_to_string(&self.path)?;
		Ok(serde_json::from_str(&raw)?)
	}
}

struct RouteStateInner {
	table: RwLock<Arc<RouteTable>>,
	balance: Mutex<Box<dyn Balance>>,
}

/// The live routing state: an atomically swappable table plus the balancer
/// fed from its host set.
#[derive(Clone)]
pub struct RouteState {
	inner: Arc<RouteStateInner>,
}

impl RouteState {
	pub fn new(table: RouteTable, kind: BalanceKind) -> RouteState {
		let mut balance = new_balance(kind);
		for (addr, host) in &table.hosts {
			if host.status {
				balance.add(addr, host.weight);
			}
		}
		RouteState {
			inner: Arc::new(RouteStateInner {
				table: RwLock::new(Arc::new(table)),
				balance: Mutex::new(balance),
			}),
		}
	}

	pub fn table(&self) -> Arc<RouteTable> {
		self.inner.table.read().unwrap().clone()
	}

	/// Swaps in a rebuilt table and syncs the balancer's membership to the
	/// new host set.
	pub fn reload(&self, table: RouteTable) {
		{
			let mut balance = self.inner.balance.lock().unwrap();
			for (addr, host) in &table.hosts {
				if host.status {
					balance.add(addr, host.weight);
				}
			}
			for addr in balance.all() {
				let live = table.hosts.get(&addr).map(|h| h.status).unwrap_or(false);
				if !live {
					balance.remove(&addr);
				}
			}
		}
		*self.inner.table.write().unwrap() = Arc::new(table);
	}

	/// Adjusts a node's step weight; a delta of -1 drains the node.
	pub fn set_weight(&self, delta: i64, addr: &str) {
		self.inner.balance.lock().unwrap().set_weight(delta, addr);
	}

	/// Resolves the request's descriptor and picks a target: the balancer
	/// when a host set is configured, the route's own host otherwise.
	pub fn match_route(&self, data: &mut MetaData) -> Result<(), MeshError> {
		let table = self.table();
		let key = data.descriptor.route_key();
		let desc = table.routes.get(&key).ok_or(MeshError::NoRoute)?;

		data.descriptor.uri.service_name = desc.uri.service_name.clone();
		data.descriptor.uri.method = desc.uri.method.clone();
		data.descriptor.host = desc.host.clone();
		data.descriptor.request_message = desc.request_message.clone();
		data.descriptor.response_message = desc.response_message.clone();

		let target = if table.hosts.is_empty() {
			desc.host.clone()
		} else {
			self
				.inner
				.balance
				.lock()
				.unwrap()
				.next()
				.unwrap_or_default()
		};
		if target.is_empty() {
			return Err(MeshError::NoHost);
		}
		data.target = target;
		Ok(())
	}
}

/// Route matching as a middleware: fills the descriptor and target, writing
/// misses in-band so downstream filters still observe them.
pub struct RouteMatcher {
	state: RouteState,
}

impl RouteMatcher {
	pub fn new(state: RouteState) -> RouteMatcher {
		RouteMatcher { state }
	}
}

impl Feature for RouteMatcher {
	fn wrap(&self, next: Handler) -> Handler {
		Arc::new(MatcherWare {
			state: self.state.clone(),
			next,
		})
	}
}

struct MatcherWare {
	state: RouteState,
	next: Handler,
}

#[async_trait]
impl Handle for MatcherWare {
	async fn handle(&self, data: &mut MetaData) -> Result<(), MeshError> {
		match self.state.match_route(data) {
			Ok(()) => self.next.handle(data).await,
			Err(e) => {
				debug!(url = %data.descriptor.full_method(), "route match failed: {e}");
				e.absorb(data)
			},
		}
	}
}
