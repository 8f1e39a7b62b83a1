use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{Config, HttpMode};
use crate::limit::{IpLimit, RateLimit};
use crate::middleware::{Feature, NoopTerminal, chain};
use crate::pool::{Dialer, GrpcDialer, Pool};
use crate::proxy::MeshInputs;
use crate::proxy::grpcproxy::GrpcIngress;
use crate::proxy::httpproxy::{AfterHandler, HttpIngress, HttpInvoke};
use crate::registry::MessageRegistry;
use crate::route::{RouteMatcher, RouteState, RouteTable};
use crate::signal::StopSignal;

/// Co-hosts both ingresses over one pool map, one route table and one
/// middleware set. Startup: routes -> registry check -> pools -> middlewares
/// -> bind -> serve; shutdown runs the same order in reverse.
pub struct Gateway {
	inputs: Arc<MeshInputs>,
	http_features: Vec<Arc<dyn Feature>>,
	rpc_features: Vec<Arc<dyn Feature>>,
	after: Option<AfterHandler>,
}

impl Gateway {
	pub fn new(cfg: Config, registry: MessageRegistry) -> anyhow::Result<Gateway> {
		Gateway::with_dialer(cfg, registry, Arc::new(GrpcDialer))
	}

	/// Must run inside a tokio runtime: configured admission middlewares
	/// start their tickers here.
	pub fn with_dialer(
		cfg: Config,
		registry: MessageRegistry,
		dialer: Arc<dyn Dialer>,
	) -> anyhow::Result<Gateway> {
		let cfg = Arc::new(cfg);
		let table = RouteTable::build(&cfg.router);
		if cfg.mode != HttpMode::Onlyhook {
			registry
				.validate(&table)
				.context("route table references messages the registry cannot resolve")?;
		}

		let targets = table.pool_targets();
		if targets.is_empty() {
			bail!("no backend targets to pool: empty host set and no route hosts");
		}
		let mut pools = HashMap::new();
		for target in targets {
			pools.insert(
				target.clone(),
				Pool::new(target, cfg.pool.clone(), dialer.clone()),
			);
		}

		let routes = RouteState::new(table, cfg.balance);
		let inputs = Arc::new(MeshInputs {
			cfg: cfg.clone(),
			routes,
			registry: Arc::new(registry),
			pools,
		});

		let mut gateway = Gateway {
			inputs,
			http_features: Vec::new(),
			rpc_features: Vec::new(),
			after: None,
		};
		if let Some(rl) = &cfg.rate_limit {
			gateway.use_both(Arc::new(RateLimit::new(rl.capacity, rl.rate)));
		}
		if let Some(il) = &cfg.ip_limit {
			gateway.use_both(Arc::new(IpLimit::new(il.window_secs, il.limit)));
		}
		Ok(gateway)
	}

	/// Middleware execution order matches registration order.
	pub fn use_http(&mut self, feature: Arc<dyn Feature>) -> &mut Self {
		self.http_features.push(feature);
		self
	}

	pub fn use_rpc(&mut self, feature: Arc<dyn Feature>) -> &mut Self {
		self.rpc_features.push(feature);
		self
	}

	pub fn use_both(&mut self, feature: Arc<dyn Feature>) -> &mut Self {
		self.http_features.push(feature.clone());
		self.rpc_features.push(feature);
		self
	}

	pub fn set_after_handler(&mut self, after: AfterHandler) -> &mut Self {
		self.after = Some(after);
		self
	}

	/// Freezes the chains, warms the pools and binds both listeners.
	pub async fn bind(self) -> anyhow::Result<BoundGateway> {
		let inputs = self.inputs;

		let mut http_set = self.http_features.clone();
		http_set.push(Arc::new(RouteMatcher::new(inputs.routes.clone())));
		let http_chain = chain(&http_set, Arc::new(HttpInvoke::new(inputs.clone())));

		let mut rpc_set = self.rpc_features.clone();
		rpc_set.push(Arc::new(RouteMatcher::new(inputs.routes.clone())));
		let rpc_chain = chain(&rpc_set, Arc::new(NoopTerminal));

		let mut features = self.http_features;
		features.extend(self.rpc_features);

		for pool in inputs.pools.values() {
			pool.warm().await;
		}

		let http_listener = TcpListener::bind(inputs.cfg.http_addr)
			.await
			.with_context(|| format!("binding http ingress {}", inputs.cfg.http_addr))?;
		let grpc_listener = TcpListener::bind(inputs.cfg.grpc_addr)
			.await
			.with_context(|| format!("binding rpc ingress {}", inputs.cfg.grpc_addr))?;
		let http_addr = http_listener.local_addr()?;
		let grpc_addr = grpc_listener.local_addr()?;
		info!(%http_addr, %grpc_addr, "gateway listening");

		Ok(BoundGateway {
			http: HttpIngress::new(inputs.clone(), http_chain, self.after),
			rpc: GrpcIngress::new(inputs.clone(), rpc_chain),
			inputs,
			features,
			http_listener,
			grpc_listener,
			http_addr,
			grpc_addr,
		})
	}
}

pub struct BoundGateway {
	inputs: Arc<MeshInputs>,
	features: Vec<Arc<dyn Feature>>,
	http: Arc<HttpIngress>,
	rpc: Arc<GrpcIngress>,
	http_listener: TcpListener,
	grpc_listener: TcpListener,
	pub http_addr: SocketAddr,
	pub grpc_addr: SocketAddr,
}

impl BoundGateway {
	/// Handle for the registry watcher: reload tables and adjust weights
	/// while serving.
	pub fn routes(&self) -> crate::route::RouteState {
		self.inputs.routes.clone()
	}

	pub async fn serve(self, stop: StopSignal) -> anyhow::Result<()> {
		let (stop_tx, stop_rx) = watch::channel(false);
		let mut ingresses = JoinSet::new();

		let router = self
			.http
			.router()
			.into_make_service_with_connect_info::<SocketAddr>();
		let mut http_stop = stop_rx.clone();
		let http_listener = self.http_listener;
		ingresses.spawn(async move {
			let served = axum::serve(http_listener, router)
				.with_graceful_shutdown(async move {
					let _ = http_stop.changed().await;
				})
				.await;
			if let Err(e) = served {
				error!("http ingress exited: {e}");
			}
		});
		ingresses.spawn(self.rpc.serve(self.grpc_listener, stop_rx));

		tokio::select! {
			_ = stop.stopped() => info!("gateway shutting down"),
			Some(res) = ingresses.join_next() => error!("ingress exited early: {res:?}"),
		}

		// Reverse of startup: stop accepting, drain, stop middlewares, close pools.
		let _ = stop_tx.send(true);
		while ingresses.join_next().await.is_some() {}
		for feature in &self.features {
			feature.stop();
		}
		for pool in self.inputs.pools.values() {
			pool.close();
		}
		Ok(())
	}
}
