use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::proxy::MeshError;

/// Opens one HTTP/2 connection to `target`. Injected so pools can be
/// exercised without a live backend.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
	async fn dial(&self, target: &str, opts: &PoolConfig) -> Result<Channel, MeshError>;
}

pub struct GrpcDialer;

#[async_trait]
impl Dialer for GrpcDialer {
	async fn dial(&self, target: &str, opts: &PoolConfig) -> Result<Channel, MeshError> {
		let endpoint = Endpoint::from_shared(format!("http://{target}"))
			.map_err(|e| MeshError::Unreachable {
				target: target.to_string(),
				reason: e.to_string(),
			})?
			.connect_timeout(opts.dial_timeout())
			.tcp_keepalive(Some(opts.keepalive()))
			.http2_keep_alive_interval(opts.keepalive());
		endpoint.connect().await.map_err(|e| MeshError::Unreachable {
			target: target.to_string(),
			reason: e.to_string(),
		})
	}
}

struct Idle {
	channel: Channel,
	last_used: Instant,
}

struct PoolState {
	idle: VecDeque<Idle>,
	/// Connections not yet fully closed: idle + in-use.
	open: usize,
	closed: bool,
}

struct PoolInner {
	target: String,
	opts: PoolConfig,
	dialer: Arc<dyn Dialer>,
	state: Mutex<PoolState>,
	released: Notify,
	sweep_stop: CancellationToken,
}

/// Bounded borrow/return pool of client connections for one backend address.
/// All state sits behind one mutex; waiters park on `released`.
#[derive(Clone)]
pub struct Pool {
	inner: Arc<PoolInner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
	pub target: String,
	pub open: usize,
	pub idle: usize,
	pub max_open: usize,
}

enum Plan {
	Idle(Channel),
	Dial,
	Wait,
}

impl Pool {
	pub fn new(target: impl Into<String>, opts: PoolConfig, dialer: Arc<dyn Dialer>) -> Pool {
		let inner = Arc::new(PoolInner {
			target: target.into(),
			opts,
			dialer,
			state: Mutex::new(PoolState {
				idle: VecDeque::new(),
				open: 0,
				closed: false,
			}),
			released: Notify::new(),
			sweep_stop: CancellationToken::new(),
		});
		Pool::spawn_sweeper(&inner);
		Pool { inner }
	}

	/// Evicts idle connections whose last use is older than the idle
	/// timeout. Holds only a weak reference so an abandoned pool unwinds.
	fn spawn_sweeper(inner: &Arc<PoolInner>) {
		let weak: Weak<PoolInner> = Arc::downgrade(inner);
		let stop = inner.sweep_stop.clone();
		let idle_timeout = inner.opts.idle_timeout();
		tokio::spawn(async move {
			let period = Duration::from_secs(1);
			let mut ticker = time::interval_at(Instant::now() + period, period);
			loop {
				tokio::select! {
					_ = stop.cancelled() => return,
					_ = ticker.tick() => {},
				}
				let Some(inner) = weak.upgrade() else { return };
				let now = Instant::now();
				let evicted = {
					let mut state = inner.state.lock().unwrap();
					let before = state.idle.len();
					state.idle.retain(|c| c.last_used + idle_timeout > now);
					let evicted = before - state.idle.len();
					state.open -= evicted;
					evicted
				};
				if evicted > 0 {
					debug!(pool = %inner.target, evicted, "evicted idle connections");
					inner.released.notify_waiters();
				}
			}
		});
	}

	/// Dials `initial_open` connections up front; failures are logged, not
	/// fatal — the pool dials again on demand.
	pub async fn warm(&self) {
		for _ in 0..self.inner.opts.initial_open {
			{
				let mut state = self.inner.state.lock().unwrap();
				if state.closed || state.open >= self.inner.opts.initial_open {
					return;
				}
				state.open += 1;
			}
			match self.dial_with_retries().await {
				Ok(channel) => {
					let mut state = self.inner.state.lock().unwrap();
					state.idle.push_back(Idle {
						channel,
						last_used: Instant::now(),
					});
				},
				Err(e) => {
					self.inner.state.lock().unwrap().open -= 1;
					warn!(pool = %self.inner.target, "warm dial failed: {e}");
					return;
				},
			}
		}
	}

	/// Borrows a connection: idle first, a fresh dial while under `max_open`,
	/// otherwise parks until a holder releases or the wait deadline fires.
	pub async fn get(&self) -> Result<PooledConn, MeshError> {
		let deadline = Instant::now() + self.inner.opts.wait_timeout();
		loop {
			match self.plan()? {
				Plan::Idle(channel) => return Ok(self.lend(channel)),
				Plan::Dial => match self.dial_with_retries().await {
					Ok(channel) => return Ok(self.lend(channel)),
					Err(e) => {
						self.inner.state.lock().unwrap().open -= 1;
						self.inner.released.notify_waiters();
						return Err(e);
					},
				},
				Plan::Wait => {},
			}

			// Register interest before the re-check so a release between the
			// check and the park is never lost.
			let notified = self.inner.released.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			match self.plan()? {
				Plan::Idle(channel) => return Ok(self.lend(channel)),
				Plan::Dial => match self.dial_with_retries().await {
					Ok(channel) => return Ok(self.lend(channel)),
					Err(e) => {
						self.inner.state.lock().unwrap().open -= 1;
						self.inner.released.notify_waiters();
						return Err(e);
					},
				},
				Plan::Wait => {
					if time::timeout_at(deadline, notified).await.is_err() {
						return Err(MeshError::PoolExhausted(self.inner.target.clone()));
					}
				},
			}
		}
	}

	fn plan(&self) -> Result<Plan, MeshError> {
		let mut state = self.inner.state.lock().unwrap();
		if state.closed {
			return Err(MeshError::PoolClosed(self.inner.target.clone()));
		}
		if let Some(idle) = state.idle.pop_front() {
			return Ok(Plan::Idle(idle.channel));
		}
		if state.open < self.inner.opts.max_open {
			state.open += 1;
			return Ok(Plan::Dial);
		}
		Ok(Plan::Wait)
	}

	fn lend(&self, channel: Channel) -> PooledConn {
		PooledConn {
			channel,
			pool: self.inner.clone(),
			broken: false,
		}
	}

	async fn dial_with_retries(&self) -> Result<Channel, MeshError> {
		let mut delay = Duration::from_millis(100);
		let mut last = None;
		for attempt in 0..=self.inner.opts.dial_retries {
			match self
				.inner
				.dialer
				.dial(&self.inner.target, &self.inner.opts)
				.await
			{
				Ok(channel) => return Ok(channel),
				Err(e) => {
					debug!(pool = %self.inner.target, attempt, "dial failed: {e}");
					last = Some(e);
					time::sleep(delay).await;
					delay = (delay * 2).min(Duration::from_secs(2));
				},
			}
		}
		Err(last.unwrap_or_else(|| MeshError::Unreachable {
			target: self.inner.target.clone(),
			reason: "dial never attempted".to_string(),
		}))
	}

	/// Marks the pool closed, drains the idle queue and wakes every waiter.
	/// In-flight holders unwind their open slots on release.
	pub fn close(&self) {
		{
			let mut state = self.inner.state.lock().unwrap();
			state.closed = true;
			let idle = state.idle.len();
			state.idle.clear();
			state.open -= idle;
		}
		self.inner.sweep_stop.cancel();
		self.inner.released.notify_waiters();
	}

	pub fn stats(&self) -> PoolStats {
		let state = self.inner.state.lock().unwrap();
		PoolStats {
			target: self.inner.target.clone(),
			open: state.open,
			idle: state.idle.len(),
			max_open: self.inner.opts.max_open,
		}
	}
}

/// A borrowed connection, exclusively owned until dropped. Dropping returns
/// it to the idle queue unless it was marked broken, the queue is full or
/// the pool has closed — those tear it down instead.
pub struct PooledConn {
	channel: Channel,
	pool: Arc<PoolInner>,
	broken: bool,
}

impl PooledConn {
	pub fn channel(&self) -> Channel {
		self.channel.clone()
	}

	/// Flags a fatal transport error; the connection will not be reused.
	pub fn mark_broken(&mut self) {
		self.broken = true;
	}
}

impl std::fmt::Debug for PooledConn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledConn").field("broken", &self.broken).finish()
	}
}

impl Drop for PooledConn {
	fn drop(&mut self) {
		{
			let mut state = self.pool.state.lock().unwrap();
			if state.closed || self.broken || state.idle.len() >= self.pool.opts.max_idle {
				state.open = state.open.saturating_sub(1);
			} else {
				state.idle.push_back(Idle {
					channel: self.channel.clone(),
					last_used: Instant::now(),
				});
			}
		}
		self.pool.released.notify_waiters();
	}
}
