use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metadata::MetaData;
use crate::middleware::{Feature, Handle, Handler};
use crate::proxy::MeshError;

/// Global token bucket. A background task refills `rate` tokens once a
/// second up to `capacity`; requests drain one token each. The refill task
/// is the sole producer of increments.
#[derive(Clone)]
pub struct RateLimit {
	level: Arc<Mutex<u64>>,
	stop: CancellationToken,
}

impl RateLimit {
	pub fn new(capacity: u64, rate: u64) -> RateLimit {
		let level = Arc::new(Mutex::new(capacity));
		let stop = CancellationToken::new();
		let refill = level.clone();
		let cancelled = stop.clone();
		tokio::spawn(async move {
			let period = Duration::from_secs(1);
			let mut ticker = time::interval_at(Instant::now() + period, period);
			loop {
				tokio::select! {
					_ = cancelled.cancelled() => return,
					_ = ticker.tick() => {
						let mut level = refill.lock().unwrap();
						*level = (*level + rate).min(capacity);
					},
				}
			}
		});
		RateLimit { level, stop }
	}

	pub fn try_acquire(&self) -> bool {
		let mut level = self.level.lock().unwrap();
		if *level > 0 {
			*level -= 1;
			true
		} else {
			false
		}
	}
}

impl Feature for RateLimit {
	fn wrap(&self, next: Handler) -> Handler {
		Arc::new(RateLimitWare {
			limit: self.clone(),
			next,
		})
	}

	fn stop(&self) {
		self.stop.cancel();
	}
}

struct RateLimitWare {
	limit: RateLimit,
	next: Handler,
}

#[async_trait]
impl Handle for RateLimitWare {
	async fn handle(&self, data: &mut MetaData) -> Result<(), MeshError> {
		if self.limit.try_acquire() {
			self.next.handle(data).await
		} else {
			MeshError::BucketEmpty.absorb(data)
		}
	}
}

struct IpState {
	counts: HashMap<IpAddr, u32>,
	/// Secondary index for batch eviction: expiry second -> first-seen ips.
	expiry: HashMap<u64, Vec<IpAddr>>,
}

struct IpInner {
	state: Mutex<IpState>,
	window: u64,
	limit: u32,
	start: Instant,
}

impl IpInner {
	fn now_sec(&self) -> u64 {
		self.start.elapsed().as_secs()
	}
}

/// Per-IP admission: at most `limit` requests per ip within `window` seconds
/// of its first sighting. A once-a-second task is the sole evictor.
#[derive(Clone)]
pub struct IpLimit {
	inner: Arc<IpInner>,
	stop: CancellationToken,
}

impl IpLimit {
	pub fn new(window_secs: u64, limit: u32) -> IpLimit {
		let inner = Arc::new(IpInner {
			state: Mutex::new(IpState {
				counts: HashMap::new(),
				expiry: HashMap::new(),
			}),
			window: window_secs,
			limit,
			start: Instant::now(),
		});
		let stop = CancellationToken::new();
		let evict = inner.clone();
		let cancelled = stop.clone();
		tokio::spawn(async move {
			let period = Duration::from_secs(1);
			let mut ticker = time::interval_at(Instant::now() + period, period);
			loop {
				tokio::select! {
					_ = cancelled.cancelled() => return,
					_ = ticker.tick() => evict.sweep(),
				}
			}
		});
		IpLimit { inner, stop }
	}

	pub fn per_second(limit: u32) -> IpLimit {
		IpLimit::new(1, limit)
	}

	pub fn try_admit(&self, ip: IpAddr) -> bool {
		let deadline = self.inner.now_sec() + self.inner.window;
		let mut state = self.inner.state.lock().unwrap();
		match state.counts.get_mut(&ip) {
			Some(count) if *count >= self.inner.limit => false,
			Some(count) => {
				*count += 1;
				true
			},
			None => {
				state.counts.insert(ip, 1);
				state.expiry.entry(deadline).or_default().push(ip);
				true
			},
		}
	}
}

impl IpInner {
	fn sweep(&self) {
		let now = self.now_sec();
		let mut state = self.state.lock().unwrap();
		let due: Vec<u64> = state.expiry.keys().copied().filter(|sec| *sec <= now).collect();
		for sec in due {
			if let Some(ips) = state.expiry.remove(&sec) {
				for ip in ips {
					state.counts.remove(&ip);
				}
			}
		}
	}
}

impl Feature for IpLimit {
	fn wrap(&self, next: Handler) -> Handler {
		Arc::new(IpLimitWare {
			limit: self.clone(),
			next,
		})
	}

	fn stop(&self) {
		self.stop.cancel();
	}
}

struct IpLimitWare {
	limit: IpLimit,
	next: Handler,
}

#[async_trait]
impl Handle for IpLimitWare {
	async fn handle(&self, data: &mut MetaData) -> Result<(), MeshError> {
		let Some(peer) = data.peer else {
			warn!("no peer address on request, skipping ip admission");
			return self.next.handle(data).await;
		};
		if self.limit.try_admit(peer.ip()) {
			self.next.handle(data).await
		} else {
			MeshError::IpLimited.absorb(data)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn bucket_drains_and_refills() {
		let limit = RateLimit::new(2, 1);
		assert!(limit.try_acquire());
		assert!(limit.try_acquire());
		assert!(!limit.try_acquire());

		time::sleep(Duration::from_millis(1100)).await;
		assert!(limit.try_acquire());
		assert!(!limit.try_acquire());
		limit.stop();
	}

	#[tokio::test(start_paused = true)]
	async fn refill_clamps_at_capacity() {
		let limit = RateLimit::new(2, 5);
		assert!(limit.try_acquire());
		time::sleep(Duration::from_millis(1100)).await;
		assert!(limit.try_acquire());
		assert!(limit.try_acquire());
		assert!(!limit.try_acquire());
		limit.stop();
	}

	#[tokio::test(start_paused = true)]
	async fn ip_window_admits_up_to_limit() {
		let limit = IpLimit::per_second(1);
		let a: IpAddr = "1.2.3.4".parse().unwrap();
		let b: IpAddr = "5.6.7.8".parse().unwrap();
		assert!(limit.try_admit(a));
		assert!(!limit.try_admit(a));
		assert!(limit.try_admit(b));

		time::sleep(Duration::from_millis(2100)).await;
		assert!(limit.try_admit(a));
		limit.stop();
	}

	#[tokio::test(start_paused = true)]
	async fn counts_within_window() {
		let limit = IpLimit::new(30, 3);
		let a: IpAddr = "9.9.9.9".parse().unwrap();
		for _ in 0..3 {
			assert!(limit.try_admit(a));
		}
		assert!(!limit.try_admit(a));
		limit.stop();
	}
}
