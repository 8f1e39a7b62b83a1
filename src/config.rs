use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `gateway_isdebug=1` hides error details from client responses.
pub fn is_debug() -> bool {
	env::var("gateway_isdebug").map(|v| v != "1").unwrap_or(true)
}

/// The record delivered by a registry center: the live host set plus one
/// entry per routable backend method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
	#[serde(default)]
	pub hosts: Vec<HostConfig>,
	#[serde(default)]
	pub routers: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
	pub host: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
	#[serde(default = "default_true")]
	pub status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
	pub service_name: String,
	pub method: String,
	#[serde(default)]
	pub host: String,
	#[serde(default)]
	pub method_type: String,
	#[serde(default)]
	pub in_message: String,
	#[serde(default)]
	pub out_message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BalanceKind {
	#[default]
	RoundRobin,
	WeightRobin,
}

/// `nohook` disables the watcher, `onlyhook` serves nothing but the watcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HttpMode {
	#[default]
	Full,
	Nohook,
	Onlyhook,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
	#[default]
	String,
	Int,
	Float,
}

/// URL grammar for the HTTP ingress. `Default` is `/{service-with-dashes}/{method}`;
/// `Param` is `/{pkg}-{svc}-{method}/{value}` with the value bound under `key`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PathGrammar {
	#[default]
	Default,
	Param { key: String, kind: ParamKind },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
	pub initial_open: usize,
	pub max_open: usize,
	pub max_idle: usize,
	pub idle_timeout_secs: u64,
	pub dial_timeout_secs: u64,
	pub dial_retries: u32,
	pub keepalive_secs: u64,
	pub wait_timeout_secs: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			initial_open: 1,
			max_open: 16,
			max_idle: 8,
			idle_timeout_secs: 90,
			dial_timeout_secs: 5,
			dial_retries: 2,
			keepalive_secs: 30,
			wait_timeout_secs: 10,
		}
	}
}

impl PoolConfig {
	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.idle_timeout_secs)
	}
	pub fn dial_timeout(&self) -> Duration {
		Duration::from_secs(self.dial_timeout_secs)
	}
	pub fn keepalive(&self) -> Duration {
		Duration::from_secs(self.keepalive_secs)
	}
	pub fn wait_timeout(&self) -> Duration {
		Duration::from_secs(self.wait_timeout_secs)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	pub capacity: u64,
	pub rate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpLimitConfig {
	pub window_secs: u64,
	pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub http_addr: SocketAddr,
	pub grpc_addr: SocketAddr,
	pub mode: HttpMode,
	pub path: PathGrammar,
	/// Header names copied from the HTTP request onto outgoing call metadata.
	pub header_filter: Vec<String>,
	/// Remote addresses allowed to hit `/watcher`; empty allows everyone.
	pub hook_whitelist: Vec<String>,
	pub balance: BalanceKind,
	pub pool: PoolConfig,
	pub rate_limit: Option<RateLimitConfig>,
	pub ip_limit: Option<IpLimitConfig>,
	pub router: RouterConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			http_addr: "0.0.0.0:8080".parse().expect("static addr"),
			grpc_addr: "0.0.0.0:8000".parse().expect("static addr"),
			mode: HttpMode::default(),
			path: PathGrammar::default(),
			header_filter: Vec::new(),
			hook_whitelist: Vec::new(),
			balance: BalanceKind::default(),
			pool: PoolConfig::default(),
			rate_limit: None,
			ip_limit: None,
			router: RouterConfig::default(),
		}
	}
}

fn default_weight() -> u32 {
	1
}

fn default_true() -> bool {
	true
}
