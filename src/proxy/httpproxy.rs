use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::FutureExt;
use http::uri::PathAndQuery;
use http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};
use tonic::Code;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tracing::{debug, error};

use crate::codec::RawCodec;
use crate::config::{HttpMode, PathGrammar, is_debug};
use crate::metadata::{
	CallResult, MetaData, assemble_payload, parse_default_path, parse_param_path,
};
use crate::middleware::{Handle, Handler};
use crate::pool::PoolStats;
use crate::proxy::{MeshError, MeshInputs, SYSTEM_ERROR, panic_message};
use crate::registry::DynMessage;

const MAX_BODY: usize = 4 * 1024 * 1024;

/// Invoked after a successful typed call with the response message and the
/// backend's reply metadata; may stamp extra response headers.
pub type AfterHandler =
	Arc<dyn Fn(&dyn DynMessage, &MetadataMap, &mut HeaderMap) -> Result<(), MeshError> + Send + Sync>;

/// The HTTP ingress: parses the URL into a call descriptor, runs the shared
/// chain and transcodes the merged JSON payload into a typed unary call.
pub struct HttpIngress {
	inputs: Arc<MeshInputs>,
	chain: Handler,
	after: Option<AfterHandler>,
}

impl HttpIngress {
	pub fn new(inputs: Arc<MeshInputs>, chain: Handler, after: Option<AfterHandler>) -> Arc<HttpIngress> {
		Arc::new(HttpIngress {
			inputs,
			chain,
			after,
		})
	}

	pub fn router(self: Arc<Self>) -> Router {
		let mode = self.inputs.cfg.mode;
		let mut router = Router::new();
		if mode != HttpMode::Onlyhook {
			router = router.fallback(handle);
		}
		if mode != HttpMode::Nohook {
			router = router.route("/watcher", get(watcher));
		}
		router.with_state(self)
	}

	async fn serve_call(&self, peer: SocketAddr, req: axum::extract::Request) -> Response {
		let (parts, body) = req.into_parts();
		let mut data = MetaData::default();
		data.peer = Some(peer);
		data.headers = parts.headers.clone();

		match self.run(&mut data, &parts, body).await {
			Ok(()) => {},
			Err(e) => {
				error!(path = parts.uri.path(), "request failed: {e}");
				let body = json!({ "error": mask(&e.to_string()) });
				return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
			},
		}

		let mut reply_headers = HeaderMap::new();
		if let (Some(CallResult::Message(msg)), Some(after)) = (&data.result, &self.after) {
			let backend_meta = data.reply_metadata.clone().unwrap_or_default();
			if let Err(e) = after(msg.as_ref(), &backend_meta, &mut reply_headers) {
				debug!("after handler failed: {e}");
				data.set_error(mask(&e.to_string()));
			}
		}

		let body = match &data.result {
			Some(result) => match result.to_json() {
				Ok(value) => value,
				Err(e) => {
					error!("response encode failed: {e}");
					let body = json!({ "error": mask(&e.to_string()) });
					return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
				},
			},
			None => Value::Null,
		};
		(StatusCode::OK, reply_headers, axum::Json(body)).into_response()
	}

	async fn run(
		&self,
		data: &mut MetaData,
		parts: &http::request::Parts,
		body: axum::body::Body,
	) -> Result<(), MeshError> {
		let parsed = match &self.inputs.cfg.path {
			PathGrammar::Default => parse_default_path(parts.uri.path()),
			PathGrammar::Param { key, kind } => parse_param_path(parts.uri.path(), key, *kind),
		};
		let mut uri = match parsed {
			Ok(uri) => uri,
			Err(e) => return e.absorb(data),
		};
		uri.http_verb = parts.method.to_string();
		data.descriptor.uri = uri;

		let bytes = axum::body::to_bytes(body, MAX_BODY)
			.await
			.map_err(|e| MeshError::Codec(e.to_string()))?;
		let is_form = parts
			.headers
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.starts_with("application/x-www-form-urlencoded"))
			.unwrap_or(false);
		let (form, json_body) = if is_form {
			(Some(bytes.as_ref()), None)
		} else {
			(None, Some(bytes.as_ref()))
		};
		match assemble_payload(parts.uri.query(), form, json_body, &data.descriptor.uri.params) {
			Ok(payload) => data.payload = payload,
			Err(e) => return e.absorb(data),
		}

		self.chain.handle(data).await
	}
}

async fn handle(
	State(ingress): State<Arc<HttpIngress>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: axum::extract::Request,
) -> Response {
	match AssertUnwindSafe(ingress.serve_call(peer, req)).catch_unwind().await {
		Ok(response) => response,
		Err(panic) => {
			let msg = panic_message(panic.as_ref());
			error!(%peer, "panic while serving http: {msg}");
			(StatusCode::INTERNAL_SERVER_ERROR, mask(&msg)).into_response()
		},
	}
}

/// Read-only inspector: the live route table, host set and pool statistics.
async fn watcher(
	State(ingress): State<Arc<HttpIngress>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
	let allow = &ingress.inputs.cfg.hook_whitelist;
	if !allow.is_empty() {
		let ip = peer.ip().to_string();
		let addr = peer.to_string();
		let admitted = allow
			.iter()
			.any(|a| a.eq_ignore_ascii_case(&ip) || a.eq_ignore_ascii_case(&addr));
		if !admitted {
			return (
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("the host {addr} is not in the hook whitelist"),
			)
				.into_response();
		}
	}

	let mut dump = ingress.inputs.routes.table().dump();
	let pools: Vec<PoolStats> = ingress.inputs.pools.values().map(|p| p.stats()).collect();
	dump["pools"] = json!(pools);
	axum::Json(dump).into_response()
}

fn mask(msg: &str) -> String {
	if is_debug() {
		msg.to_string()
	} else {
		SYSTEM_ERROR.to_string()
	}
}

/// Terminal handler: materialises the typed request/response pair, fills the
/// request from the merged payload and performs the unary backend call over
/// a pooled connection.
pub struct HttpInvoke {
	inputs: Arc<MeshInputs>,
}

impl HttpInvoke {
	pub fn new(inputs: Arc<MeshInputs>) -> HttpInvoke {
		HttpInvoke { inputs }
	}

	fn projected_headers(&self, headers: &HeaderMap) -> MetadataMap {
		let mut md = MetadataMap::new();
		for name in &self.inputs.cfg.header_filter {
			let lower = name.to_ascii_lowercase();
			let Some(value) = headers.get(lower.as_str()).and_then(|v| v.to_str().ok()) else {
				continue;
			};
			let Ok(key) = lower.parse::<MetadataKey<Ascii>>() else {
				continue;
			};
			let Ok(value) = MetadataValue::<Ascii>::try_from(value) else {
				continue;
			};
			md.append(key, value);
		}
		md
	}
}

#[async_trait]
impl Handle for HttpInvoke {
	async fn handle(&self, data: &mut MetaData) -> Result<(), MeshError> {
		let mut req = match self.materialize(data) {
			Ok(pair) => pair,
			Err(e) => return e.absorb(data),
		};

		let pool = self.inputs.pool(&data.target)?;
		let mut conn = pool.get().await?;

		let mut outbound = tonic::Request::new(req.0.encode_frame());
		*outbound.metadata_mut() = self.projected_headers(&data.headers);

		let mut grpc = tonic::client::Grpc::new(conn.channel());
		if let Err(e) = grpc.ready().await {
			conn.mark_broken();
			return Err(MeshError::Unreachable {
				target: data.target.clone(),
				reason: e.to_string(),
			});
		}
		let path: PathAndQuery = data
			.descriptor
			.full_method()
			.parse()
			.map_err(|_| MeshError::Codec("bad call path".to_string()))?;
		let response = match grpc.unary(outbound, path, RawCodec).await {
			Ok(response) => response,
			Err(status) => {
				if status.code() == Code::Unavailable {
					conn.mark_broken();
				}
				return Err(MeshError::Upstream(status));
			},
		};

		let (meta, frame, _ext) = response.into_parts();
		req.1.merge_frame(frame)?;
		data.reply_metadata = Some(meta);
		data.result = Some(CallResult::Message(req.1));
		Ok(())
	}
}

impl HttpInvoke {
	/// Builds the request/response pair from the registry and fills the
	/// request from the merged payload. Failures here are the caller's
	/// doing, so they ride in-band.
	fn materialize(
		&self,
		data: &mut MetaData,
	) -> Result<(Box<dyn DynMessage>, Box<dyn DynMessage>), MeshError> {
		let mut req = self
			.inputs
			.registry
			.materialize(&data.descriptor.request_message)?;
		let res = self
			.inputs
			.registry
			.materialize(&data.descriptor.response_message)?;
		if !data.payload.is_empty() {
			req.merge_json(&Value::Object(data.payload.clone()))?;
		}
		Ok((req, res))
	}
}
