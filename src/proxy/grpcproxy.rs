use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::Future;
use futures::stream::Stream;
use futures::FutureExt;
use http::uri::PathAndQuery;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::codec::RawCodec;
use crate::config::is_debug;
use crate::metadata::MetaData;
use crate::middleware::Handler;
use crate::proxy::{MeshInputs, SYSTEM_ERROR, panic_message};

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

type BoxMessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// The RPC ingress: every service is "unknown" here, so each call is proxied
/// frame-by-frame to a pooled backend stream with no schema in sight.
pub struct GrpcIngress {
	inputs: Arc<MeshInputs>,
	chain: Handler,
}

impl GrpcIngress {
	pub fn new(inputs: Arc<MeshInputs>, chain: Handler) -> Arc<GrpcIngress> {
		Arc::new(GrpcIngress { inputs, chain })
	}

	pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
		let mut conns = JoinSet::new();
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(v) => v,
						Err(e) => {
							warn!("rpc accept failed: {e}");
							continue;
						},
					};
					let ingress = self.clone();
					conns.spawn(async move {
						let svc_ingress = ingress.clone();
						let svc = hyper::service::service_fn(move |req: http::Request<Incoming>| {
							let ingress = svc_ingress.clone();
							async move { Ok::<_, Infallible>(ingress.handle(peer, req).await) }
						});
						let mut builder = auto::Builder::new(TokioExecutor::new());
						builder.http2().timer(TokioTimer::new());
						if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
							debug!(%peer, "rpc connection closed: {e}");
						}
					});
				},
				Some(_) = conns.join_next(), if !conns.is_empty() => {},
				_ = shutdown.changed() => {
					info!("rpc ingress stopping, draining {} connections", conns.len());
					let deadline = time::sleep(DRAIN_DEADLINE);
					tokio::pin!(deadline);
					while !conns.is_empty() {
						tokio::select! {
							_ = conns.join_next() => {},
							_ = &mut deadline => {
								warn!("drain deadline expired, aborting {} connections", conns.len());
								conns.abort_all();
								break;
							},
						}
					}
					return;
				},
			}
		}
	}

	async fn handle(&self, peer: SocketAddr, req: http::Request<Incoming>) -> http::Response<Body> {
		match AssertUnwindSafe(self.proxy(peer, req)).catch_unwind().await {
			Ok(response) => response,
			Err(panic) => {
				let msg = panic_message(panic.as_ref());
				error!(%peer, "panic while proxying: {msg}");
				let shown = if is_debug() { msg } else { SYSTEM_ERROR.to_string() };
				status_response(Status::internal(shown))
			},
		}
	}

	async fn proxy(&self, peer: SocketAddr, req: http::Request<Incoming>) -> http::Response<Body> {
		let path = req.uri().path().to_string();
		let Some((service, method)) = parse_call_path(&path) else {
			return status_response(Status::internal(format!("{path} is wrong url")));
		};
		let call = ProxyCall {
			inputs: self.inputs.clone(),
			chain: self.chain.clone(),
			peer,
			service,
			method,
			path,
		};
		let mut grpc = tonic::server::Grpc::new(RawCodec);
		grpc.streaming(call, req).await
	}
}

/// `/service/method`, both segments non-empty.
fn parse_call_path(path: &str) -> Option<(String, String)> {
	let mut parts = path.trim_start_matches('/').split('/');
	match (parts.next(), parts.next(), parts.next()) {
		(Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
			Some((service.to_string(), method.to_string()))
		},
		_ => None,
	}
}

/// Trailers-only response carrying the status.
fn status_response(status: Status) -> http::Response<Body> {
	let mut response = http::Response::new(Body::empty());
	response.headers_mut().insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/grpc"),
	);
	let _ = status.add_header(response.headers_mut());
	response
}

struct ProxyCall {
	inputs: Arc<MeshInputs>,
	chain: Handler,
	peer: SocketAddr,
	service: String,
	method: String,
	path: String,
}

impl tonic::server::StreamingService<Bytes> for ProxyCall {
	type Response = Bytes;
	type ResponseStream = BoxMessageStream;
	type Future =
		Pin<Box<dyn Future<Output = Result<Response<BoxMessageStream>, Status>> + Send + 'static>>;

	fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
		let call = ProxyCall {
			inputs: self.inputs.clone(),
			chain: self.chain.clone(),
			peer: self.peer,
			service: std::mem::take(&mut self.service),
			method: std::mem::take(&mut self.method),
			path: std::mem::take(&mut self.path),
		};
		Box::pin(call.run(request))
	}
}

enum Forward {
	Aborted,
	Frame(Option<Result<Bytes, Status>>),
}

impl ProxyCall {
	async fn run(self, request: Request<Streaming<Bytes>>) -> Result<Response<BoxMessageStream>, Status> {
		let (meta, _ext, mut caller) = request.into_parts();

		let mut data = MetaData::default();
		data.descriptor.uri.service_name = self.service;
		data.descriptor.uri.method = self.method;
		data.peer = Some(self.peer);
		data.headers = meta.clone().into_headers();

		self
			.chain
			.handle(&mut data)
			.await
			.map_err(|e| e.to_status())?;
		if let Some(denied) = data.error() {
			return Err(Status::resource_exhausted(denied));
		}

		let pool = self.inputs.pool(&data.target).map_err(|e| e.to_status())?;
		let mut conn = pool.get().await.map_err(|e| e.to_status())?;

		// Caller-to-backend pump. EOF from the caller half-closes the backend
		// stream by dropping the sender; a read error cancels the whole call.
		let (tx, rx) = mpsc::channel::<Bytes>(16);
		let abort = CancellationToken::new();
		let pump_abort = abort.clone();
		tokio::spawn(async move {
			loop {
				match caller.next().await {
					Some(Ok(frame)) => {
						if tx.send(frame).await.is_err() {
							return;
						}
					},
					Some(Err(status)) => {
						debug!("caller stream failed: {status}");
						pump_abort.cancel();
						return;
					},
					None => return,
				}
			}
		});

		let mut grpc = tonic::client::Grpc::new(conn.channel());
		if let Err(e) = grpc.ready().await {
			conn.mark_broken();
			return Err(Status::unavailable(e.to_string()));
		}
		let path: PathAndQuery = self
			.path
			.parse()
			.map_err(|_| Status::internal("bad call path"))?;
		let mut outbound = Request::new(ReceiverStream::new(rx));
		*outbound.metadata_mut() = forwardable_metadata(&meta);

		// Resolves once the backend commits to response headers, so they are
		// installed on the server response before the first frame goes out.
		let response = match grpc.streaming(outbound, path, RawCodec).await {
			Ok(response) => response,
			Err(status) => {
				if status.code() == Code::Unavailable {
					conn.mark_broken();
				}
				return Err(status);
			},
		};
		let (backend_meta, mut backend, _ext) = response.into_parts();

		let out = async_stream::stream! {
			// the pooled borrow lives exactly as long as the proxied call
			let mut conn = conn;
			loop {
				let event = tokio::select! {
					_ = abort.cancelled() => Forward::Aborted,
					frame = backend.next() => Forward::Frame(frame),
				};
				match event {
					Forward::Aborted => {
						yield Err(Status::internal("failed proxying from caller"));
						break;
					},
					Forward::Frame(Some(Ok(frame))) => yield Ok(frame),
					Forward::Frame(Some(Err(status))) => {
						// the status already carries the backend's trailers
						if status.code() == Code::Unavailable {
							conn.mark_broken();
						}
						yield Err(status);
						break;
					},
					Forward::Frame(None) => {
						match backend.trailers().await {
							Ok(Some(trailers)) => {
								yield Err(Status::with_metadata(Code::Ok, String::new(), trailers));
							},
							Ok(None) => {},
							Err(status) => yield Err(status),
						}
						break;
					},
				}
			}
		};

		let mut response = Response::new(Box::pin(out) as BoxMessageStream);
		*response.metadata_mut() = backend_meta;
		Ok(response)
	}
}

/// Copies caller metadata onto the outgoing call, leaving out the hop-level
/// headers the client stack owns.
fn forwardable_metadata(meta: &MetadataMap) -> MetadataMap {
	let mut out = MetadataMap::new();
	for entry in meta.iter() {
		match entry {
			KeyAndValueRef::Ascii(key, value) => {
				if is_hop_header(key.as_str()) {
					continue;
				}
				out.append(key.clone(), value.clone());
			},
			KeyAndValueRef::Binary(key, value) => {
				out.append_bin(key.clone(), value.clone());
			},
		}
	}
	out
}

fn is_hop_header(name: &str) -> bool {
	matches!(
		name,
		"te" | "content-type" | "user-agent" | "host" | "connection" | "accept-encoding"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn call_path_shapes() {
		assert_eq!(
			parse_call_path("/greet.v1.Greeter/SayHello"),
			Some(("greet.v1.Greeter".to_string(), "SayHello".to_string()))
		);
		assert_eq!(parse_call_path("/onlyservice"), None);
		assert_eq!(parse_call_path("/a/b/c"), None);
		assert_eq!(parse_call_path("//x"), None);
	}

	#[test]
	fn hop_headers_are_not_forwarded() {
		let mut headers = http::HeaderMap::new();
		headers.insert("userid", http::HeaderValue::from_static("u"));
		headers.insert("te", http::HeaderValue::from_static("trailers"));
		headers.insert("content-type", http::HeaderValue::from_static("application/grpc"));
		let meta = MetadataMap::from_headers(headers);

		let out = forwardable_metadata(&meta);
		assert_eq!(out.get("userid").unwrap(), "u");
		assert!(out.get("te").is_none());
		assert!(out.get("content-type").is_none());
	}
}
