use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use http::uri::PathAndQuery;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use prost::Message;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tonic::{Request, Status, Streaming};

use meshgate::codec::RawCodec;
use meshgate::config::{
	Config, HostConfig, IpLimitConfig, RateLimitConfig, RouteConfig, RouterConfig,
};
use meshgate::proxy::gateway::Gateway;
use meshgate::registry::MessageRegistry;
use meshgate::signal::StopSignal;

type RawStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct HelloReq {
	#[prost(string, tag = "1")]
	#[serde(default)]
	name: String,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct HelloRep {
	#[prost(string, tag = "1")]
	#[serde(default)]
	message: String,
}

/// Raw-codec echo backend: concatenates the names from every request frame,
/// replies `tests 1:<names>` once the caller half-closes, echoes the
/// `userid` request header and stamps `test=test` on the reply headers.
#[derive(Clone)]
struct EchoBackend;

impl tonic::server::StreamingService<Bytes> for EchoBackend {
	type Response = Bytes;
	type ResponseStream = RawStream;
	type Future =
		Pin<Box<dyn Future<Output = Result<tonic::Response<Self::ResponseStream>, Status>> + Send>>;

	fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
		Box::pin(async move {
			let (meta, _ext, mut frames) = request.into_parts();
			let mut names = String::new();
			while let Some(frame) = frames.message().await? {
				let req = HelloReq::decode(frame).map_err(|e| Status::invalid_argument(e.to_string()))?;
				names.push_str(&req.name);
			}
			let rep = HelloRep {
				message: format!("tests 1:{names}"),
			};
			let out: Self::ResponseStream =
				Box::pin(tokio_stream::once(Ok(Bytes::from(rep.encode_to_vec()))));
			let mut response = tonic::Response::new(out);
			response
				.metadata_mut()
				.insert("test", "test".parse().unwrap());
			if let Some(userid) = meta.get("userid") {
				response.metadata_mut().insert("userid-echo", userid.clone());
			}
			Ok(response)
		})
	}
}

async fn spawn_backend() -> SocketAddr {
	spawn_backend_with(EchoBackend).await
}

async fn spawn_backend_with<S>(svc: S) -> SocketAddr
where
	S: tonic::server::StreamingService<Bytes, Response = Bytes, ResponseStream = RawStream>
		+ Clone
		+ Send
		+ 'static,
	S::Future: Send,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let conn_svc = svc.clone();
			tokio::spawn(async move {
				let service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
					let svc = conn_svc.clone();
					async move {
						let mut grpc = tonic::server::Grpc::new(RawCodec);
						Ok::<_, Infallible>(grpc.streaming(svc, req).await)
					}
				});
				let mut builder = auto::Builder::new(TokioExecutor::new());
				builder.http2().timer(TokioTimer::new());
				let _ = builder.serve_connection(TokioIo::new(stream), service).await;
			});
		}
	});
	addr
}

async fn start_gateway(
	backend: SocketAddr,
	mutate: impl FnOnce(&mut Config),
) -> (SocketAddr, SocketAddr) {
	let mut cfg = Config {
		http_addr: "127.0.0.1:0".parse().unwrap(),
		grpc_addr: "127.0.0.1:0".parse().unwrap(),
		..Default::default()
	};
	cfg.router = RouterConfig {
		hosts: vec![HostConfig {
			host: backend.to_string(),
			weight: 1,
			status: true,
		}],
		routers: vec![RouteConfig {
			service_name: "greet.v1.Greeter".into(),
			method: "SayHello".into(),
			host: String::new(),
			method_type: "GET".into(),
			in_message: "greet.v1.HelloReq".into(),
			out_message: "greet.v1.HelloRep".into(),
		}],
	};
	mutate(&mut cfg);

	let mut registry = MessageRegistry::default();
	registry.register::<HelloReq>("greet.v1.HelloReq");
	registry.register::<HelloRep>("greet.v1.HelloRep");

	let gateway = Gateway::new(cfg, registry).unwrap();
	let bound = gateway.bind().await.unwrap();
	let addrs = (bound.http_addr, bound.grpc_addr);
	tokio::spawn(bound.serve(StopSignal::manual()));
	addrs
}

#[tokio::test]
async fn http_transcodes_to_typed_backend_call() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |_| {}).await;

	let body: serde_json::Value =
		reqwest::get(format!("http://{http}/greet-v1-Greeter/SayHello?name=x"))
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
	assert_eq!(body, serde_json::json!({"message": "tests 1:x"}));
}

#[tokio::test]
async fn http_json_body_reaches_backend() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |_| {}).await;

	let client = reqwest::Client::new();
	let body: serde_json::Value = client
		.post(format!("http://{http}/greet-v1-Greeter/SayHello"))
		.json(&serde_json::json!({"name": "bodied"}))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(body, serde_json::json!({"message": "tests 1:bodied"}));
}

#[tokio::test]
async fn unknown_route_is_in_band() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |_| {}).await;

	let response = reqwest::get(format!("http://{http}/none-x/y")).await.unwrap();
	assert_eq!(response.status(), 200);
	let body: serde_json::Value = response.json().await.unwrap();
	assert_eq!(body, serde_json::json!({"error": "no router here"}));
}

#[tokio::test]
async fn token_bucket_denies_in_band() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |cfg| {
		cfg.rate_limit = Some(RateLimitConfig {
			capacity: 1,
			rate: 1,
		});
	})
	.await;

	let url = format!("http://{http}/greet-v1-Greeter/SayHello?name=x");
	let first: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
	assert_eq!(first, serde_json::json!({"message": "tests 1:x"}));

	let second = reqwest::get(&url).await.unwrap();
	assert_eq!(second.status(), 200);
	let second: serde_json::Value = second.json().await.unwrap();
	assert_eq!(second, serde_json::json!({"error": "the token bucket is empty"}));
}

#[tokio::test]
async fn ip_limit_denies_in_band() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |cfg| {
		cfg.ip_limit = Some(IpLimitConfig {
			window_secs: 60,
			limit: 1,
		});
	})
	.await;

	let url = format!("http://{http}/greet-v1-Greeter/SayHello?name=x");
	let first: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
	assert_eq!(first, serde_json::json!({"message": "tests 1:x"}));

	let second: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
	assert_eq!(second, serde_json::json!({"error": "the IP is limited"}));
}

#[tokio::test]
async fn watcher_dumps_state_and_honors_whitelist() {
	let backend = spawn_backend().await;
	let (http, _) = start_gateway(backend, |_| {}).await;

	let dump: serde_json::Value = reqwest::get(format!("http://{http}/watcher"))
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(dump["routes"]["/greet.v1.greeter/sayhello"].is_object());
	assert!(dump["pools"].is_array());

	let (guarded, _) = start_gateway(backend, |cfg| {
		cfg.hook_whitelist = vec!["10.9.9.9".into()];
	})
	.await;
	let denied = reqwest::get(format!("http://{guarded}/watcher")).await.unwrap();
	assert_eq!(denied.status(), 500);
}

#[tokio::test]
async fn rpc_proxy_forwards_frames_and_headers() {
	let backend = spawn_backend().await;
	let (_, grpc_addr) = start_gateway(backend, |_| {}).await;

	let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))
		.unwrap()
		.connect()
		.await
		.unwrap();
	let mut grpc = tonic::client::Grpc::new(channel);
	grpc.ready().await.unwrap();

	let mut request = Request::new(Bytes::from(
		HelloReq { name: "x".into() }.encode_to_vec(),
	));
	request
		.metadata_mut()
		.insert("userid", "u".parse().unwrap());
	let path: PathAndQuery = "/greet.v1.Greeter/SayHello".parse().unwrap();
	let response = grpc.unary(request, path, RawCodec).await.unwrap();

	assert_eq!(response.metadata().get("test").unwrap(), "test");
	assert_eq!(response.metadata().get("userid-echo").unwrap(), "u");
	let rep = HelloRep::decode(response.into_inner()).unwrap();
	assert_eq!(rep.message, "tests 1:x");
}

#[tokio::test]
async fn rpc_proxy_half_close_carries_client_stream() {
	let backend = spawn_backend().await;
	let (_, grpc_addr) = start_gateway(backend, |_| {}).await;

	let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))
		.unwrap()
		.connect()
		.await
		.unwrap();
	let mut grpc = tonic::client::Grpc::new(channel);
	grpc.ready().await.unwrap();

	let frames = vec![
		Bytes::from(HelloReq { name: "a".into() }.encode_to_vec()),
		Bytes::from(HelloReq { name: "b".into() }.encode_to_vec()),
	];
	let path: PathAndQuery = "/greet.v1.Greeter/SayHello".parse().unwrap();
	let response = grpc
		.streaming(Request::new(tokio_stream::iter(frames)), path, RawCodec)
		.await
		.unwrap();

	let mut inbound = response.into_inner();
	let frame = inbound.message().await.unwrap().unwrap();
	let rep = HelloRep::decode(frame).unwrap();
	assert_eq!(rep.message, "tests 1:ab");
	assert!(inbound.message().await.unwrap().is_none());
}

/// Sends one teardown event when its response stream is dropped, however the
/// call ends.
struct EventOnDrop(mpsc::UnboundedSender<&'static str>);

impl Drop for EventOnDrop {
	fn drop(&mut self) {
		let _ = self.0.send("torn down");
	}
}

/// Backend for the cancellation scenario: replies one frame immediately so
/// the call is mid-stream, then parks on the request stream. It never ends
/// the call on its own, so only a caller-side cancellation propagated by the
/// gateway can unblock it.
#[derive(Clone)]
struct CancelProbeBackend {
	events: mpsc::UnboundedSender<&'static str>,
}

impl tonic::server::StreamingService<Bytes> for CancelProbeBackend {
	type Response = Bytes;
	type ResponseStream = RawStream;
	type Future =
		Pin<Box<dyn Future<Output = Result<tonic::Response<Self::ResponseStream>, Status>> + Send>>;

	fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
		let events = self.events.clone();
		Box::pin(async move {
			let (_meta, _ext, mut frames) = request.into_parts();
			let _ = events.send("started");
			let out = async_stream::stream! {
				let _guard = EventOnDrop(events.clone());
				let rep = HelloRep {
					message: "mid-stream".into(),
				};
				yield Ok(Bytes::from(rep.encode_to_vec()));
				loop {
					match frames.message().await {
						Ok(Some(_)) => {},
						Ok(None) => {
							let _ = events.send("eof");
							// stay open; dropping this stream is the only way out
							std::future::pending::<()>().await;
						},
						Err(_) => {
							let _ = events.send("reset");
							break;
						},
					}
				}
			};
			Ok(tonic::Response::new(Box::pin(out) as RawStream))
		})
	}
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
	tokio::time::timeout(Duration::from_secs(5), events.recv())
		.await
		.expect("timed out waiting for backend event")
		.expect("backend event channel closed")
}

#[tokio::test]
async fn rpc_proxy_cancellation_unblocks_both_sides() {
	let (events_tx, mut events) = mpsc::unbounded_channel();
	let backend = spawn_backend_with(CancelProbeBackend { events: events_tx }).await;
	let (http, grpc_addr) = start_gateway(backend, |_| {}).await;

	let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))
		.unwrap()
		.connect()
		.await
		.unwrap();
	let mut grpc = tonic::client::Grpc::new(channel);
	grpc.ready().await.unwrap();

	// hold the request stream open so only cancellation can end the call
	let (req_tx, req_rx) = mpsc::channel::<Bytes>(4);
	req_tx
		.send(Bytes::from(HelloReq { name: "x".into() }.encode_to_vec()))
		.await
		.unwrap();
	let path: PathAndQuery = "/greet.v1.Greeter/SayHello".parse().unwrap();
	let response = grpc
		.streaming(Request::new(ReceiverStream::new(req_rx)), path, RawCodec)
		.await
		.unwrap();
	let mut inbound = response.into_inner();
	let frame = inbound.message().await.unwrap().unwrap();
	assert_eq!(HelloRep::decode(frame).unwrap().message, "mid-stream");
	assert_eq!(next_event(&mut events).await, "started");

	// the caller walks away mid-stream
	drop(inbound);

	// the backend call must unwind within a bound: its request read errors
	// out, or the parked stream is dropped by the propagated reset
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let event = next_event(&mut events).await;
		if event == "torn down" {
			break;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"backend never unblocked"
		);
	}

	// both forwarders are gone once the pooled borrow comes back to idle
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let dump: serde_json::Value = reqwest::get(format!("http://{http}/watcher"))
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
		let pool = &dump["pools"][0];
		if pool["open"] == pool["idle"] && pool["open"].as_u64().unwrap_or(0) >= 1 {
			break;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"pooled borrow was never released: {pool}"
		);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	drop(req_tx);
}

#[tokio::test]
async fn rpc_unknown_route_is_resource_exhausted() {
	let backend = spawn_backend().await;
	let (_, grpc_addr) = start_gateway(backend, |_| {}).await;

	let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))
		.unwrap()
		.connect()
		.await
		.unwrap();
	let mut grpc = tonic::client::Grpc::new(channel);
	grpc.ready().await.unwrap();

	let request = Request::new(Bytes::from(
		HelloReq { name: "x".into() }.encode_to_vec(),
	));
	let path: PathAndQuery = "/none.x/y".parse().unwrap();
	let err = grpc.unary(request, path, RawCodec).await.unwrap_err();
	assert_eq!(err.code(), tonic::Code::ResourceExhausted);
	assert_eq!(err.message(), "no router here");
}
