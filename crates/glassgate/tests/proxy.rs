mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use common::*;
use glassgate::config::InterceptConfig;
use glassgate::intercept::{BodyInterest, InterceptAction};
use glassgate::proxy::connect::{ConnectAction, ConnectTarget};
use glassgate::{Config, DirectResponse, Interceptor, RequestCtx, Server};
use http::{HeaderValue, Method, Request, StatusCode, header};
use http_body_util::Full;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config() -> Config {
	let dir = tempfile::tempdir().unwrap().keep();
	let mut cfg = Config {
		port: 0,
		host: "127.0.0.1".parse().unwrap(),
		..Default::default()
	};
	cfg.ca_cert_path = Some(dir.join("ca.crt"));
	cfg.ca_key_path = Some(dir.join("ca.key"));
	// Probes target unroutable test hosts; fail fast.
	cfg.get_cert_socket_timeout = std::time::Duration::from_millis(50);
	cfg
}

async fn start(server: Server) -> (std::net::SocketAddr, glassgate::proxy::server::ShutdownHandle) {
	let addr = server.local_addr();
	let handle = server.shutdown_handle();
	tokio::spawn(async move {
		let _ = server.run().await;
	});
	(addr, handle)
}

#[tokio::test]
async fn plain_http_passthrough() {
	let origin = spawn_origin().await;
	let server = Server::builder(test_config()).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	let req = Request::builder()
		.method(Method::GET)
		.uri(format!("http://{}/ping", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, headers, body) = send_via_proxy(proxy, req).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(body.as_ref(), b"pong");
	// Origin headers are preserved.
	assert_eq!(headers.get("server").unwrap(), "test-origin");
	assert!(headers.contains_key("date"));
	// The proxy identified itself to the origin.
	let seen = origin.last_headers.lock().clone().unwrap();
	assert!(
		seen
			.get("x-forwarded-by")
			.unwrap()
			.to_str()
			.unwrap()
			.starts_with("glassgate/")
	);
	assert_eq!(seen.get("x-forwarded-for").unwrap(), "127.0.0.1");
	assert_eq!(origin.hit_count(), 1);
}

struct MockApi;

#[async_trait::async_trait]
impl Interceptor for MockApi {
	async fn on_request(&self, ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		if ctx.uri.path() == "/api/user" {
			let mut dr = DirectResponse::new(StatusCode::OK);
			dr.headers.insert(
				header::CONTENT_TYPE,
				HeaderValue::from_static("application/json"),
			);
			dr.headers
				.insert("x-mock", HeaderValue::from_static("true"));
			dr.body = Bytes::from_static(br#"{"id":1,"name":"Mock"}"#);
			return Ok(InterceptAction::DirectResponse(dr));
		}
		Ok(InterceptAction::Next)
	}
}

#[tokio::test]
async fn direct_response_opens_no_origin_connection() {
	let origin = spawn_origin().await;
	let mut cfg = test_config();
	cfg.intercept = InterceptConfig {
		domains: vec![origin.host()],
		path_prefixes: vec!["/api/".into()],
		..Default::default()
	};
	let server = Server::builder(cfg)
		.with_interceptor(Arc::new(MockApi))
		.bind()
		.await
		.unwrap();
	let (proxy, _handle) = start(server).await;

	let req = Request::builder()
		.method(Method::GET)
		.uri(format!("http://{}/api/user", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, headers, body) = send_via_proxy(proxy, req).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(headers.get("x-mock").unwrap(), "true");
	assert_eq!(body.as_ref(), br#"{"id":1,"name":"Mock"}"#);
	assert_eq!(origin.hit_count(), 0, "no origin connection may be opened");
}

struct CountingInterceptor(Arc<AtomicUsize>);

#[async_trait::async_trait]
impl Interceptor for CountingInterceptor {
	async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		self.0.fetch_add(1, Ordering::SeqCst);
		Ok(InterceptAction::Next)
	}
}

#[tokio::test]
async fn static_extensions_skip_the_pipeline() {
	let origin = spawn_origin().await;
	let hook_calls = Arc::new(AtomicUsize::new(0));
	let mut cfg = test_config();
	cfg.intercept = InterceptConfig {
		domains: vec![origin.host()],
		path_prefixes: vec!["/".into()],
		static_extensions: vec!["js".into()],
		..Default::default()
	};
	let server = Server::builder(cfg)
		.with_interceptor(Arc::new(CountingInterceptor(hook_calls.clone())))
		.bind()
		.await
		.unwrap();
	let (proxy, _handle) = start(server).await;

	let asset = Request::builder()
		.uri(format!("http://{}/assets/app.js", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, _, body) = send_via_proxy(proxy, asset).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body.as_ref(), b"echo:/assets/app.js");
	assert_eq!(hook_calls.load(Ordering::SeqCst), 0, "fast path ran hooks");

	let api = Request::builder()
		.uri(format!("http://{}/api/data", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, _, _) = send_via_proxy(proxy, api).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
	assert_eq!(origin.hit_count(), 2);
}

#[tokio::test]
async fn connect_blind_tunnel_relays_bytes() {
	let echo = spawn_tcp_echo().await;
	let server = Server::builder(test_config()).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	let mut tunnel = open_connect_tunnel(proxy, &echo.to_string()).await;
	tunnel.write_all(b"tunnel payload").await.unwrap();
	let mut buf = [0u8; 14];
	tunnel.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"tunnel payload");
}

#[tokio::test]
async fn connect_to_dead_origin_maps_to_gateway_error() {
	// Bind-then-drop yields a port with no listener.
	let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let dead_addr = dead.local_addr().unwrap();
	drop(dead);

	let mut cfg = test_config();
	cfg.pool.connect_retries = 1;
	let server = Server::builder(cfg).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let head = read_head(&mut stream).await;
	assert!(
		head.starts_with("HTTP/1.1 503"),
		"expected 503 for refused origin, got: {head}"
	);
}

#[tokio::test]
async fn https_intercept_serves_mock_over_minted_cert() {
	let mut cfg = test_config();
	cfg.intercept = InterceptConfig {
		domains: vec!["secure.example".into()],
		path_prefixes: vec!["/api/".into()],
		..Default::default()
	};
	let server = Server::builder(cfg)
		.with_interceptor(Arc::new(MockApi))
		.bind()
		.await
		.unwrap();
	let ca_pem = server.ca_cert_pem();
	let (proxy, _handle) = start(server).await;

	let tunnel = open_connect_tunnel(proxy, "secure.example:443").await;
	let tls = client_tls(tunnel, &ca_pem, "secure.example").await;

	let (mut sender, conn) =
		hyper::client::conn::http1::handshake::<_, Full<Bytes>>(hyper_util::rt::TokioIo::new(tls))
			.await
			.unwrap();
	tokio::spawn(async move {
		let _ = conn.await;
	});
	let req = Request::builder()
		.method(Method::GET)
		.uri("/api/user")
		.header(header::HOST, "secure.example")
		.body(Full::new(Bytes::new()))
		.unwrap();
	let resp = sender.send_request(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("x-mock").unwrap(), "true");
	let body = {
		use http_body_util::BodyExt;
		resp.into_body().collect().await.unwrap().to_bytes()
	};
	assert_eq!(body.as_ref(), br#"{"id":1,"name":"Mock"}"#);
}

#[tokio::test]
async fn ssl_connect_hook_can_refuse_tunnels() {
	let server = Server::builder(test_config())
		.with_ssl_connect_hook(Arc::new(|target: &ConnectTarget, _peer| {
			if target.host == "blocked.example" {
				let mut dr = DirectResponse::new(StatusCode::FORBIDDEN);
				dr.body = Bytes::from_static(b"blocked");
				ConnectAction::Direct(dr)
			} else {
				ConnectAction::Tunnel
			}
		}))
		.bind()
		.await
		.unwrap();
	let (proxy, _handle) = start(server).await;

	let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(b"CONNECT blocked.example:443 HTTP/1.1\r\nHost: blocked.example:443\r\n\r\n")
		.await
		.unwrap();
	let head = read_head(&mut stream).await;
	assert!(head.starts_with("HTTP/1.1 403"), "got: {head}");
}

#[tokio::test]
async fn websocket_upgrade_relays_and_splices() {
	let ws = spawn_ws_origin().await;
	let server = Server::builder(test_config()).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(
			format!(
				"GET http://{ws}/chat HTTP/1.1\r\n\
				 Host: {ws}\r\n\
				 Upgrade: websocket\r\n\
				 Connection: Upgrade\r\n\
				 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
				 Sec-WebSocket-Version: 13\r\n\r\n"
			)
			.as_bytes(),
		)
		.await
		.unwrap();
	let head = read_head(&mut stream).await;
	assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
	assert!(
		head
			.to_ascii_lowercase()
			.contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="),
		"accept key missing or wrong: {head}"
	);

	// Frames relay byte-exact in both directions.
	stream.write_all(b"\x81\x05hello").await.unwrap();
	let mut frame = [0u8; 7];
	stream.read_exact(&mut frame).await.unwrap();
	assert_eq!(&frame, b"\x81\x05hello");
}

struct NoopBodyInterceptor;

#[async_trait::async_trait]
impl Interceptor for NoopBodyInterceptor {
	fn body_interest(&self) -> BodyInterest {
		BodyInterest::RESPONSE
	}
}

#[tokio::test]
async fn gzip_passes_through_untouched_without_body_interest() {
	let origin = spawn_origin().await;
	let server = Server::builder(test_config()).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	let req = Request::builder()
		.uri(format!("http://{}/gzip", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, headers, body) = send_via_proxy(proxy, req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(headers.get("content-encoding").unwrap(), "gzip");
	assert_eq!(body, Bytes::from(gzip(b"hello compressed world").await));
}

#[tokio::test]
async fn gzip_is_decoded_for_interested_interceptors() {
	let origin = spawn_origin().await;
	let mut cfg = test_config();
	cfg.intercept = InterceptConfig {
		domains: vec![origin.host()],
		path_prefixes: vec!["/".into()],
		..Default::default()
	};
	let server = Server::builder(cfg)
		.with_interceptor(Arc::new(NoopBodyInterceptor))
		.bind()
		.await
		.unwrap();
	let (proxy, _handle) = start(server).await;

	let req = Request::builder()
		.uri(format!("http://{}/gzip", origin.authority()))
		.header(header::HOST, origin.authority())
		.body(Full::new(Bytes::new()))
		.unwrap();
	let (status, headers, body) = send_via_proxy(proxy, req).await;
	assert_eq!(status, StatusCode::OK);
	assert!(
		!headers.contains_key("content-encoding"),
		"content-encoding must be stripped after decode"
	);
	assert_eq!(body.as_ref(), b"hello compressed world");
}

#[tokio::test]
async fn socks5_chaining_reuses_the_proxied_socket() {
	let origin = spawn_origin().await;
	let (socks, sessions) = spawn_socks5().await;
	let mut cfg = test_config();
	cfg.external_proxy = Some(format!("socks5://{socks}"));
	let server = Server::builder(cfg).bind().await.unwrap();
	let (proxy, _handle) = start(server).await;

	for _ in 0..2 {
		let req = Request::builder()
			.uri(format!("http://{}/ping", origin.authority()))
			.header(header::HOST, origin.authority())
			.body(Full::new(Bytes::new()))
			.unwrap();
		let (status, _, body) = send_via_proxy(proxy, req).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body.as_ref(), b"pong");
		// Let the proxy finish streaming and check the socket back in.
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
	}

	assert_eq!(origin.hit_count(), 2);
	assert_eq!(
		sessions.load(Ordering::SeqCst),
		1,
		"second request must reuse the SOCKS5-backed socket"
	);
}
