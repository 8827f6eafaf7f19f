// Shared fixtures for proxy integration tests: an in-process HTTP origin, a
// raw WebSocket echo origin, a minimal SOCKS5 forwarder, and hyper-based
// client helpers that speak through the proxy like curl would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct TestOrigin {
	pub addr: SocketAddr,
	pub hits: Arc<AtomicUsize>,
	pub last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

impl TestOrigin {
	pub fn host(&self) -> String {
		self.addr.ip().to_string()
	}

	pub fn authority(&self) -> String {
		self.addr.to_string()
	}

	pub fn hit_count(&self) -> usize {
		self.hits.load(Ordering::SeqCst)
	}
}

/// HTTP/1.1 origin with a few fixed routes. Records request counts and the
/// headers of the most recent request.
pub async fn spawn_origin() -> TestOrigin {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let hits = Arc::new(AtomicUsize::new(0));
	let last_headers = Arc::new(Mutex::new(None));

	let hits_task = hits.clone();
	let headers_task = last_headers.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let hits = hits_task.clone();
			let headers = headers_task.clone();
			tokio::spawn(async move {
				let svc = service_fn(move |req: Request<Incoming>| {
					let hits = hits.clone();
					let headers = headers.clone();
					async move {
						hits.fetch_add(1, Ordering::SeqCst);
						*headers.lock() = Some(req.headers().clone());
						let resp = match req.uri().path() {
							"/ping" => Response::builder()
								.status(StatusCode::OK)
								.header("server", "test-origin")
								.header("date", "Thu, 01 Jan 2026 00:00:00 GMT")
								.body(Full::new(Bytes::from_static(b"pong")))
								.unwrap(),
							"/gzip" => {
								let compressed = gzip(b"hello compressed world").await;
								Response::builder()
									.status(StatusCode::OK)
									.header("content-encoding", "gzip")
									.body(Full::new(Bytes::from(compressed)))
									.unwrap()
							},
							path => Response::builder()
								.status(StatusCode::OK)
								.body(Full::new(Bytes::from(format!("echo:{path}"))))
								.unwrap(),
						};
						Ok::<_, std::convert::Infallible>(resp)
					}
				});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), svc)
					.await;
			});
		}
	});

	TestOrigin {
		addr,
		hits,
		last_headers,
	}
}

pub async fn gzip(data: &[u8]) -> Vec<u8> {
	use async_compression::tokio::bufread::GzipEncoder;
	let mut out = Vec::new();
	GzipEncoder::new(data)
		.read_to_end(&mut out)
		.await
		.unwrap();
	out
}

/// Raw WebSocket origin: completes the RFC 6455 handshake, then echoes bytes.
pub async fn spawn_ws_origin() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let head = read_head(&mut stream).await;
				let key = head
					.lines()
					.find_map(|l| l.strip_prefix("sec-websocket-key:"))
					.or_else(|| {
						head
							.lines()
							.find_map(|l| l.strip_prefix("Sec-WebSocket-Key:"))
					})
					.map(str::trim)
					.unwrap_or_default()
					.to_string();
				let accept = ws_accept(&key);
				let resp = format!(
					"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {accept}\r\n\r\n"
				);
				if stream.write_all(resp.as_bytes()).await.is_err() {
					return;
				}
				// Echo whatever frames arrive, byte for byte.
				let mut buf = [0u8; 4096];
				loop {
					let Ok(n) = stream.read(&mut buf).await else {
						return;
					};
					if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
						return;
					}
				}
			});
		}
	});
	addr
}

fn ws_accept(key: &str) -> String {
	use base64::Engine;
	use sha1::{Digest, Sha1};
	let mut hasher = Sha1::new();
	hasher.update(key.as_bytes());
	hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
	base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Minimal SOCKS5 forwarder (no-auth, CONNECT only). Counts sessions.
pub async fn spawn_socks5() -> (SocketAddr, Arc<AtomicUsize>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let sessions = Arc::new(AtomicUsize::new(0));
	let counter = sessions.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut client, _)) = listener.accept().await else {
				return;
			};
			counter.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				// Greeting: VER NMETHODS METHODS…  → no-auth.
				let mut hdr = [0u8; 2];
				if client.read_exact(&mut hdr).await.is_err() || hdr[0] != 0x05 {
					return;
				}
				let mut methods = vec![0u8; hdr[1] as usize];
				if client.read_exact(&mut methods).await.is_err() {
					return;
				}
				if client.write_all(&[0x05, 0x00]).await.is_err() {
					return;
				}
				// Request: VER CMD RSV ATYP …
				let mut req = [0u8; 4];
				if client.read_exact(&mut req).await.is_err() || req[1] != 0x01 {
					return;
				}
				let target = match req[3] {
					0x01 => {
						let mut addr = [0u8; 4];
						let mut port = [0u8; 2];
						if client.read_exact(&mut addr).await.is_err()
							|| client.read_exact(&mut port).await.is_err()
						{
							return;
						}
						(
							std::net::IpAddr::from(addr).to_string(),
							u16::from_be_bytes(port),
						)
					},
					0x03 => {
						let mut len = [0u8; 1];
						if client.read_exact(&mut len).await.is_err() {
							return;
						}
						let mut name = vec![0u8; len[0] as usize];
						let mut port = [0u8; 2];
						if client.read_exact(&mut name).await.is_err()
							|| client.read_exact(&mut port).await.is_err()
						{
							return;
						}
						(
							String::from_utf8_lossy(&name).to_string(),
							u16::from_be_bytes(port),
						)
					},
					_ => return,
				};
				let Ok(mut origin) = TcpStream::connect((target.0.as_str(), target.1)).await
				else {
					let _ = client
						.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
						.await;
					return;
				};
				if client
					.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
					.await
					.is_err()
				{
					return;
				}
				let _ = tokio::io::copy_bidirectional(&mut client, &mut origin).await;
			});
		}
	});
	(addr, sessions)
}

/// TCP echo origin for blind-tunnel tests.
pub async fn spawn_tcp_echo() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 4096];
				loop {
					let Ok(n) = stream.read(&mut buf).await else {
						return;
					};
					if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
						return;
					}
				}
			});
		}
	});
	addr
}

/// Send one request through the proxy the way curl -x does: an HTTP/1.1
/// connection to the proxy carrying an absolute-form request line.
pub async fn send_via_proxy(
	proxy: SocketAddr,
	req: Request<Full<Bytes>>,
) -> (StatusCode, HeaderMap, Bytes) {
	let stream = TcpStream::connect(proxy).await.unwrap();
	let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
		TokioIo::new(stream),
	)
	.await
	.unwrap();
	tokio::spawn(async move {
		let _ = conn.await;
	});
	let resp = sender.send_request(req).await.unwrap();
	let (parts, body) = resp.into_parts();
	let body = body.collect().await.unwrap().to_bytes();
	(parts.status, parts.headers, body)
}

/// Open a CONNECT tunnel through the proxy and return the raw stream,
/// positioned just past the `200 Connection Established` head.
pub async fn open_connect_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
	let mut stream = TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let head = read_head(&mut stream).await;
	assert!(
		head.starts_with("HTTP/1.1 200"),
		"CONNECT not accepted: {head}"
	);
	stream
}

/// Read an HTTP message head (through the blank line) off a raw stream.
pub async fn read_head(stream: &mut TcpStream) -> String {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	while !head.ends_with(b"\r\n\r\n") {
		let n = stream.read(&mut byte).await.unwrap();
		if n == 0 {
			break;
		}
		head.push(byte[0]);
		assert!(head.len() < 16 * 1024, "oversized response head");
	}
	String::from_utf8_lossy(&head).to_string()
}

/// Client-side TLS over an established tunnel, trusting `ca_pem`.
pub async fn client_tls(
	stream: TcpStream,
	ca_pem: &str,
	server_name: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
	let mut roots = rustls::RootCertStore::empty();
	let mut reader = std::io::BufReader::new(std::io::Cursor::new(ca_pem.as_bytes()));
	for cert in rustls_pemfile::certs(&mut reader) {
		roots.add(cert.unwrap()).unwrap();
	}
	let config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
	let name = rustls_pki_types::ServerName::try_from(server_name.to_string()).unwrap();
	connector.connect(name, stream).await.unwrap()
}
