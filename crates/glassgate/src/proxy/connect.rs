use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::http::{self, HeaderValue, Response, StatusCode};
use crate::intercept::DirectResponse;
use crate::pool::PoolKey;
use crate::proxy::server::ProxyInputs;
use crate::proxy::{ProxyError, request};
use crate::telemetry::metrics::{FlowKind, FlowLabels};

/// Parsed `CONNECT host:port` target.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
	pub host: String,
	pub port: u16,
}

impl std::fmt::Display for ConnectTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Verdict of the per-CONNECT decision hook.
pub enum ConnectAction {
	/// Terminate TLS and inspect the inner requests.
	Intercept,
	/// Relay bytes blindly; the client's TLS terminates at the origin.
	Tunnel,
	/// Refuse the tunnel with this response.
	Direct(DirectResponse),
}

pub type SslConnectHook = Arc<dyn Fn(&ConnectTarget, SocketAddr) -> ConnectAction + Send + Sync>;

/// Handle a `CONNECT` request: decide MITM vs blind tunnel, establish the
/// path, answer `200 Connection Established`, then move bytes.
pub async fn handle(
	inputs: Arc<ProxyInputs>,
	peer: SocketAddr,
	req: ::http::Request<Incoming>,
) -> Response {
	let Some(target) = parse_target(&req) else {
		return ProxyError::ClientProtocol("invalid CONNECT target".to_string()).as_response();
	};

	if let Err(e) = inputs.pipeline.on_connect(&target.host, target.port).await {
		return e.as_response();
	}

	let action = match &inputs.ssl_connect {
		Some(hook) => hook(&target, peer),
		None if inputs.filter.domain_matches(&target.host) => ConnectAction::Intercept,
		None => ConnectAction::Tunnel,
	};
	let intercept = matches!(action, ConnectAction::Intercept);
	inputs
		.metrics
		.flows
		.get_or_create(&FlowLabels {
			kind: FlowKind::connect,
			intercepted: intercept,
		})
		.inc();

	match action {
		ConnectAction::Direct(dr) => request::direct_response(dr),
		ConnectAction::Tunnel => {
			// Dial first so a failed origin maps to a 5xx instead of a dead tunnel.
			let mut key = PoolKey::new(false, &target.host, target.port);
			key.upstream = inputs.upstream.select(&target.host, target.port, true);
			let origin = match inputs.pool.dial_raw_with_upstream(&key).await {
				Ok(stream) => stream,
				Err(e) => {
					debug!(dst = %target, "tunnel dial failed: {e}");
					return e.as_response();
				},
			};
			tokio::spawn(async move {
				match hyper::upgrade::on(req).await {
					Ok(upgraded) => {
						let mut client = TokioIo::new(upgraded);
						let mut origin = origin;
						match tokio::io::copy_bidirectional(&mut client, &mut origin).await {
							Ok((tx, rx)) => {
								debug!(dst = %target, tx, rx, "tunnel closed")
							},
							Err(e) => debug!(dst = %target, "tunnel error: {e}"),
						}
					},
					Err(e) => warn!("CONNECT upgrade failed: {e}"),
				}
			});
			established()
		},
		ConnectAction::Intercept => {
			tokio::spawn(async move {
				match hyper::upgrade::on(req).await {
					Ok(upgraded) => mitm(inputs, peer, target, TokioIo::new(upgraded)).await,
					Err(e) => warn!("CONNECT upgrade failed: {e}"),
				}
			});
			established()
		},
	}
}

/// Terminate TLS with a minted leaf and feed the decrypted requests back into
/// the dispatcher with `ssl=true`.
async fn mitm<IO>(inputs: Arc<ProxyInputs>, peer: SocketAddr, target: ConnectTarget, io: IO)
where
	IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let (stream, _server) = match inputs
		.registry
		.terminate(io, &target.host, target.port)
		.await
	{
		Ok(v) => v,
		Err(e) => {
			// One broken handshake; other fake-server connections are unaffected.
			warn!(dst = %target, "TLS termination failed: {e}");
			return;
		},
	};

	let svc = hyper::service::service_fn(move |req| {
		let inputs = inputs.clone();
		async move {
			Ok::<_, std::convert::Infallible>(
				crate::proxy::server::dispatch(inputs, peer, true, req).await,
			)
		}
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(hyper_util::rt::TokioTimer::new())
		.serve_connection(TokioIo::new(stream), svc)
		.with_upgrades();
	if let Err(e) = conn.await {
		debug!(dst = %target, "intercepted connection ended: {e}");
	}
}

/// `CONNECT` targets are authority-form; a bare hostname (no port) parses as
/// a path, so accept both shapes and default the port to 443.
fn parse_target<B>(req: &::http::Request<B>) -> Option<ConnectTarget> {
	if req.uri().scheme().is_some() {
		return None;
	}
	let raw = match req.uri().authority() {
		Some(a) => a.as_str().to_string(),
		None => {
			let p = req.uri().path();
			if p.is_empty() || p.contains('/') {
				return None;
			}
			p.to_string()
		},
	};
	if raw.contains('@') {
		return None;
	}
	let (host, port) = if raw.starts_with('[') {
		// Bracketed IPv6, with or without a port.
		match raw.rsplit_once("]:") {
			Some((h, p)) => (format!("{h}]"), p.parse().ok()?),
			None => (raw.clone(), 443),
		}
	} else {
		match raw.rsplit_once(':') {
			Some((h, p)) => (h.to_string(), p.parse().ok()?),
			None => (raw.clone(), 443),
		}
	};
	let host = host.trim_start_matches('[').trim_end_matches(']');
	if host.is_empty() {
		return None;
	}
	Some(ConnectTarget {
		host: host.to_ascii_lowercase(),
		port,
	})
}

fn established() -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header("proxy-agent", HeaderValue::from_static(crate::PROXY_NAME))
		.body(http::empty_body())
		.expect("builder with known status code should not fail")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn connect_req(target: &str) -> ::http::Request<()> {
		::http::Request::builder()
			.method(::http::Method::CONNECT)
			.uri(target)
			.body(())
			.unwrap()
	}

	#[test]
	fn parses_targets() {
		let t = parse_target(&connect_req("example.com:8443")).unwrap();
		assert_eq!(t.host, "example.com");
		assert_eq!(t.port, 8443);

		let t = parse_target(&connect_req("EXAMPLE.com")).unwrap();
		assert_eq!(t.host, "example.com");
		assert_eq!(t.port, 443);
	}

	#[test]
	fn parses_bracketed_ipv6() {
		let t = parse_target(&connect_req("[::1]:8443")).unwrap();
		assert_eq!(t.host, "::1");
		assert_eq!(t.port, 8443);
	}

	#[test]
	fn rejects_malformed_targets() {
		assert!(parse_target(&connect_req("http://example.com/path")).is_none());
		assert!(parse_target(&connect_req("example.com:not-a-port")).is_none());
	}
}
