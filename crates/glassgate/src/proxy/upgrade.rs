use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::http::{self, Body, HeaderValue, Response, StatusCode, header};
use crate::intercept::{RequestCtx, RequestHead};
use crate::pool::PoolKey;
use crate::proxy::server::ProxyInputs;
use crate::proxy::{ProxyError, request};
use crate::telemetry::metrics::{FlowKind, FlowLabels};

static SEC_WEBSOCKET_KEY: header::HeaderName = header::SEC_WEBSOCKET_KEY;
static SEC_WEBSOCKET_ACCEPT: header::HeaderName = header::SEC_WEBSOCKET_ACCEPT;

/// Handle a WebSocket upgrade: validate the handshake, run the pipeline,
/// replay the handshake against the origin, relay the 101, then splice.
pub async fn handle(
	inputs: Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	mut req: ::http::Request<Incoming>,
) -> Response {
	if let Err(e) = validate(&req) {
		return e.as_response();
	}
	if let Err(e) = http::normalize_uri(&mut req, ssl) {
		return ProxyError::ClientProtocol(e.to_string()).as_response();
	}

	let ret = handle_internal(&inputs, peer, ssl, req).await;
	ret.unwrap_or_else(|e| e.as_response())
}

fn validate<B>(req: &::http::Request<B>) -> Result<(), ProxyError> {
	let bad = |msg: &str| ProxyError::ClientProtocol(format!("invalid websocket upgrade: {msg}"));
	if !http::is_websocket_upgrade(req.method(), req.headers()) {
		return Err(bad("not an upgrade"));
	}
	if req.headers().get(&SEC_WEBSOCKET_KEY).is_none() {
		return Err(bad("missing sec-websocket-key"));
	}
	if req.headers().get(header::SEC_WEBSOCKET_VERSION).is_none() {
		return Err(bad("missing sec-websocket-version"));
	}
	Ok(())
}

async fn handle_internal(
	inputs: &Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	mut req: ::http::Request<Incoming>,
) -> Result<Response, ProxyError> {
	inputs
		.metrics
		.flows
		.get_or_create(&FlowLabels {
			kind: FlowKind::upgrade,
			intercepted: !inputs.pipeline.is_empty(),
		})
		.inc();

	let head = RequestHead {
		method: req.method().clone(),
		uri: req.uri().clone(),
		headers: req.headers().clone(),
	};
	let client_key = head
		.headers
		.get(&SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.ok_or_else(|| ProxyError::ClientProtocol("missing sec-websocket-key".to_string()))?;

	let mut ctx = RequestCtx::new(peer, ssl, head);
	inputs.pipeline.on_upgrade(&mut ctx).await?;
	if let Some(mut dr) = inputs.pipeline.run_request(&mut ctx).await? {
		inputs.metrics.direct_responses.inc();
		// A locally-accepted handshake needs the computed accept key.
		if dr.status == StatusCode::SWITCHING_PROTOCOLS {
			dr.headers.insert(
				header::UPGRADE,
				HeaderValue::from_static("websocket"),
			);
			dr.headers
				.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
			dr.headers.insert(
				SEC_WEBSOCKET_ACCEPT.clone(),
				HeaderValue::try_from(http::websocket_accept_key(&client_key))
					.map_err(|e| ProxyError::Processing(e.to_string()))?,
			);
		}
		return Ok(request::direct_response(dr));
	}

	// Dial a dedicated origin connection; upgraded sockets cannot be pooled.
	let host = ctx
		.uri
		.host()
		.ok_or_else(|| ProxyError::ClientProtocol("no host".to_string()))?
		.to_string();
	let port = http::port_of(&ctx.uri);
	let tls = ssl || ctx.uri.scheme() == Some(&http::Scheme::HTTPS);
	let mut key = PoolKey::new(tls, &host, port);
	key.upstream = inputs.upstream.select(&host, port, tls);
	let stream = inputs.pool.dial_raw_with_upstream(&key).await?;

	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
		.await
		.map_err(|e| ProxyError::UpstreamCall(e.to_string()))?;
	tokio::spawn(async move {
		if let Err(e) = conn.with_upgrades().await {
			debug!("websocket origin connection ended: {e}");
		}
	});

	// Replay the (possibly modified) handshake in origin form.
	let mut headers = ctx.headers.clone();
	headers.insert(
		header::HOST,
		HeaderValue::try_from(
			ctx
				.uri
				.authority()
				.map(|a| a.as_str())
				.unwrap_or(&host),
		)
		.map_err(|e| ProxyError::Processing(e.to_string()))?,
	);
	let pq = ctx
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/")
		.to_string();
	let mut out = ::http::Request::builder()
		.method(ctx.method.clone())
		.uri(pq)
		.body(http::empty_body())
		.map_err(|e| ProxyError::Processing(e.to_string()))?;
	*out.headers_mut() = headers;

	let client_upgrade = hyper::upgrade::on(&mut req);
	let mut origin_resp = tokio::time::timeout(
		inputs.cfg.engine.io_timeout,
		sender.send_request(out),
	)
	.await
	.map_err(|_| ProxyError::UpstreamTimeout)?
	.map_err(|e| ProxyError::UpstreamCall(e.to_string()))?;

	if origin_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
		// Relay the refusal verbatim; both sockets close after it drains.
		debug!(status = %origin_resp.status(), "origin refused websocket upgrade");
		return Ok(origin_resp.map(http::incoming_body));
	}

	let origin_upgrade = hyper::upgrade::on(&mut origin_resp);
	tokio::spawn(async move {
		let client = match client_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!("client websocket upgrade failed: {e}");
				return;
			},
		};
		let origin = match origin_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!("origin websocket upgrade failed: {e}");
				return;
			},
		};
		let mut client = TokioIo::new(client);
		let mut origin = TokioIo::new(origin);
		match tokio::io::copy_bidirectional(&mut client, &mut origin).await {
			Ok((tx, rx)) => debug!(tx, rx, "websocket closed"),
			Err(e) => debug!("websocket splice error: {e}"),
		}
	});

	// Relay the origin's 101 (it carries sec-websocket-accept) to the client.
	let (parts, _body) = origin_resp.into_parts();
	Ok(::http::Response::from_parts(parts, Body::empty()))
}
