use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use tracing::debug;

use crate::http::compression::{self, Encoding};
use crate::http::{self, Body, HeaderMap, HeaderName, HeaderValue, Method, Response, Uri, header};
use crate::intercept::{DirectResponse, RequestCtx, RequestHead, ResponseView};
use crate::pool::upstream::UpstreamProxy;
use crate::pool::{PoolKey, PoolReturnBody, PooledConn};
use crate::proxy::server::ProxyInputs;
use crate::proxy::{DialErrorKind, ProxyError};
use crate::telemetry::log::{LogBody, RequestLog};
use crate::telemetry::metrics::{FlowKind, FlowLabels};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_BY: HeaderName = HeaderName::from_static("x-forwarded-by");
static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Handle one plain (or TLS-terminated) HTTP/1.1 request end to end. The
/// access-log record rides the response body and is emitted when the stream
/// to the client completes.
pub async fn handle(
	inputs: Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	mut req: ::http::Request<Incoming>,
) -> Response {
	if let Err(e) = http::normalize_uri(&mut req, ssl) {
		return ProxyError::ClientProtocol(e.to_string()).as_response();
	}
	let mut log = RequestLog::new(
		inputs.metrics.clone(),
		peer,
		req.method().clone(),
		req.uri().host().unwrap_or_default().to_string(),
		req.uri().path().to_string(),
		ssl,
	);

	let ret = handle_internal(&inputs, peer, ssl, req, &mut log).await;
	let resp = match ret {
		Ok(resp) => resp,
		Err(e) => {
			log.error = Some(e.to_string());
			e.as_response()
		},
	};
	log.status = Some(resp.status());
	resp.map(move |b| Body::new(LogBody::new(b, log)))
}

async fn handle_internal(
	inputs: &Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	req: ::http::Request<Incoming>,
	log: &mut RequestLog,
) -> Result<Response, ProxyError> {
	let url = req.uri().to_string();
	let host = req
		.uri()
		.host()
		.ok_or_else(|| ProxyError::ClientProtocol("request has no host".to_string()))?
		.to_string();
	let path = req.uri().path().to_string();

	let intercept =
		!inputs.pipeline.is_empty() && inputs.filter.should_intercept(&host, &url, &path);
	inputs
		.metrics
		.flows
		.get_or_create(&FlowLabels {
			kind: FlowKind::request,
			intercepted: intercept,
		})
		.inc();

	if !intercept {
		log.fast_path = true;
		return forward_streaming(inputs, peer, ssl, req).await;
	}
	log.intercepted = true;
	handle_intercepted(inputs, peer, ssl, req, log).await
}

/// Fast path: no buffering, no pipeline. Request and response bodies stream
/// straight through a pooled origin connection.
async fn forward_streaming(
	inputs: &Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	req: ::http::Request<Incoming>,
) -> Result<Response, ProxyError> {
	let (mut parts, body) = req.into_parts();
	check_error_cache(inputs, &parts.method, &parts.uri)?;

	let key = pool_key(inputs, &parts.uri, ssl, &parts.headers, peer);
	prepare_outbound(&mut parts.uri, &mut parts.headers, &key, peer)?;
	let method = parts.method.clone();
	let cache_uri = parts.uri.clone();
	let out = ::http::Request::from_parts(parts, http::incoming_body(body));

	let mut conn = checkout(inputs, &method, &cache_uri, key).await?;
	let resp = send(inputs, &mut conn, out).await?;

	let (mut parts, body) = resp.into_parts();
	http::strip_hop_headers(&mut parts.headers, false);
	let body = PoolReturnBody::new(http::incoming_body(body), conn);
	Ok(::http::Response::from_parts(parts, Body::new(body)))
}

/// Full pipeline path: before-middleware, request interceptors, forward
/// (unless short-circuited), response interceptors, after-middleware.
async fn handle_intercepted(
	inputs: &Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	req: ::http::Request<Incoming>,
	log: &mut RequestLog,
) -> Result<Response, ProxyError> {
	let interest = inputs.pipeline.body_interest();
	let (parts, body) = req.into_parts();
	let head = RequestHead {
		method: parts.method.clone(),
		uri: parts.uri.clone(),
		headers: parts.headers.clone(),
	};
	let mut ctx = RequestCtx::new(peer, ssl, head);

	let mut streaming_body = None;
	if interest.request {
		let buffered = http::read_body_with_limit(body, inputs.cfg.engine.max_body_size)
			.await
			.map_err(map_read_err)?;
		log.request_bytes = buffered.len() as u64;
		ctx.request_body = Some(buffered);
	} else {
		streaming_body = Some(body);
	}

	inputs.pipeline.before_request(&mut ctx).await?;
	if let Some(dr) = inputs.pipeline.run_request(&mut ctx).await? {
		inputs.metrics.direct_responses.inc();
		return Ok(direct_response(dr));
	}

	check_error_cache(inputs, &ctx.method, &ctx.uri)?;

	// Forward whatever the pipeline left in the context.
	let mut uri = ctx.uri.clone();
	let mut headers = ctx.headers.clone();
	let key = pool_key(inputs, &uri, ssl, &headers, peer);
	prepare_outbound(&mut uri, &mut headers, &key, peer)?;

	let out_body = match (&ctx.request_body, streaming_body.take()) {
		(Some(buffered), _) => http::full_body(buffered.clone()),
		(None, Some(stream)) => http::incoming_body(stream),
		(None, None) => http::empty_body(),
	};
	let mut out = ::http::Request::builder()
		.method(ctx.method.clone())
		.uri(uri)
		.body(out_body)
		.map_err(|e| ProxyError::Processing(e.to_string()))?;
	*out.headers_mut() = headers;
	if ctx.request_body.is_some() {
		// A buffered (possibly overlaid) body is re-framed from its real size.
		out.headers_mut().remove(header::CONTENT_LENGTH);
	}

	let method = ctx.method.clone();
	let cache_uri = ctx.uri.clone();
	let mut conn = checkout(inputs, &method, &cache_uri, key).await?;
	let resp = send(inputs, &mut conn, out).await?;

	let (mut resp_parts, resp_body) = resp.into_parts();
	http::strip_hop_headers(&mut resp_parts.headers, false);

	if interest.response {
		let buffered = http::read_body_with_limit(resp_body, inputs.cfg.engine.max_body_size)
			.await
			.map_err(map_read_err)?;
		conn.mark_reusable();
		drop(conn);

		let encoding = resp_parts
			.headers
			.get(header::CONTENT_ENCODING)
			.and_then(|v| v.to_str().ok())
			.and_then(Encoding::from_header);
		let body = match encoding {
			Some(enc) => {
				let decoded = compression::decode(enc, &buffered)
					.await
					.map_err(|e| ProxyError::Processing(format!("body decode failed: {e}")))?;
				resp_parts.headers.remove(header::CONTENT_ENCODING);
				decoded
			},
			None => buffered,
		};
		ctx.response = Some(ResponseView {
			status: resp_parts.status,
			headers: resp_parts.headers,
			body: Some(body),
		});

		if let Some(dr) = inputs.pipeline.run_response(&mut ctx).await? {
			inputs.metrics.direct_responses.inc();
			return Ok(direct_response(dr));
		}
		inputs.pipeline.after_request(&mut ctx).await?;

		let view = ctx
			.response
			.take()
			.ok_or_else(|| ProxyError::Processing("response view removed".to_string()))?;
		let mut headers = view.headers;
		// Buffered bodies are re-framed; stale framing headers would lie.
		headers.remove(header::CONTENT_LENGTH);
		headers.remove(header::TRANSFER_ENCODING);
		let mut resp = ::http::Response::builder()
			.status(view.status)
			.body(http::full_body(view.body.unwrap_or_default()))
			.map_err(|e| ProxyError::Processing(e.to_string()))?;
		*resp.headers_mut() = headers;
		Ok(resp)
	} else {
		// No body interest: hooks see the head only, the body streams through.
		ctx.response = Some(ResponseView {
			status: resp_parts.status,
			headers: resp_parts.headers,
			body: None,
		});
		if let Some(dr) = inputs.pipeline.run_response(&mut ctx).await? {
			inputs.metrics.direct_responses.inc();
			return Ok(direct_response(dr));
		}
		inputs.pipeline.after_request(&mut ctx).await?;

		let view = ctx
			.response
			.take()
			.ok_or_else(|| ProxyError::Processing("response view removed".to_string()))?;
		let body = PoolReturnBody::new(http::incoming_body(resp_body), conn);
		let mut resp = ::http::Response::builder()
			.status(view.status)
			.body(Body::new(body))
			.map_err(|e| ProxyError::Processing(e.to_string()))?;
		*resp.headers_mut() = view.headers;
		Ok(resp)
	}
}

pub(crate) fn direct_response(dr: DirectResponse) -> Response {
	let mut resp = ::http::Response::builder()
		.status(dr.status)
		.body(http::full_body(dr.body))
		.expect("builder with known status code should not fail");
	*resp.headers_mut() = dr.headers;
	resp
}

/// Pool identity for a request: scheme, authority credentials, host, port,
/// the selected upstream, and a sticky id for authenticated conversations.
fn pool_key(
	inputs: &ProxyInputs,
	uri: &Uri,
	ssl: bool,
	headers: &HeaderMap,
	peer: SocketAddr,
) -> PoolKey {
	let host = uri.host().unwrap_or_default();
	let port = http::port_of(uri);
	let tls = ssl || uri.scheme() == Some(&http::Scheme::HTTPS);
	let mut key = PoolKey::new(tls, host, port);
	key.auth = uri
		.authority()
		.and_then(|a| a.as_str().rsplit_once('@'))
		.map(|(userinfo, _)| userinfo.to_string());
	key.upstream = inputs.upstream.select(host, port, tls);
	if headers.contains_key(header::AUTHORIZATION) {
		key.sticky = Some(sticky_id(peer));
	}
	key
}

/// Requests on one client socket belong to one authentication conversation;
/// the socket's peer address identifies it.
fn sticky_id(peer: SocketAddr) -> u64 {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	peer.hash(&mut hasher);
	hasher.finish()
}

/// Normalize the outbound request: strip hop-by-hop headers, rewrite the
/// request target for the transport in use, refresh forwarding headers.
fn prepare_outbound(
	uri: &mut Uri,
	headers: &mut HeaderMap,
	key: &PoolKey,
	peer: SocketAddr,
) -> Result<(), ProxyError> {
	let chained_http = matches!(&key.upstream, Some(UpstreamProxy::Http { .. })) && !key.tls;
	http::strip_hop_headers(headers, chained_http);

	let authority = uri
		.authority()
		.ok_or_else(|| ProxyError::ClientProtocol("no authority".to_string()))?
		.clone();
	headers.insert(
		header::HOST,
		HeaderValue::try_from(authority.as_str())
			.map_err(|e| ProxyError::Processing(e.to_string()))?,
	);

	append_forwarded_for(headers, peer);
	headers.insert(
		X_FORWARDED_BY.clone(),
		HeaderValue::from_static(crate::PROXY_NAME),
	);

	if chained_http {
		// Absolute-form request line; the upstream proxy picks the origin.
		if let Some(auth) = key.upstream.as_ref().and_then(|u| u.basic_auth()) {
			headers.insert(
				header::PROXY_AUTHORIZATION,
				HeaderValue::try_from(auth.header_value())
					.map_err(|e| ProxyError::Processing(e.to_string()))?,
			);
		}
		headers.insert(PROXY_CONNECTION.clone(), HeaderValue::from_static("keep-alive"));
	} else {
		// Origin-form for direct (or tunneled) origins.
		let pq = uri
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/")
			.to_string();
		*uri = pq
			.parse()
			.map_err(|_| ProxyError::Processing("invalid request path".to_string()))?;
	}
	Ok(())
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
	let ip = peer.ip().to_string();
	let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {ip}"),
		None => ip,
	};
	if let Ok(v) = HeaderValue::try_from(value) {
		headers.insert(X_FORWARDED_FOR.clone(), v);
	}
}

fn check_error_cache(inputs: &ProxyInputs, method: &Method, uri: &Uri) -> Result<(), ProxyError> {
	let host = uri.host().unwrap_or_default();
	if let Some(kind) = inputs.error_cache.get(method, host, uri.path()) {
		debug!(%host, "answering from error cache");
		return Err(ProxyError::from_dial(kind));
	}
	Ok(())
}

async fn checkout(
	inputs: &ProxyInputs,
	method: &Method,
	uri: &Uri,
	key: PoolKey,
) -> Result<PooledConn, ProxyError> {
	let host = key.host.clone();
	match inputs.pool.checkout(key).await {
		Ok(conn) => Ok(conn),
		Err(e) => {
			if let Some(kind) = e.dial_kind()
				&& matches!(kind, DialErrorKind::Dns | DialErrorKind::Refused)
			{
				inputs.error_cache.put(method, &host, uri.path(), kind);
			}
			Err(e)
		},
	}
}

async fn send(
	inputs: &ProxyInputs,
	conn: &mut PooledConn,
	req: ::http::Request<Body>,
) -> Result<::http::Response<Incoming>, ProxyError> {
	match tokio::time::timeout(inputs.cfg.engine.io_timeout, conn.send_request(req)).await {
		Ok(Ok(resp)) => Ok(resp),
		Ok(Err(e)) => {
			conn.record_error();
			Err(e)
		},
		Err(_) => {
			conn.record_error();
			Err(ProxyError::UpstreamTimeout)
		},
	}
}

fn map_read_err(e: http::ReadBodyError) -> ProxyError {
	match e {
		http::ReadBodyError::TooLarge => ProxyError::BodyTooLarge,
		http::ReadBodyError::Read(e) => ProxyError::UpstreamCall(e.to_string()),
	}
}
