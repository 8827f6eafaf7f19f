pub mod compression;

use bytes::Bytes;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub fn empty_body() -> Body {
	Body::empty()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	Body::from(data.into())
}

pub fn incoming_body(body: hyper::body::Incoming) -> Body {
	Body::new(body)
}

pub fn plain_response(status: StatusCode, msg: &str) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full_body(msg.to_string()))
		.expect("builder with known status code should not fail")
}

// Hop-by-hop headers, stripped before forwarding. proxy-connection and
// proxy-authorization stay when an upstream proxy is chained (they are
// meaningful to it, not to the origin).
static HOP_HEADERS: [HeaderName; 7] = [
	header::CONNECTION,
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

static PROXY_HOP_HEADERS: [HeaderName; 2] = [
	HeaderName::from_static("proxy-connection"),
	header::PROXY_AUTHORIZATION,
];

pub fn strip_hop_headers(headers: &mut HeaderMap, chained_upstream: bool) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
	if !chained_upstream {
		for h in PROXY_HOP_HEADERS.iter() {
			headers.remove(h);
		}
	}
}

/// The http library will not put the authority into `uri.authority` for
/// origin-form HTTP/1.1 requests. Normalize from the Host header so the rest
/// of the engine only deals with absolute URIs. `tls` selects the scheme when
/// the request arrived over a TLS-terminated CONNECT.
pub fn normalize_uri<B>(req: &mut ::http::Request<B>, tls: bool) -> anyhow::Result<()> {
	if req.uri().authority().is_some() {
		if req.uri().scheme().is_none() {
			let mut parts = std::mem::take(req.uri_mut()).into_parts();
			parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some("/".parse().expect("static path"));
			}
			*req.uri_mut() = Uri::from_parts(parts)?;
		}
		return Ok(());
	}
	let host = req
		.headers()
		.get(header::HOST)
		.and_then(|h| h.to_str().ok())
		.and_then(|h| h.parse::<Authority>().ok())
		.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
	let mut parts = std::mem::take(req.uri_mut()).into_parts();
	parts.authority = Some(host);
	parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
	if parts.path_and_query.is_none() {
		parts.path_and_query = Some("/".parse().expect("static path"));
	}
	*req.uri_mut() = Uri::from_parts(parts)?;
	Ok(())
}

pub fn host_of(uri: &Uri) -> Option<&str> {
	uri.host()
}

pub fn port_of(uri: &Uri) -> u16 {
	uri
		.port_u16()
		.unwrap_or(if uri.scheme() == Some(&Scheme::HTTPS) { 443 } else { 80 })
}

pub fn upgrade_type(headers: &HeaderMap) -> Option<&HeaderValue> {
	let connection_has_upgrade = headers
		.get(header::CONNECTION)
		.and_then(|h| h.to_str().ok())
		.map(|h| {
			h.split(',')
				.any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
		})
		.unwrap_or(false);
	if connection_has_upgrade {
		headers.get(header::UPGRADE)
	} else {
		None
	}
}

pub fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
	method == Method::GET
		&& upgrade_type(headers)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.eq_ignore_ascii_case("websocket"))
			.unwrap_or(false)
}

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`, per RFC 6455.
pub fn websocket_accept_key(key: &str) -> String {
	use base64::Engine;
	use sha1::{Digest, Sha1};
	let mut hasher = Sha1::new();
	hasher.update(key.as_bytes());
	hasher.update(WEBSOCKET_GUID.as_bytes());
	base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Read a body to completion, failing once `limit` bytes have been buffered.
pub async fn read_body_with_limit<B>(body: B, limit: usize) -> Result<Bytes, ReadBodyError>
where
	B: http_body::Body,
	B::Data: bytes::Buf,
	B::Error: Into<BoxError>,
{
	use bytes::Buf;
	use http_body_util::BodyExt;
	let mut buf = Vec::new();
	let mut body = std::pin::pin!(body);
	while let Some(frame) = body.frame().await {
		let frame = frame.map_err(|e| ReadBodyError::Read(e.into()))?;
		if let Ok(data) = frame.into_data() {
			if buf.len() + data.remaining() > limit {
				return Err(ReadBodyError::TooLarge);
			}
			buf.extend_from_slice(data.chunk());
		}
	}
	Ok(Bytes::from(buf))
}

#[derive(Debug, thiserror::Error)]
pub enum ReadBodyError {
	#[error("body exceeded buffer limit")]
	TooLarge,
	#[error("body read failed: {0}")]
	Read(#[source] BoxError),
}
