pub mod connect;
pub mod request;
pub mod server;
pub mod upgrade;

use crate::http::{Response, StatusCode, plain_response};
use crate::tls::TlsError;

/// Classified dial failure, cacheable by the error cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialErrorKind {
	Dns,
	Refused,
	Timeout,
	Reset,
	Other,
}

impl DialErrorKind {
	pub fn classify(e: &std::io::Error) -> DialErrorKind {
		use std::io::ErrorKind;
		match e.kind() {
			ErrorKind::ConnectionRefused => DialErrorKind::Refused,
			ErrorKind::TimedOut => DialErrorKind::Timeout,
			ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
				DialErrorKind::Reset
			},
			ErrorKind::NotFound => DialErrorKind::Dns,
			// getaddrinfo failures surface as uncategorized io errors
			_ if e.to_string().contains("failed to lookup address") => DialErrorKind::Dns,
			_ => DialErrorKind::Other,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("invalid client request: {0}")]
	ClientProtocol(String),
	#[error("upstream DNS resolution failed")]
	UpstreamDns,
	#[error("upstream connection refused")]
	UpstreamRefused,
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("upstream connection reset")]
	UpstreamReset,
	#[error("upstream call failed: {0}")]
	UpstreamCall(String),
	#[error("certificate error: {0}")]
	Certificate(#[from] TlsError),
	#[error("interceptor failed: {0}")]
	Interceptor(String),
	#[error("interceptor deadline exceeded")]
	InterceptorTimeout,
	#[error("connection pool exhausted")]
	PoolExhausted,
	#[error("request body too large")]
	BodyTooLarge,
	#[error("{0}")]
	Processing(String),
}

impl ProxyError {
	pub fn from_dial(kind: DialErrorKind) -> ProxyError {
		match kind {
			DialErrorKind::Dns => ProxyError::UpstreamDns,
			DialErrorKind::Refused => ProxyError::UpstreamRefused,
			DialErrorKind::Timeout => ProxyError::UpstreamTimeout,
			DialErrorKind::Reset => ProxyError::UpstreamReset,
			DialErrorKind::Other => ProxyError::UpstreamCall("connect failed".to_string()),
		}
	}

	pub fn dial_kind(&self) -> Option<DialErrorKind> {
		match self {
			ProxyError::UpstreamDns => Some(DialErrorKind::Dns),
			ProxyError::UpstreamRefused => Some(DialErrorKind::Refused),
			ProxyError::UpstreamTimeout => Some(DialErrorKind::Timeout),
			ProxyError::UpstreamReset => Some(DialErrorKind::Reset),
			_ => None,
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::ClientProtocol(_) => StatusCode::BAD_REQUEST,
			ProxyError::UpstreamDns => StatusCode::NOT_FOUND,
			ProxyError::UpstreamRefused => StatusCode::SERVICE_UNAVAILABLE,
			// Waiting past the request timeout for a pool slot is indistinguishable
			// from a slow upstream.
			ProxyError::UpstreamTimeout | ProxyError::PoolExhausted => {
				StatusCode::GATEWAY_TIMEOUT
			},
			ProxyError::UpstreamReset | ProxyError::UpstreamCall(_) => StatusCode::BAD_GATEWAY,
			ProxyError::InterceptorTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::Certificate(_)
			| ProxyError::Interceptor(_)
			| ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn as_response(&self) -> Response {
		plain_response(self.status(), &self.to_string())
	}
}
