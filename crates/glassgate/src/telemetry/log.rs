use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Buf;
use http_body::{Frame, SizeHint};
use tracing::info;

use crate::http::{Method, StatusCode};
use crate::telemetry::metrics::Metrics;

/// Per-request access-log record. Emitted exactly once, when the record is
/// dropped — which [`LogBody`] arranges to be after the response body has
/// finished streaming to the client.
#[derive(Debug)]
pub struct RequestLog {
	pub method: Method,
	pub host: String,
	pub path: String,
	pub peer_addr: SocketAddr,
	pub ssl: bool,
	pub intercepted: bool,
	pub fast_path: bool,
	pub status: Option<StatusCode>,
	pub request_bytes: u64,
	pub response_bytes: u64,
	pub error: Option<String>,
	pub start: Instant,
	metrics: Arc<Metrics>,
	emitted: bool,
}

impl RequestLog {
	pub fn new(
		metrics: Arc<Metrics>,
		peer_addr: SocketAddr,
		method: Method,
		host: String,
		path: String,
		ssl: bool,
	) -> RequestLog {
		RequestLog {
			method,
			host,
			path,
			peer_addr,
			ssl,
			intercepted: false,
			fast_path: false,
			status: None,
			request_bytes: 0,
			response_bytes: 0,
			error: None,
			start: Instant::now(),
			metrics,
			emitted: false,
		}
	}

	fn emit(&mut self) {
		if self.emitted {
			return;
		}
		self.emitted = true;
		let dur = self.start.elapsed();
		self.metrics.request_duration.observe(dur.as_secs_f64());
		info!(
			target: "request",
			src = %self.peer_addr,
			method = %self.method,
			host = %self.host,
			path = %self.path,
			status = self.status.map(|s| s.as_u16()),
			ssl = self.ssl,
			intercepted = self.intercepted,
			fast_path = self.fast_path,
			request_bytes = self.request_bytes,
			response_bytes = self.response_bytes,
			error = self.error.as_deref(),
			duration = ?dur,
		);
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		self.emit()
	}
}

pin_project_lite::pin_project! {
	/// Body wrapper that counts streamed bytes into a [`RequestLog`] and holds
	/// it alive until the stream completes, so the emitted record carries the
	/// full response size and duration.
	pub struct LogBody<B> {
		#[pin]
		inner: B,
		log: Option<RequestLog>,
	}
}

impl<B> LogBody<B> {
	pub fn new(inner: B, log: RequestLog) -> LogBody<B> {
		LogBody {
			inner,
			log: Some(log),
		}
	}
}

impl<B: http_body::Body> http_body::Body for LogBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		let res = std::task::ready!(this.inner.as_mut().poll_frame(cx));
		match res {
			Some(Ok(frame)) => {
				if let Some(log) = this.log.as_mut()
					&& let Some(data) = frame.data_ref()
				{
					log.response_bytes += data.remaining() as u64;
				}
				// The caller may never poll past the final frame; emit as soon
				// as the end of the stream is known.
				if this.inner.is_end_stream()
					&& let Some(mut log) = this.log.take()
				{
					log.emit();
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => {
				// Stream finished (or failed): emit now rather than waiting for drop.
				if let Some(mut log) = this.log.take() {
					log.emit();
				}
				Poll::Ready(other)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::BodyExt;

	#[tokio::test]
	async fn counts_streamed_bytes() {
		let log = RequestLog::new(
			Metrics::unregistered(),
			"127.0.0.1:1234".parse().unwrap(),
			Method::GET,
			"example.com".into(),
			"/".into(),
			false,
		);
		let body = LogBody::new(crate::http::full_body("hello"), log);
		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(collected.as_ref(), b"hello");
	}
}
