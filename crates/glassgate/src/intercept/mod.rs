pub mod filter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::http::{HeaderMap, Method, StatusCode, Uri};
use crate::proxy::ProxyError;

/// Frozen copy of the request line and headers as the client sent them,
/// available to interceptors alongside the mutable overlay.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
}

/// Response data exposed to response-phase hooks.
#[derive(Debug)]
pub struct ResponseView {
	pub status: StatusCode,
	pub headers: HeaderMap,
	/// Buffered (and decoded) body; `None` when no interceptor registered
	/// body interest and the stream passes through untouched.
	pub body: Option<Bytes>,
}

/// Per-request context threaded through middleware and interceptors. The
/// `method`/`uri`/`headers` fields are the mutable overlay: engines forward
/// whatever they hold after the pipeline ran.
#[derive(Debug)]
pub struct RequestCtx {
	pub peer_addr: SocketAddr,
	pub ssl: bool,
	pub original: RequestHead,
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub request_body: Option<Bytes>,
	pub response: Option<ResponseView>,
	pub intercepted: bool,
	pub stopped: bool,
}

impl RequestCtx {
	pub fn new(peer_addr: SocketAddr, ssl: bool, head: RequestHead) -> RequestCtx {
		RequestCtx {
			peer_addr,
			ssl,
			method: head.method.clone(),
			uri: head.uri.clone(),
			headers: head.headers.clone(),
			original: head,
			request_body: None,
			response: None,
			intercepted: false,
			stopped: false,
		}
	}
}

/// Overlay merged into the context by `ModifyAndForward`.
#[derive(Debug, Default)]
pub struct Overlay {
	pub uri: Option<Uri>,
	pub method: Option<Method>,
	pub headers: Option<HeaderMap>,
	pub body: Option<Bytes>,
}

/// Short-circuit response emitted directly to the client.
#[derive(Debug)]
pub struct DirectResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl DirectResponse {
	pub fn new(status: StatusCode) -> DirectResponse {
		DirectResponse {
			status,
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}
}

#[derive(Debug)]
pub enum InterceptAction {
	/// Continue to the next interceptor (or to the origin / client).
	Next,
	/// Merge the overlay into the context, then continue.
	ModifyAndForward(Overlay),
	/// Skip forwarding; the engine emits this response.
	DirectResponse(DirectResponse),
}

/// Which bodies an interceptor needs buffered. Streaming flows stay streaming
/// unless some registered interceptor asks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyInterest {
	pub request: bool,
	pub response: bool,
}

impl BodyInterest {
	pub const NONE: BodyInterest = BodyInterest {
		request: false,
		response: false,
	};
	pub const RESPONSE: BodyInterest = BodyInterest {
		request: false,
		response: true,
	};
	pub const BOTH: BodyInterest = BodyInterest {
		request: true,
		response: true,
	};
}

#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
	/// Higher priority runs earlier.
	fn priority(&self) -> i32 {
		0
	}
	fn body_interest(&self) -> BodyInterest {
		BodyInterest::NONE
	}
	async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		Ok(InterceptAction::Next)
	}
	async fn on_response(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		Ok(InterceptAction::Next)
	}
}

/// Before/after hooks around the interceptor pipeline, per stage.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
	async fn before_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<()> {
		Ok(())
	}
	async fn after_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<()> {
		Ok(())
	}
	async fn on_connect(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
		Ok(())
	}
	async fn on_upgrade(&self, _ctx: &mut RequestCtx) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Legacy single-function hook form, wrapped as a priority-0 interceptor.
pub type LegacyRequestHook =
	Arc<dyn Fn(&mut RequestCtx) -> anyhow::Result<InterceptAction> + Send + Sync>;

struct LegacyInterceptor {
	on_request: Option<LegacyRequestHook>,
	on_response: Option<LegacyRequestHook>,
}

#[async_trait::async_trait]
impl Interceptor for LegacyInterceptor {
	async fn on_request(&self, ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		match &self.on_request {
			Some(hook) => hook(ctx),
			None => Ok(InterceptAction::Next),
		}
	}
	async fn on_response(&self, ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		match &self.on_response {
			Some(hook) => hook(ctx),
			None => Ok(InterceptAction::Next),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Request,
	Response,
}

/// Ordered interceptor/middleware pipeline. Hook deadlines are enforced here,
/// not by implementations: an overrunning hook maps to 504, a failing hook to
/// 500.
pub struct Pipeline {
	interceptors: Vec<Arc<dyn Interceptor>>,
	middleware: Vec<Arc<dyn Middleware>>,
	deadline: Duration,
}

impl Pipeline {
	pub fn new(
		mut interceptors: Vec<Arc<dyn Interceptor>>,
		middleware: Vec<Arc<dyn Middleware>>,
		deadline: Duration,
	) -> Pipeline {
		interceptors.sort_by_key(|i| std::cmp::Reverse(i.priority()));
		Pipeline {
			interceptors,
			middleware,
			deadline,
		}
	}

	pub fn wrap_legacy(
		on_request: Option<LegacyRequestHook>,
		on_response: Option<LegacyRequestHook>,
	) -> Arc<dyn Interceptor> {
		Arc::new(LegacyInterceptor {
			on_request,
			on_response,
		})
	}

	pub fn is_empty(&self) -> bool {
		self.interceptors.is_empty() && self.middleware.is_empty()
	}

	pub fn body_interest(&self) -> BodyInterest {
		let mut interest = BodyInterest::NONE;
		for i in &self.interceptors {
			let bi = i.body_interest();
			interest.request |= bi.request;
			interest.response |= bi.response;
		}
		interest
	}

	pub async fn before_request(&self, ctx: &mut RequestCtx) -> Result<(), ProxyError> {
		for mw in &self.middleware {
			self.with_deadline(mw.before_request(ctx)).await?;
		}
		Ok(())
	}

	pub async fn after_request(&self, ctx: &mut RequestCtx) -> Result<(), ProxyError> {
		for mw in &self.middleware {
			self.with_deadline(mw.after_request(ctx)).await?;
		}
		Ok(())
	}

	pub async fn on_connect(&self, host: &str, port: u16) -> Result<(), ProxyError> {
		for mw in &self.middleware {
			self.with_deadline(mw.on_connect(host, port)).await?;
		}
		Ok(())
	}

	pub async fn on_upgrade(&self, ctx: &mut RequestCtx) -> Result<(), ProxyError> {
		for mw in &self.middleware {
			self.with_deadline(mw.on_upgrade(ctx)).await?;
		}
		Ok(())
	}

	pub async fn run_request(
		&self,
		ctx: &mut RequestCtx,
	) -> Result<Option<DirectResponse>, ProxyError> {
		self.run_phase(ctx, Phase::Request).await
	}

	pub async fn run_response(
		&self,
		ctx: &mut RequestCtx,
	) -> Result<Option<DirectResponse>, ProxyError> {
		self.run_phase(ctx, Phase::Response).await
	}

	async fn run_phase(
		&self,
		ctx: &mut RequestCtx,
		phase: Phase,
	) -> Result<Option<DirectResponse>, ProxyError> {
		for interceptor in &self.interceptors {
			let fut = async {
				match phase {
					Phase::Request => interceptor.on_request(ctx).await,
					Phase::Response => interceptor.on_response(ctx).await,
				}
			};
			let action = self.with_deadline(fut).await?;
			match action {
				InterceptAction::Next => {},
				InterceptAction::ModifyAndForward(overlay) => {
					apply_overlay(ctx, overlay);
					ctx.intercepted = true;
				},
				InterceptAction::DirectResponse(dr) => {
					ctx.intercepted = true;
					ctx.stopped = true;
					return Ok(Some(dr));
				},
			}
		}
		Ok(None)
	}

	async fn with_deadline<T>(
		&self,
		fut: impl Future<Output = anyhow::Result<T>>,
	) -> Result<T, ProxyError> {
		match tokio::time::timeout(self.deadline, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(e)) => Err(ProxyError::Interceptor(e.to_string())),
			Err(_) => Err(ProxyError::InterceptorTimeout),
		}
	}
}

fn apply_overlay(ctx: &mut RequestCtx, overlay: Overlay) {
	if let Some(uri) = overlay.uri {
		ctx.uri = uri;
	}
	if let Some(method) = overlay.method {
		ctx.method = method;
	}
	if let Some(headers) = overlay.headers {
		for (name, value) in headers.iter() {
			ctx.headers.insert(name.clone(), value.clone());
		}
	}
	if let Some(body) = overlay.body {
		ctx.request_body = Some(body);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use assert_matches::assert_matches;

	use super::*;
	use crate::http::{HeaderValue, header};

	fn test_ctx() -> RequestCtx {
		RequestCtx::new(
			"127.0.0.1:5555".parse().unwrap(),
			false,
			RequestHead {
				method: Method::GET,
				uri: "http://example.com/".parse().unwrap(),
				headers: HeaderMap::new(),
			},
		)
	}

	struct Tagger {
		priority: i32,
		order: Arc<std::sync::Mutex<Vec<i32>>>,
	}

	#[async_trait::async_trait]
	impl Interceptor for Tagger {
		fn priority(&self) -> i32 {
			self.priority
		}
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			self.order.lock().unwrap().push(self.priority);
			Ok(InterceptAction::Next)
		}
	}

	#[tokio::test]
	async fn runs_in_descending_priority_order() {
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));
		let pipeline = Pipeline::new(
			vec![
				Arc::new(Tagger {
					priority: 1,
					order: order.clone(),
				}),
				Arc::new(Tagger {
					priority: 10,
					order: order.clone(),
				}),
				Arc::new(Tagger {
					priority: 5,
					order: order.clone(),
				}),
			],
			vec![],
			Duration::from_secs(1),
		);
		let mut ctx = test_ctx();
		pipeline.run_request(&mut ctx).await.unwrap();
		assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);
	}

	struct Blocker;

	#[async_trait::async_trait]
	impl Interceptor for Blocker {
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			let mut dr = DirectResponse::new(StatusCode::FORBIDDEN);
			dr.body = Bytes::from_static(b"blocked");
			Ok(InterceptAction::DirectResponse(dr))
		}
	}

	struct Counter(AtomicUsize);

	#[async_trait::async_trait]
	impl Interceptor for Counter {
		fn priority(&self) -> i32 {
			-1
		}
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			self.0.fetch_add(1, Ordering::SeqCst);
			Ok(InterceptAction::Next)
		}
	}

	#[tokio::test]
	async fn direct_response_short_circuits() {
		let counter = Arc::new(Counter(AtomicUsize::new(0)));
		let pipeline = Pipeline::new(
			vec![Arc::new(Blocker), counter.clone()],
			vec![],
			Duration::from_secs(1),
		);
		let mut ctx = test_ctx();
		let dr = pipeline.run_request(&mut ctx).await.unwrap().unwrap();
		assert_eq!(dr.status, StatusCode::FORBIDDEN);
		assert!(ctx.stopped);
		assert_eq!(counter.0.load(Ordering::SeqCst), 0);
	}

	struct Sleeper;

	#[async_trait::async_trait]
	impl Interceptor for Sleeper {
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			tokio::time::sleep(Duration::from_secs(60)).await;
			Ok(InterceptAction::Next)
		}
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_maps_to_timeout() {
		let pipeline = Pipeline::new(vec![Arc::new(Sleeper)], vec![], Duration::from_secs(1));
		let mut ctx = test_ctx();
		assert_matches!(
			pipeline.run_request(&mut ctx).await,
			Err(ProxyError::InterceptorTimeout)
		);
	}

	struct Failer;

	#[async_trait::async_trait]
	impl Interceptor for Failer {
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			anyhow::bail!("boom")
		}
	}

	#[tokio::test]
	async fn hook_errors_map_to_interceptor_error() {
		let pipeline = Pipeline::new(vec![Arc::new(Failer)], vec![], Duration::from_secs(1));
		let mut ctx = test_ctx();
		assert_matches!(
			pipeline.run_request(&mut ctx).await,
			Err(ProxyError::Interceptor(_))
		);
	}

	struct Rewriter;

	#[async_trait::async_trait]
	impl Interceptor for Rewriter {
		async fn on_request(&self, _ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
			let mut headers = HeaderMap::new();
			headers.insert(header::USER_AGENT, "glassgate-test".parse().unwrap());
			Ok(InterceptAction::ModifyAndForward(Overlay {
				uri: Some("http://example.com/rewritten".parse().unwrap()),
				method: Some(Method::POST),
				headers: Some(headers),
				body: Some(Bytes::from_static(b"payload")),
			}))
		}
	}

	#[tokio::test]
	async fn overlay_merges_into_context() {
		let pipeline = Pipeline::new(vec![Arc::new(Rewriter)], vec![], Duration::from_secs(1));
		let mut ctx = test_ctx();
		let dr = pipeline.run_request(&mut ctx).await.unwrap();
		assert!(dr.is_none());
		assert!(ctx.intercepted);
		assert_eq!(ctx.method, Method::POST);
		assert_eq!(ctx.uri.path(), "/rewritten");
		assert_eq!(ctx.headers.get(header::USER_AGENT).unwrap(), "glassgate-test");
		assert_eq!(ctx.request_body.as_deref(), Some(&b"payload"[..]));
		// The original head is untouched.
		assert_eq!(ctx.original.method, Method::GET);
	}

	#[tokio::test]
	async fn legacy_hooks_wrap_as_interceptors() {
		let wrapped = Pipeline::wrap_legacy(
			Some(Arc::new(|ctx: &mut RequestCtx| {
				ctx.headers
					.insert("x-legacy", HeaderValue::from_static("1"));
				Ok(InterceptAction::Next)
			})),
			None,
		);
		let pipeline = Pipeline::new(vec![wrapped], vec![], Duration::from_secs(1));
		let mut ctx = test_ctx();
		pipeline.run_request(&mut ctx).await.unwrap();
		assert_eq!(ctx.headers.get("x-legacy").unwrap(), "1");
	}
}
