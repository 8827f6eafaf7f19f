use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, defaults};
use crate::errorcache::ErrorCache;
use crate::http::{self, Method};
use crate::intercept::filter::InterceptFilter;
use crate::intercept::{Interceptor, LegacyRequestHook, Middleware, Pipeline};
use crate::pool::ConnectionPool;
use crate::pool::upstream::UpstreamProxy;
use crate::proxy::connect::SslConnectHook;
use crate::proxy::{ProxyError, connect, request, upgrade};
use crate::telemetry::metrics::{self, Metrics};
use crate::tls::ca::CertAuthority;
use crate::tls::factory::{CertFactory, LeafCert};
use crate::tls::registry::FakeServerRegistry;

pub type UpstreamFn = Arc<dyn Fn(&str, u16, bool) -> Option<UpstreamProxy> + Send + Sync>;

/// How origin connections pick their upstream chain: none, one fixed proxy,
/// or a per-request callback.
pub enum UpstreamSelect {
	Off,
	Fixed(UpstreamProxy),
	Dynamic(UpstreamFn),
}

impl UpstreamSelect {
	pub fn select(&self, host: &str, port: u16, tls: bool) -> Option<UpstreamProxy> {
		match self {
			UpstreamSelect::Off => None,
			UpstreamSelect::Fixed(p) => Some(p.clone()),
			UpstreamSelect::Dynamic(f) => f(host, port, tls),
		}
	}
}

/// Everything the engines share. Owned by the server; never process-global.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub metrics: Arc<Metrics>,
	pub pool: ConnectionPool,
	pub factory: Arc<CertFactory>,
	pub registry: Arc<FakeServerRegistry>,
	pub filter: InterceptFilter,
	pub pipeline: Pipeline,
	pub error_cache: ErrorCache,
	pub upstream: UpstreamSelect,
	pub ssl_connect: Option<SslConnectHook>,
}

pub struct ServerBuilder {
	cfg: Config,
	interceptors: Vec<Arc<dyn Interceptor>>,
	middleware: Vec<Arc<dyn Middleware>>,
	ssl_connect: Option<SslConnectHook>,
	upstream_fn: Option<UpstreamFn>,
}

impl ServerBuilder {
	pub fn new(cfg: Config) -> ServerBuilder {
		ServerBuilder {
			cfg,
			interceptors: Vec::new(),
			middleware: Vec::new(),
			ssl_connect: None,
			upstream_fn: None,
		}
	}

	pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
		self.interceptors.push(interceptor);
		self
	}

	/// Wrap the legacy single-function request/response hooks as a
	/// priority-0 interceptor.
	pub fn with_legacy_hooks(
		mut self,
		on_request: Option<LegacyRequestHook>,
		on_response: Option<LegacyRequestHook>,
	) -> Self {
		self
			.interceptors
			.push(Pipeline::wrap_legacy(on_request, on_response));
		self
	}

	pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
		self.middleware.push(middleware);
		self
	}

	/// Per-CONNECT decision: intercept, tunnel, or refuse. Overrides the
	/// selective filter's domain rules.
	pub fn with_ssl_connect_hook(mut self, hook: SslConnectHook) -> Self {
		self.ssl_connect = Some(hook);
		self
	}

	/// Per-request upstream proxy selection. Overrides `external_proxy`.
	pub fn with_upstream_fn(mut self, f: UpstreamFn) -> Self {
		self.upstream_fn = Some(f);
		self
	}

	pub async fn bind(self) -> anyhow::Result<Server> {
		let cfg = Arc::new(self.cfg);

		let cert_path = cfg
			.ca_cert_path
			.clone()
			.unwrap_or_else(|| PathBuf::from(".glassgate/ca.crt"));
		let key_path = cfg
			.ca_key_path
			.clone()
			.unwrap_or_else(|| PathBuf::from(".glassgate/ca.key"));
		let ca = Arc::new(CertAuthority::load_or_generate(&cert_path, &key_path)?);

		let mut prometheus = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(&mut prometheus));

		let factory = Arc::new(CertFactory::new(
			ca,
			cfg.get_cert_socket_timeout,
			defaults::cert_cache_capacity(),
			metrics.clone(),
		)?);
		if let Some(fixed) = load_fixed_cert(&cfg)? {
			info!("fixed-certificate mode enabled");
			factory.set_fixed(Some(fixed));
		}
		let registry = Arc::new(FakeServerRegistry::new(
			factory.clone(),
			defaults::fake_server_capacity(),
			metrics.clone(),
		));

		let pool = ConnectionPool::new(cfg.pool.clone(), cfg.engine.io_timeout, metrics.clone())?;
		let upstream = match (&self.upstream_fn, &cfg.external_proxy) {
			(Some(f), _) => UpstreamSelect::Dynamic(f.clone()),
			(None, Some(raw)) => {
				let proxy = UpstreamProxy::parse(raw)
					.map_err(|e| anyhow::anyhow!("external_proxy: {e}"))?;
				info!(%proxy, "chaining all origin connections through upstream proxy");
				UpstreamSelect::Fixed(proxy)
			},
			(None, None) => UpstreamSelect::Off,
		};

		let inputs = Arc::new(ProxyInputs {
			filter: InterceptFilter::new(cfg.intercept.clone()),
			pipeline: Pipeline::new(
				self.interceptors,
				self.middleware,
				cfg.engine.interceptor_deadline,
			),
			error_cache: ErrorCache::new(defaults::error_cache_capacity(), cfg.engine.error_cache_ttl),
			metrics: metrics.clone(),
			pool: pool.clone(),
			factory,
			registry,
			upstream,
			ssl_connect: self.ssl_connect,
			cfg: cfg.clone(),
		});

		let listener = TcpListener::bind((cfg.host, cfg.port)).await?;
		let local_addr = listener.local_addr()?;
		info!(addr = %local_addr, "proxy listening");

		let mut background = vec![pool.spawn_sweeper(), pool.spawn_health_walk()];
		if cfg.enable_performance_metrics {
			background.push(metrics::spawn_reporter(
				metrics,
				std::time::Duration::from_secs(60),
			));
		}

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Ok(Server {
			inputs,
			listener,
			local_addr,
			prometheus,
			shutdown_tx,
			shutdown_rx,
			background,
		})
	}
}

pub struct Server {
	inputs: Arc<ProxyInputs>,
	listener: TcpListener,
	local_addr: SocketAddr,
	prometheus: prometheus_client::registry::Registry,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	background: Vec<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
	pub fn shutdown(&self) {
		let _ = self.0.send(true);
	}
}

impl Server {
	pub fn builder(cfg: Config) -> ServerBuilder {
		ServerBuilder::new(cfg)
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// PEM of the signing root; clients must trust it for interception.
	pub fn ca_cert_pem(&self) -> String {
		self.inputs.factory.ca().cert_pem().to_string()
	}

	/// Certificate factory handle, e.g. for toggling fixed-certificate mode
	/// at runtime.
	pub fn cert_factory(&self) -> &Arc<CertFactory> {
		&self.inputs.factory
	}

	pub fn shutdown_handle(&self) -> ShutdownHandle {
		ShutdownHandle(self.shutdown_tx.clone())
	}

	pub fn metrics_text(&self) -> String {
		let mut out = String::new();
		let _ = prometheus_client::encoding::text::encode(&mut out, &self.prometheus);
		out
	}

	/// Accept loop. On shutdown the listener closes first, then in-flight
	/// connections are awaited up to `shutdown_deadline`; stragglers are
	/// aborted.
	pub async fn run(mut self) -> anyhow::Result<()> {
		let mut connections = JoinSet::new();
		loop {
			tokio::select! {
				res = self.listener.accept() => {
					match res {
						Ok((stream, peer)) => {
							self.inputs.metrics.downstream_connections.inc();
							let inputs = self.inputs.clone();
							connections.spawn(async move {
								handle_connection(inputs, stream, peer).await;
							});
						},
						Err(e) => {
							warn!("accept failed: {e}");
						},
					}
				}
				Some(res) = connections.join_next() => {
					if let Err(e) = res
						&& !e.is_cancelled()
					{
						warn!("connection task failed: {e}");
					}
				}
				_ = self.shutdown_rx.changed() => {
					info!("shutdown signalled; closing listener");
					break;
				}
			}
		}
		drop(self.listener);
		for task in &self.background {
			task.abort();
		}

		let deadline = self.inputs.cfg.engine.shutdown_deadline;
		let drained = tokio::time::timeout(deadline, async {
			while connections.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!(
				remaining = connections.len(),
				"shutdown deadline reached; aborting in-flight connections",
			);
			connections.shutdown().await;
		}
		info!("proxy stopped");
		Ok(())
	}
}

async fn handle_connection(inputs: Arc<ProxyInputs>, stream: TcpStream, peer: SocketAddr) {
	let _ = stream.set_nodelay(true);
	let svc = hyper::service::service_fn(move |req| {
		let inputs = inputs.clone();
		async move { Ok::<_, Infallible>(dispatch(inputs, peer, false, req).await) }
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.serve_connection(TokioIo::new(stream), svc)
		.with_upgrades();
	if let Err(e) = conn.await {
		debug!(%peer, "client connection ended: {e}");
	}
}

/// Route one message to the right engine. Re-entered with `ssl=true` for
/// requests decrypted by a fake server.
///
/// Boxed to break the recursive future type that would otherwise result:
/// `dispatch` -> `connect::handle` -> (spawned) `mitm` -> `dispatch`.
pub(crate) fn dispatch(
	inputs: Arc<ProxyInputs>,
	peer: SocketAddr,
	ssl: bool,
	req: ::http::Request<Incoming>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = http::Response> + Send>> {
	Box::pin(async move {
		if req.method() == Method::CONNECT {
			if ssl {
				return ProxyError::ClientProtocol("CONNECT inside an intercepted tunnel".to_string())
					.as_response();
			}
			return connect::handle(inputs, peer, req).await;
		}
		if http::is_websocket_upgrade(req.method(), req.headers()) {
			return upgrade::handle(inputs, peer, ssl, req).await;
		}
		request::handle(inputs, peer, ssl, req).await
	})
}

fn load_fixed_cert(cfg: &Config) -> anyhow::Result<Option<Arc<LeafCert>>> {
	let cert_pem = match (&cfg.fixed_cert, &cfg.fixed_cert_path) {
		(Some(inline), _) => Some(inline.clone()),
		(None, Some(path)) => Some(std::fs::read_to_string(path)?),
		(None, None) => None,
	};
	let key_pem = match (&cfg.fixed_key, &cfg.fixed_key_path) {
		(Some(inline), _) => Some(inline.clone()),
		(None, Some(path)) => Some(std::fs::read_to_string(path)?),
		(None, None) => None,
	};
	match (cert_pem, key_pem) {
		(Some(cert), Some(key)) => Ok(Some(LeafCert::from_pem(&cert, &key)?)),
		(None, None) => Ok(None),
		_ => anyhow::bail!("fixed certificate requires both cert and key"),
	}
}
