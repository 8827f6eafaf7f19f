pub mod upstream;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::proxy::{DialErrorKind, ProxyError};
use crate::telemetry::metrics::{Metrics, PoolKeyLabels};
use upstream::{BoxedStream, UpstreamProxy};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_WALK_INTERVAL: Duration = Duration::from_secs(300);

/// Identity grouping reusable origin connections. Auth and upstream identity
/// are part of the key so distinct credentials or chains never share sockets;
/// `sticky` pins an authenticated client conversation (NTLM) to one socket
/// lineage.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PoolKey {
	pub tls: bool,
	pub host: String,
	pub port: u16,
	pub auth: Option<String>,
	pub upstream: Option<UpstreamProxy>,
	pub sticky: Option<u64>,
}

impl PoolKey {
	pub fn new(tls: bool, host: &str, port: u16) -> PoolKey {
		PoolKey {
			tls,
			host: host.to_ascii_lowercase(),
			port,
			auth: None,
			upstream: None,
			sticky: None,
		}
	}
}

impl std::fmt::Display for PoolKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let scheme = if self.tls { "https" } else { "http" };
		write!(f, "{scheme}://")?;
		if let Some(auth) = &self.auth {
			write!(f, "{auth}@")?;
		}
		write!(f, "{}:{}", self.host, self.port)?;
		if let Some(sticky) = self.sticky {
			write!(f, "#{sticky}")?;
		}
		Ok(())
	}
}

/// One established HTTP/1.1 origin connection: the hyper sender plus the task
/// driving the transport.
pub struct Http1Conn {
	sender: http1::SendRequest<crate::http::Body>,
	driver: tokio::task::JoinHandle<()>,
	created_at: Instant,
	error_count: u32,
}

impl Http1Conn {
	fn is_open(&self) -> bool {
		!self.sender.is_closed()
	}
}

struct Idle {
	conn: Http1Conn,
	idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
	idle: HashMap<PoolKey, Vec<Idle>>,
	/// Live sockets per key: in use + idle. Bounded by `max_sockets`.
	counts: HashMap<PoolKey, usize>,
}

struct PoolInner {
	cfg: PoolConfig,
	io_timeout: Duration,
	tls: tokio_rustls::TlsConnector,
	metrics: Arc<Metrics>,
	state: Mutex<PoolState>,
	released: Notify,
}

/// Per-origin keep-alive pool. Checkout prefers the most recently used idle
/// socket (LIFO); creation dials with retry/backoff, optionally through the
/// configured upstream proxy. Connections dropped mid-request are destroyed,
/// never reused.
#[derive(Clone)]
pub struct ConnectionPool {
	inner: Arc<PoolInner>,
}

impl ConnectionPool {
	pub fn new(
		cfg: PoolConfig,
		io_timeout: Duration,
		metrics: Arc<Metrics>,
	) -> Result<ConnectionPool, crate::tls::TlsError> {
		let tls_config = Arc::new(crate::tls::origin_client_config()?);
		Ok(ConnectionPool {
			inner: Arc::new(PoolInner {
				cfg,
				io_timeout,
				tls: tokio_rustls::TlsConnector::from(tls_config),
				metrics,
				state: Mutex::new(PoolState::default()),
				released: Notify::new(),
			}),
		})
	}

	pub fn config(&self) -> &PoolConfig {
		&self.inner.cfg
	}

	/// Acquire a connection for `key`: an eligible idle socket if one exists,
	/// a fresh dial if the key is under `max_sockets`, else wait for a release
	/// until the request timeout (mapped to pool exhaustion).
	pub async fn checkout(&self, key: PoolKey) -> Result<PooledConn, ProxyError> {
		let deadline = tokio::time::Instant::now() + self.inner.io_timeout;
		loop {
			enum Plan {
				Reuse(Http1Conn),
				Dial,
				Wait,
			}
			let plan = {
				let mut state = self.inner.state.lock();
				let mut reused = None;
				let mut destroyed = 0usize;
				if let Some(idle) = state.idle.get_mut(&key) {
					while let Some(entry) = idle.pop() {
						if self.eligible(&key, &entry) {
							reused = Some(entry.conn);
							break;
						}
						entry.conn.driver.abort();
						destroyed += 1;
					}
				}
				if destroyed > 0 {
					let c = state.counts.entry(key.clone()).or_default();
					*c = c.saturating_sub(destroyed);
					self.update_gauge(&key, &state);
					for _ in 0..destroyed {
						self.inner.metrics.pool_destroys.inc();
						self.inner.released.notify_one();
					}
				}
				match reused {
					Some(conn) => Plan::Reuse(conn),
					None => {
						let count = state.counts.get(&key).copied().unwrap_or(0);
						if count < self.inner.cfg.max_sockets {
							// Reserve the slot before dialing outside the lock.
							*state.counts.entry(key.clone()).or_default() = count + 1;
							self.update_gauge(&key, &state);
							Plan::Dial
						} else {
							Plan::Wait
						}
					},
				}
			};

			match plan {
				Plan::Reuse(conn) => {
					trace!(key = %key, "pool hit");
					self.inner.metrics.pool_hits.inc();
					return Ok(PooledConn {
						key,
						conn: Some(conn),
						pool: self.inner.clone(),
						reusable: false,
					});
				},
				Plan::Dial => {
					self.inner.metrics.pool_misses.inc();
					match self.dial(&key).await {
						Ok(conn) => {
							self.inner.metrics.pool_creates.inc();
							return Ok(PooledConn {
								key,
								conn: Some(conn),
								pool: self.inner.clone(),
								reusable: false,
							});
						},
						Err(e) => {
							let mut state = self.inner.state.lock();
							if let Some(c) = state.counts.get_mut(&key) {
								*c = c.saturating_sub(1);
							}
							self.update_gauge(&key, &state);
							drop(state);
							self.inner.released.notify_one();
							return Err(e);
						},
					}
				},
				Plan::Wait => {
					if tokio::time::timeout_at(deadline, self.inner.released.notified())
						.await
						.is_err()
					{
						return Err(ProxyError::PoolExhausted);
					}
				},
			}
		}
	}

	fn eligible(&self, key: &PoolKey, entry: &Idle) -> bool {
		let cfg = &self.inner.cfg;
		let keep_alive = if key.sticky.is_some() {
			cfg.sticky_keep_alive_timeout
		} else {
			cfg.keep_alive_timeout
		};
		entry.conn.is_open()
			&& entry.conn.sender.is_ready()
			&& entry.idle_since.elapsed() <= keep_alive
			&& entry.conn.created_at.elapsed() <= cfg.max_connection_age
			&& entry.conn.error_count < cfg.max_error_count
	}

	/// Dial with retry and exponential backoff, then layer TLS for https keys
	/// and perform the HTTP/1.1 handshake.
	async fn dial(&self, key: &PoolKey) -> Result<Http1Conn, ProxyError> {
		let cfg = &self.inner.cfg;
		let mut delay = cfg.retry_delay;
		let mut last = DialErrorKind::Other;
		for attempt in 0..cfg.connect_retries.max(1) {
			if attempt > 0 {
				tokio::time::sleep(delay).await;
				delay *= 2;
			}
			match tokio::time::timeout(self.inner.io_timeout, self.connect_stream(key)).await {
				Ok(Ok(stream)) => return self.handshake(stream).await,
				Ok(Err(e)) => {
					last = DialErrorKind::classify(&e);
					self.inner.metrics.pool_connect_errors.inc();
					debug!(key = %key, attempt, "connect failed: {e}");
					// Only transient connect failures are worth retrying.
					if matches!(last, DialErrorKind::Dns) {
						break;
					}
				},
				Err(_) => {
					last = DialErrorKind::Timeout;
					self.inner.metrics.pool_connect_errors.inc();
					debug!(key = %key, attempt, "connect timed out");
				},
			}
		}
		Err(ProxyError::from_dial(last))
	}

	async fn connect_stream(&self, key: &PoolKey) -> std::io::Result<BoxedStream> {
		let stream: BoxedStream = match &key.upstream {
			None => {
				let tcp = TcpStream::connect((key.host.as_str(), key.port)).await?;
				self.apply_socket_options(&tcp);
				Box::new(tcp)
			},
			// Plain HTTP through an HTTP upstream: talk to the proxy itself in
			// absolute form; no tunnel.
			Some(proxy @ UpstreamProxy::Http { .. }) if !key.tls => proxy.connect_plain().await?,
			Some(proxy) => proxy.connect_through(&key.host, key.port).await?,
		};
		if !key.tls {
			return Ok(stream);
		}
		let name = server_name(&key.host)
			.ok_or_else(|| std::io::Error::other(format!("invalid hostname {}", key.host)))?;
		let tls = self.inner.tls.connect(name, stream).await?;
		Ok(Box::new(tls))
	}

	fn apply_socket_options(&self, tcp: &TcpStream) {
		if let Err(e) = tcp.set_nodelay(true) {
			debug!("failed to set TCP_NODELAY: {e}");
		}
		let keepalive = TcpKeepalive::new().with_time(self.inner.cfg.keep_alive_msec);
		if let Err(e) = SockRef::from(tcp).set_tcp_keepalive(&keepalive) {
			debug!("failed to enable TCP keepalive: {e}");
		}
	}

	async fn handshake(&self, stream: BoxedStream) -> Result<Http1Conn, ProxyError> {
		let (sender, conn) = http1::handshake(TokioIo::new(stream))
			.await
			.map_err(|e| ProxyError::UpstreamCall(e.to_string()))?;
		let driver = tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				debug!("origin connection terminated: {e}");
			}
		});
		Ok(Http1Conn {
			sender,
			driver,
			created_at: Instant::now(),
			error_count: 0,
		})
	}

	fn update_gauge(&self, key: &PoolKey, state: &PoolState) {
		let count = state.counts.get(key).copied().unwrap_or(0);
		self
			.inner
			.metrics
			.pool_active
			.get_or_create(&PoolKeyLabels {
				key: key.to_string(),
			})
			.set(count as i64);
	}

	/// Evict stale and dead idle sockets. Runs every 60 s.
	pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
		let pool = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(SWEEP_INTERVAL);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tick.tick().await;
				pool.sweep();
			}
		})
	}

	fn sweep(&self) {
		let mut state = self.inner.state.lock();
		let mut destroyed_keys: Vec<(PoolKey, usize)> = Vec::new();
		for (key, idle) in state.idle.iter_mut() {
			let before = idle.len();
			idle.retain(|entry| {
				let keep = self.eligible(key, entry);
				if !keep {
					entry.conn.driver.abort();
				}
				keep
			});
			let removed = before - idle.len();
			if removed > 0 {
				destroyed_keys.push((key.clone(), removed));
			}
		}
		state.idle.retain(|_, idle| !idle.is_empty());
		for (key, removed) in destroyed_keys {
			if let Some(c) = state.counts.get_mut(&key) {
				*c = c.saturating_sub(removed);
			}
			self.update_gauge(&key, &state);
			for _ in 0..removed {
				self.inner.metrics.pool_destroys.inc();
				self.inner.released.notify_one();
			}
			debug!(key = %key, removed, "swept idle origin sockets");
		}
		state.counts.retain(|_, c| *c > 0);
	}

	/// Soft health walk: report long-idle slots without touching them. Runs
	/// every 5 min.
	pub fn spawn_health_walk(&self) -> tokio::task::JoinHandle<()> {
		let pool = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(HEALTH_WALK_INTERVAL);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tick.tick().await;
				let state = pool.inner.state.lock();
				for (key, idle) in state.idle.iter() {
					let long_idle = idle
						.iter()
						.filter(|e| e.idle_since.elapsed() > pool.inner.cfg.keep_alive_timeout / 2)
						.count();
					if long_idle > 0 {
						debug!(key = %key, long_idle, total = idle.len(), "long-idle pool slots");
					}
				}
			}
		})
	}

	/// Dial a raw byte stream for tunnels and upgrades. These are never
	/// pooled: once spliced, the socket's HTTP state is gone. TLS is layered
	/// on when the key asks for it (wss); blind tunnels pass `tls=false` and
	/// relay the client's own TLS bytes.
	pub async fn dial_raw_with_upstream(&self, key: &PoolKey) -> Result<BoxedStream, ProxyError> {
		let cfg = &self.inner.cfg;
		let mut delay = cfg.retry_delay;
		let mut last = DialErrorKind::Other;
		for attempt in 0..cfg.connect_retries.max(1) {
			if attempt > 0 {
				tokio::time::sleep(delay).await;
				delay *= 2;
			}
			let raw = async {
				let stream: BoxedStream = match &key.upstream {
					None => {
						let tcp = TcpStream::connect((key.host.as_str(), key.port)).await?;
						self.apply_socket_options(&tcp);
						Box::new(tcp)
					},
					Some(proxy) => proxy.connect_through(&key.host, key.port).await?,
				};
				if !key.tls {
					return Ok::<BoxedStream, std::io::Error>(stream);
				}
				let name = server_name(&key.host).ok_or_else(|| {
					std::io::Error::other(format!("invalid hostname {}", key.host))
				})?;
				let tls = self.inner.tls.connect(name, stream).await?;
				Ok(Box::new(tls))
			};
			match tokio::time::timeout(self.inner.io_timeout, raw).await {
				Ok(Ok(stream)) => return Ok(stream),
				Ok(Err(e)) => {
					last = DialErrorKind::classify(&e);
					self.inner.metrics.pool_connect_errors.inc();
					debug!(key = %key, attempt, "tunnel connect failed: {e}");
					if matches!(last, DialErrorKind::Dns) {
						break;
					}
				},
				Err(_) => {
					last = DialErrorKind::Timeout;
					self.inner.metrics.pool_connect_errors.inc();
				},
			}
		}
		Err(ProxyError::from_dial(last))
	}
}

/// Exclusive borrow of a pooled connection. Dropped without
/// [`PooledConn::mark_reusable`] (client disconnect, stream error, taint) the
/// socket is destroyed; marked reusable it returns to the idle list, subject
/// to `max_free_sockets`.
pub struct PooledConn {
	key: PoolKey,
	conn: Option<Http1Conn>,
	pool: Arc<PoolInner>,
	reusable: bool,
}

impl std::fmt::Debug for PooledConn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledConn")
			.field("key", &self.key)
			.field("reusable", &self.reusable)
			.finish()
	}
}

impl PooledConn {
	pub async fn send_request(
		&mut self,
		req: ::http::Request<crate::http::Body>,
	) -> Result<::http::Response<hyper::body::Incoming>, ProxyError> {
		let conn = self
			.conn
			.as_mut()
			.ok_or_else(|| ProxyError::Processing("connection already taken".to_string()))?;
		conn
			.sender
			.ready()
			.await
			.map_err(map_hyper_err)?;
		conn.sender.send_request(req).await.map_err(map_hyper_err)
	}

	pub fn mark_reusable(&mut self) {
		self.reusable = true;
	}

	pub fn record_error(&mut self) {
		if let Some(conn) = self.conn.as_mut() {
			conn.error_count += 1;
		}
	}

	pub fn key(&self) -> &PoolKey {
		&self.key
	}
}

impl Drop for PooledConn {
	fn drop(&mut self) {
		let Some(conn) = self.conn.take() else {
			return;
		};
		let cfg_max_errors = self.pool.cfg.max_error_count;
		let healthy = self.reusable && conn.is_open() && conn.error_count < cfg_max_errors;
		let mut state = self.pool.state.lock();
		if healthy {
			let idle = state.idle.entry(self.key.clone()).or_default();
			if idle.len() < self.pool.cfg.max_free_sockets {
				idle.push(Idle {
					conn,
					idle_since: Instant::now(),
				});
				drop(state);
				self.pool.released.notify_one();
				return;
			}
		}
		conn.driver.abort();
		if let Some(c) = state.counts.get_mut(&self.key) {
			*c = c.saturating_sub(1);
		}
		let count = state.counts.get(&self.key).copied().unwrap_or(0);
		self
			.pool
			.metrics
			.pool_active
			.get_or_create(&PoolKeyLabels {
				key: self.key.to_string(),
			})
			.set(count as i64);
		drop(state);
		self.pool.metrics.pool_destroys.inc();
		self.pool.released.notify_one();
	}
}

pin_project_lite::pin_project! {
	/// Response-body wrapper that returns the origin connection to the pool
	/// once the stream completes cleanly. A body dropped early (client went
	/// away) drops the un-marked connection, destroying it.
	pub struct PoolReturnBody<B> {
		#[pin]
		inner: B,
		conn: Option<PooledConn>,
	}
}

impl<B> PoolReturnBody<B> {
	pub fn new(inner: B, conn: PooledConn) -> PoolReturnBody<B> {
		PoolReturnBody {
			inner,
			conn: Some(conn),
		}
	}
}

impl<B: http_body::Body> http_body::Body for PoolReturnBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		let res = std::task::ready!(this.inner.as_mut().poll_frame(cx));
		match res {
			None => {
				if let Some(mut conn) = this.conn.take() {
					conn.mark_reusable();
				}
				std::task::Poll::Ready(None)
			},
			Some(Err(e)) => {
				if let Some(mut conn) = this.conn.take() {
					conn.record_error();
				}
				std::task::Poll::Ready(Some(Err(e)))
			},
			Some(Ok(frame)) => {
				// The caller may never poll past the frame that ends the
				// stream; release the connection as soon as the end is known.
				if this.inner.is_end_stream()
					&& let Some(mut conn) = this.conn.take()
				{
					conn.mark_reusable();
				}
				std::task::Poll::Ready(Some(Ok(frame)))
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}

fn map_hyper_err(e: hyper::Error) -> ProxyError {
	if e.is_timeout() {
		ProxyError::UpstreamTimeout
	} else if e.is_incomplete_message() || e.is_canceled() {
		ProxyError::UpstreamReset
	} else {
		ProxyError::UpstreamCall(e.to_string())
	}
}

fn server_name(host: &str) -> Option<rustls_pki_types::ServerName<'static>> {
	match host.parse::<IpAddr>() {
		Ok(ip) => Some(rustls_pki_types::ServerName::IpAddress(ip.into())),
		Err(_) => rustls_pki_types::ServerName::try_from(host.to_string()).ok(),
	}
}
