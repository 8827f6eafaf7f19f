use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::telemetry::metrics::Metrics;
use crate::tls::TlsError;
use crate::tls::factory::{CertFactory, LeafCert};

/// A TLS-terminating endpoint impersonating every origin covered by one leaf
/// certificate. Entries are created on first CONNECT to a matching hostname
/// and dropped on LRU eviction; connections already established keep running
/// until they terminate on their own (they hold their own `Arc<ServerConfig>`).
pub struct FakeServer {
	pub leaf: Arc<LeafCert>,
	pub config: Arc<ServerConfig>,
	pub created_at: Instant,
}

/// Bounded LRU of fake servers keyed by the hostname set their leaf covers.
///
/// The registry never references the engines: `terminate` hands the decrypted
/// stream back to the caller, which re-enters the request pipeline with
/// `ssl=true`.
pub struct FakeServerRegistry {
	factory: Arc<CertFactory>,
	entries: Mutex<LruCache<String, Arc<FakeServer>>>,
	pending: Mutex<HashMap<String, Arc<OnceCell<Arc<FakeServer>>>>>,
	metrics: Arc<Metrics>,
}

impl FakeServerRegistry {
	pub fn new(
		factory: Arc<CertFactory>,
		capacity: usize,
		metrics: Arc<Metrics>,
	) -> FakeServerRegistry {
		FakeServerRegistry {
			factory,
			entries: Mutex::new(LruCache::new(
				NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero"),
			)),
			pending: Mutex::new(HashMap::new()),
			metrics,
		}
	}

	/// Find or create the fake server for `host`. A hit on any entry whose
	/// SAN set covers the host (exact or wildcard) promotes it to MRU.
	/// Concurrent misses for the same host share one creation.
	pub async fn get_server(&self, host: &str, port: u16) -> Result<Arc<FakeServer>, TlsError> {
		let host = host.to_ascii_lowercase();
		{
			let mut entries = self.entries.lock();
			let matched = entries
				.iter()
				.find(|(_, server)| server.leaf.covers(&host))
				.map(|(key, server)| (key.clone(), server.clone()));
			if let Some((key, server)) = matched {
				entries.promote(&key);
				return Ok(server);
			}
		}

		let cell = {
			let mut pending = self.pending.lock();
			pending
				.entry(host.clone())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};
		let result = cell
			.get_or_try_init(|| self.create(&host, port))
			.await
			.cloned();
		self.pending.lock().remove(&host);
		result
	}

	async fn create(&self, host: &str, port: u16) -> Result<Arc<FakeServer>, TlsError> {
		let leaf = self.factory.get_certificate(host, port).await?;
		let mut config = ServerConfig::builder_with_provider(super::provider())
			.with_protocol_versions(rustls::ALL_VERSIONS)?
			.with_no_client_auth()
			.with_single_cert(leaf.chain.clone(), leaf.key.clone_key())?;
		config.alpn_protocols = vec![b"http/1.1".to_vec()];

		let server = Arc::new(FakeServer {
			leaf,
			config: Arc::new(config),
			created_at: Instant::now(),
		});
		let key = server.leaf.hostnames.join(",");
		let mut entries = self.entries.lock();
		if let Some((evicted_key, _)) = entries.push(key, server.clone()) {
			debug!(evicted = %evicted_key, "evicted fake server");
		}
		self.metrics.fake_servers.set(entries.len() as i64);
		Ok(server)
	}

	/// Terminate TLS on a raw client socket handed over after
	/// `200 Connection Established`. The ClientHello SNI picks the leaf; absent
	/// SNI falls back to the CONNECT target host.
	pub async fn terminate<IO>(
		&self,
		io: IO,
		default_host: &str,
		port: u16,
	) -> Result<(tokio_rustls::server::TlsStream<IO>, Arc<FakeServer>), TlsError>
	where
		IO: AsyncRead + AsyncWrite + Unpin,
	{
		let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io);
		let start = acceptor.await.map_err(TlsError::Handshake)?;
		let sni = start.client_hello().server_name().map(str::to_string);
		let host = sni.as_deref().unwrap_or(default_host);
		let server = self.get_server(host, port).await?;
		let stream = start
			.into_stream(server.config.clone())
			.await
			.map_err(TlsError::Handshake)?;
		Ok((stream, server))
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}
