use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
	KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::telemetry::metrics::Metrics;
use crate::tls::ca::CertAuthority;
use crate::tls::{TlsError, ca};

/// A minted (or preloaded) leaf: certificate chain, private key, and the set
/// of names it is valid for.
pub struct LeafCert {
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
	pub hostnames: Vec<String>,
	pub created_at: Instant,
}

impl std::fmt::Debug for LeafCert {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LeafCert")
			.field("hostnames", &self.hostnames)
			.finish_non_exhaustive()
	}
}

impl LeafCert {
	/// Whether this leaf is valid for `host`: exact SAN match, or a wildcard
	/// SAN covering exactly one additional label.
	pub fn covers(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		self.hostnames.iter().any(|name| {
			if name.eq_ignore_ascii_case(&host) {
				return true;
			}
			if let Some(suffix) = name.strip_prefix("*.") {
				return host
					.split_once('.')
					.map(|(_, rest)| rest.eq_ignore_ascii_case(suffix))
					.unwrap_or(false);
			}
			false
		})
	}

	/// Preloaded leaf for fixed-certificate mode. The hostname set is read
	/// from the certificate's SANs.
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<LeafCert>, TlsError> {
		let der = ca::parse_single_cert(cert_pem.as_bytes())?;
		let key = ca::parse_private_key(key_pem.as_bytes())?;
		let (_, parsed) = x509_parser::parse_x509_certificate(&der)
			.map_err(|e| TlsError::CertificateParse(e.to_string()))?;
		let (mut hostnames, ips) = san_names(&parsed);
		hostnames.extend(ips.iter().map(|ip| ip.to_string()));
		Ok(Arc::new(LeafCert {
			chain: vec![der],
			key,
			hostnames,
			created_at: Instant::now(),
		}))
	}
}

/// Derives or mints leaf certificates for intercepted hosts, signed by the
/// local CA. Results are kept in an LRU keyed by every name the leaf covers;
/// concurrent misses for one host coalesce onto a single mint.
pub struct CertFactory {
	ca: Arc<CertAuthority>,
	probe_timeout: Duration,
	probe_connector: tokio_rustls::TlsConnector,
	cache: Mutex<LruCache<String, Arc<LeafCert>>>,
	pending: Mutex<HashMap<String, Arc<OnceCell<Arc<LeafCert>>>>>,
	fixed: RwLock<Option<Arc<LeafCert>>>,
	metrics: Arc<Metrics>,
}

impl CertFactory {
	pub fn new(
		ca: Arc<CertAuthority>,
		probe_timeout: Duration,
		cache_capacity: usize,
		metrics: Arc<Metrics>,
	) -> Result<CertFactory, TlsError> {
		let probe_config = Arc::new(super::probe_client_config()?);
		Ok(CertFactory {
			ca,
			probe_timeout,
			probe_connector: tokio_rustls::TlsConnector::from(probe_config),
			cache: Mutex::new(LruCache::new(
				NonZeroUsize::new(cache_capacity.max(1)).expect("capacity is nonzero"),
			)),
			pending: Mutex::new(HashMap::new()),
			fixed: RwLock::new(None),
			metrics,
		})
	}

	pub fn ca(&self) -> &Arc<CertAuthority> {
		&self.ca
	}

	/// Enable or disable fixed-certificate mode at runtime. While enabled,
	/// every host is answered with the preloaded leaf; disabling reverts to
	/// dynamic minting.
	pub fn set_fixed(&self, leaf: Option<Arc<LeafCert>>) {
		*self.fixed.write() = leaf;
	}

	pub async fn get_certificate(
		&self,
		host: &str,
		port: u16,
	) -> Result<Arc<LeafCert>, TlsError> {
		if let Some(fixed) = self.fixed.read().clone() {
			return Ok(fixed);
		}
		let host = host.to_ascii_lowercase();
		if let Some(leaf) = self.cache.lock().get(&host) {
			return Ok(leaf.clone());
		}

		let cell = {
			let mut pending = self.pending.lock();
			pending
				.entry(host.clone())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};
		let result = cell
			.get_or_try_init(|| self.mint_for(&host, port))
			.await
			.cloned();
		self.pending.lock().remove(&host);

		let leaf = result?;
		let mut cache = self.cache.lock();
		for name in &leaf.hostnames {
			cache.put(name.clone(), leaf.clone());
		}
		// Wildcard SANs will not be looked up verbatim; key the requested host too.
		cache.put(host, leaf.clone());
		Ok(leaf)
	}

	async fn mint_for(&self, host: &str, port: u16) -> Result<Arc<LeafCert>, TlsError> {
		match self.probe_origin(host, port).await {
			Some(origin_der) => match self.clone_origin(host, &origin_der) {
				Ok(leaf) => return Ok(leaf),
				Err(e) => {
					debug!(%host, "failed to clone origin certificate: {e}");
				},
			},
			None => {
				self.metrics.cert_probe_failures.inc();
			},
		}
		self.synthesize(host)
	}

	/// Best-effort handshake with the real origin to observe its leaf. Any
	/// failure (dial, timeout, handshake) falls back to synthesis.
	async fn probe_origin(&self, host: &str, port: u16) -> Option<CertificateDer<'static>> {
		let attempt = async {
			let stream = tokio::net::TcpStream::connect((host, port)).await.ok()?;
			let name = rustls_pki_types::ServerName::try_from(host.to_string()).ok()?;
			let tls = self.probe_connector.connect(name, stream).await.ok()?;
			let (_, conn) = tls.get_ref();
			conn.peer_certificates().and_then(|certs| certs.first().cloned())
		};
		match tokio::time::timeout(self.probe_timeout, attempt).await {
			Ok(Some(der)) => Some(der),
			Ok(None) => None,
			Err(_) => {
				debug!(%host, %port, "certificate probe timed out");
				None
			},
		}
	}

	/// Mint a leaf whose Subject, SAN set, and validity window mirror the real
	/// origin's, signed by the local CA.
	fn clone_origin(
		&self,
		host: &str,
		origin_der: &CertificateDer<'static>,
	) -> Result<Arc<LeafCert>, TlsError> {
		let (_, origin) = x509_parser::parse_x509_certificate(origin_der)
			.map_err(|e| TlsError::CertificateParse(e.to_string()))?;
		let (mut names, ips) = san_names(&origin);
		if names.is_empty() && ips.is_empty() {
			names.push(host.to_string());
		}
		let cn = origin
			.subject()
			.iter_common_name()
			.next()
			.and_then(|cn| cn.as_str().ok())
			.map(str::to_string);
		let not_before = OffsetDateTime::from_unix_timestamp(origin.validity.not_before.timestamp())
			.unwrap_or_else(|_| OffsetDateTime::now_utc() - time::Duration::hours(1));
		let not_after = OffsetDateTime::from_unix_timestamp(origin.validity.not_after.timestamp())
			.unwrap_or_else(|_| self.ca.not_after())
			.min(self.ca.not_after());
		self.mint(names, ips, cn, not_before, not_after)
	}

	/// Single-SAN leaf for a host the probe could not reach.
	fn synthesize(&self, host: &str) -> Result<Arc<LeafCert>, TlsError> {
		let (names, ips) = match host.parse::<IpAddr>() {
			Ok(ip) => (Vec::new(), vec![ip]),
			Err(_) => (vec![host.to_string()], Vec::new()),
		};
		let not_before = OffsetDateTime::now_utc() - time::Duration::hours(1);
		let not_after = (OffsetDateTime::now_utc() + time::Duration::days(825))
			.min(self.ca.not_after());
		self.mint(names, ips, Some(host.to_string()), not_before, not_after)
	}

	fn mint(
		&self,
		names: Vec<String>,
		ips: Vec<IpAddr>,
		cn: Option<String>,
		not_before: OffsetDateTime,
		not_after: OffsetDateTime,
	) -> Result<Arc<LeafCert>, TlsError> {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let mut params = CertificateParams::new(names.clone())?;
		for ip in &ips {
			params.subject_alt_names.push(SanType::IpAddress(*ip));
		}
		let mut dn = DistinguishedName::new();
		if let Some(cn) = cn.or_else(|| names.first().cloned()) {
			dn.push(DnType::CommonName, cn);
		}
		params.distinguished_name = dn;
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.not_before = not_before;
		params.not_after = not_after;
		let cert = params.signed_by(&key, self.ca.issuer())?;
		self.metrics.certs_minted.inc();

		let mut hostnames = names;
		hostnames.extend(ips.iter().map(|ip| ip.to_string()));
		Ok(Arc::new(LeafCert {
			chain: vec![cert.der().clone(), self.ca.cert_der().clone()],
			key: PrivateKeyDer::Pkcs8(key.serialize_der().into()),
			hostnames,
			created_at: Instant::now(),
		}))
	}
}

fn san_names(cert: &X509Certificate) -> (Vec<String>, Vec<IpAddr>) {
	let mut names = Vec::new();
	let mut ips = Vec::new();
	if let Ok(Some(san)) = cert.subject_alternative_name() {
		for gn in &san.value.general_names {
			match gn {
				GeneralName::DNSName(name) => names.push(name.to_string()),
				GeneralName::IPAddress(raw) => match raw.len() {
					4 => {
						let octets: [u8; 4] = (*raw).try_into().expect("length checked");
						ips.push(IpAddr::from(octets));
					},
					16 => {
						let octets: [u8; 16] = (*raw).try_into().expect("length checked");
						ips.push(IpAddr::from(octets));
					},
					_ => {},
				},
				_ => {},
			}
		}
	}
	(names, ips)
}
