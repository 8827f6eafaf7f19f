use std::io::Cursor;
use std::path::Path;

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
	KeyUsagePurpose,
};
use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;
use tracing::info;

use crate::tls::TlsError;

const CA_COMMON_NAME: &str = "glassgate CA";
const CA_VALIDITY_DAYS: i64 = 3650;

/// Root CA used to sign every minted leaf. Loaded once at startup and shared
/// read-only.
pub struct CertAuthority {
	issuer: Issuer<'static, KeyPair>,
	cert_der: CertificateDer<'static>,
	cert_pem: String,
	not_after: OffsetDateTime,
}

impl std::fmt::Debug for CertAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Never dump key material.
		f.debug_struct("CertAuthority")
			.field("not_after", &self.not_after)
			.finish_non_exhaustive()
	}
}

impl CertAuthority {
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<CertAuthority, TlsError> {
		let key = KeyPair::from_pem(key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(cert_pem, key)?;
		let cert_der = parse_single_cert(cert_pem.as_bytes())?;
		let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
			.map_err(|e| TlsError::CertificateParse(e.to_string()))?;
		let not_after = OffsetDateTime::from_unix_timestamp(parsed.validity.not_after.timestamp())
			.map_err(|e| TlsError::CertificateParse(e.to_string()))?;
		Ok(CertAuthority {
			issuer,
			cert_der,
			cert_pem: cert_pem.to_string(),
			not_after,
		})
	}

	/// Self-signed root, ECDSA P-256.
	pub fn generate() -> Result<(String, String), TlsError> {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let mut params = CertificateParams::default();
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, CA_COMMON_NAME);
		params.distinguished_name = dn;
		params.not_before = OffsetDateTime::now_utc() - time::Duration::hours(1);
		params.not_after = OffsetDateTime::now_utc() + time::Duration::days(CA_VALIDITY_DAYS);
		let cert = params.self_signed(&key)?;
		Ok((cert.pem(), key.serialize_pem()))
	}

	/// Load the CA from disk, generating and persisting a fresh one when both
	/// files are absent. A half-present pair is refused rather than silently
	/// regenerated, since that would invalidate previously-trusted chains.
	pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertAuthority> {
		if cert_path.exists() || key_path.exists() {
			if !cert_path.exists() || !key_path.exists() {
				anyhow::bail!(
					"both {} and {} must exist",
					cert_path.display(),
					key_path.display()
				);
			}
			let cert_pem = std::fs::read_to_string(cert_path)?;
			let key_pem = std::fs::read_to_string(key_path)?;
			return Ok(CertAuthority::from_pem(&cert_pem, &key_pem)?);
		}

		let (cert_pem, key_pem) = CertAuthority::generate()?;
		if let Some(parent) = cert_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		if let Some(parent) = key_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		write_private(key_path, key_pem.as_bytes())?;
		std::fs::write(cert_path, cert_pem.as_bytes())?;
		info!(
			cert = %cert_path.display(),
			key = %key_path.display(),
			"generated root CA; trust the certificate to intercept TLS",
		);
		Ok(CertAuthority::from_pem(&cert_pem, &key_pem)?)
	}

	pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
		&self.issuer
	}

	pub fn cert_der(&self) -> &CertificateDer<'static> {
		&self.cert_der
	}

	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	/// Minted leaves must not outlive the root.
	pub fn not_after(&self) -> OffsetDateTime {
		self.not_after
	}
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	use std::io::Write;
	use std::os::unix::fs::OpenOptionsExt;
	let mut f = std::fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(0o600)
		.open(path)?;
	f.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	std::fs::write(path, contents)
}

pub(crate) fn parse_single_cert(pem: &[u8]) -> Result<CertificateDer<'static>, TlsError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let parsed = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| TlsError::CertificateParse(e.to_string()))?
		.ok_or_else(|| TlsError::CertificateParse("no certificate".to_string()))?;
	let Item::X509Certificate(der) = parsed else {
		return Err(TlsError::CertificateParse("no certificate".to_string()));
	};
	Ok(der)
}

pub(crate) fn parse_private_key(
	pem: &[u8],
) -> Result<rustls_pki_types::PrivateKeyDer<'static>, TlsError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let parsed = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| TlsError::CertificateParse(e.to_string()))?
		.ok_or_else(|| TlsError::CertificateParse("no key".to_string()))?;
	match parsed {
		Item::Pkcs8Key(k) => Ok(rustls_pki_types::PrivateKeyDer::Pkcs8(k)),
		Item::Sec1Key(k) => Ok(rustls_pki_types::PrivateKeyDer::Sec1(k)),
		Item::Pkcs1Key(k) => Ok(rustls_pki_types::PrivateKeyDer::Pkcs1(k)),
		_ => Err(TlsError::CertificateParse("no key".to_string())),
	}
}
