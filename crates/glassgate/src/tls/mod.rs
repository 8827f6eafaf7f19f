pub mod ca;
pub mod factory;
pub mod registry;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("certificate generation failed: {0}")]
	Generation(#[from] rcgen::Error),
	#[error("certificate parse failed: {0}")]
	CertificateParse(String),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("TLS handshake failed: {0}")]
	Handshake(#[source] std::io::Error),
}

/// Client config for origin connections, trusting the platform store.
pub fn origin_client_config() -> Result<ClientConfig, TlsError> {
	let mut roots = RootCertStore::empty();
	let native = rustls_native_certs::load_native_certs();
	let (_valid, invalid) = roots.add_parsable_certificates(native.certs);
	if invalid > 0 {
		tracing::warn!("found {invalid} invalid platform root certs");
	}
	let mut config = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)?
		.with_root_certificates(roots)
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(config)
}

/// Client config for the certificate probe: the goal is to observe the
/// origin's leaf, not to authenticate it, so verification is disabled.
pub fn probe_client_config() -> Result<ClientConfig, TlsError> {
	let provider = provider();
	let verifier = Arc::new(insecure::NoVerification(provider.clone()));
	let config = ClientConfig::builder_with_provider(provider)
		.with_protocol_versions(rustls::ALL_VERSIONS)?
		.dangerous()
		.with_custom_certificate_verifier(verifier)
		.with_no_client_auth();
	Ok(config)
}

mod insecure {
	use std::sync::Arc;

	use rustls::client::danger::{
		HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
	};
	use rustls::crypto::CryptoProvider;
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	#[derive(Debug)]
	pub(super) struct NoVerification(pub Arc<CryptoProvider>);

	impl ServerCertVerifier for NoVerification {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			self
				.0
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}
