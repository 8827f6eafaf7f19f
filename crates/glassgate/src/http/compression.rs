//! Decoding of compressed response bodies for interceptor inspection.
//!
//! Bodies are only decoded after the engine has buffered them (interceptor
//! interest), so decoding operates on the buffered bytes rather than the
//! stream. Unmodified flows pass compressed bytes through untouched.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Gzip,
	Deflate,
	Brotli,
}

impl Encoding {
	/// Parse a `content-encoding` header value. Multi-codings and unknown
	/// codings return `None` and the body is treated as opaque.
	pub fn from_header(value: &str) -> Option<Encoding> {
		match value.trim().to_ascii_lowercase().as_str() {
			"gzip" | "x-gzip" => Some(Encoding::Gzip),
			"deflate" => Some(Encoding::Deflate),
			"br" => Some(Encoding::Brotli),
			_ => None,
		}
	}
}

pub async fn decode(encoding: Encoding, data: &[u8]) -> std::io::Result<Bytes> {
	let mut out = Vec::with_capacity(data.len() * 2);
	match encoding {
		Encoding::Gzip => {
			GzipDecoder::new(data).read_to_end(&mut out).await?;
		},
		Encoding::Deflate => {
			ZlibDecoder::new(data).read_to_end(&mut out).await?;
		},
		Encoding::Brotli => {
			BrotliDecoder::new(data).read_to_end(&mut out).await?;
		},
	}
	Ok(Bytes::from(out))
}
