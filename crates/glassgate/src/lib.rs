pub mod config;
pub mod errorcache;
pub mod http;
pub mod intercept;
pub mod pool;
pub mod proxy;
pub mod telemetry;
pub mod tls;

pub use config::Config;
pub use intercept::{
	DirectResponse, InterceptAction, Interceptor, Middleware, Overlay, RequestCtx,
};
pub use proxy::server::{Server, ServerBuilder};

/// Name reported in `Proxy-agent` and `x-forwarded-by`.
pub const PROXY_NAME: &str = concat!("glassgate/", env!("CARGO_PKG_VERSION"));

pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		format!("{}ms", d.as_millis()).serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		parse(&raw).map_err(serde::de::Error::custom)
	}

	pub fn parse(raw: &str) -> Result<Duration, String> {
		let raw = raw.trim();
		let (num, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
			Some(idx) => raw.split_at(idx),
			None => (raw, "s"),
		};
		let num: u64 = num
			.trim()
			.parse()
			.map_err(|_| format!("invalid duration: {raw}"))?;
		match unit {
			"ms" => Ok(Duration::from_millis(num)),
			"s" => Ok(Duration::from_secs(num)),
			"m" => Ok(Duration::from_secs(num * 60)),
			"h" => Ok(Duration::from_secs(num * 3600)),
			_ => Err(format!("invalid duration unit: {unit}")),
		}
	}

}
