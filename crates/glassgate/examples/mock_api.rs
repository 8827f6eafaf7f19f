//! Intercept HTTPS traffic to example.com and answer /api/user with a mock,
//! passing everything else through untouched.
//!
//! Run with `cargo run -p glassgate --example mock_api`, then:
//! `curl -x http://127.0.0.1:8080 --cacert .glassgate/ca.crt https://example.com/api/user`

use std::sync::Arc;

use bytes::Bytes;
use glassgate::config::InterceptConfig;
use glassgate::http::{HeaderValue, StatusCode, header};
use glassgate::intercept::InterceptAction;
use glassgate::{Config, DirectResponse, Interceptor, RequestCtx, Server};

struct MockUserApi;

#[async_trait::async_trait]
impl Interceptor for MockUserApi {
	async fn on_request(&self, ctx: &mut RequestCtx) -> anyhow::Result<InterceptAction> {
		if ctx.uri.path() != "/api/user" {
			return Ok(InterceptAction::Next);
		}
		let mut dr = DirectResponse::new(StatusCode::OK);
		dr.headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		dr.body = Bytes::from_static(br#"{"id":1,"name":"Mock"}"#);
		Ok(InterceptAction::DirectResponse(dr))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().init();

	let mut cfg = Config::default();
	cfg.intercept = InterceptConfig {
		domains: vec!["example.com".into()],
		path_prefixes: vec!["/api/".into()],
		..Default::default()
	};

	let server = Server::builder(cfg)
		.with_interceptor(Arc::new(MockUserApi))
		.bind()
		.await?;
	println!("proxy on {}", server.local_addr());
	server.run().await
}
