use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tracing::info;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum FlowKind {
	request,
	connect,
	upgrade,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabels {
	pub kind: FlowKind,
	pub intercepted: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolKeyLabels {
	pub key: String,
}

#[derive(Debug)]
pub struct Metrics {
	pub downstream_connections: Counter,
	pub flows: Family<FlowLabels, Counter>,
	pub direct_responses: Counter,

	pub pool_hits: Counter,
	pub pool_misses: Counter,
	pub pool_creates: Counter,
	pub pool_destroys: Counter,
	pub pool_connect_errors: Counter,
	pub pool_active: Family<PoolKeyLabels, Gauge>,

	pub certs_minted: Counter,
	pub cert_probe_failures: Counter,
	pub fake_servers: Gauge,

	pub request_duration: Histogram,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let m = Metrics {
			downstream_connections: Counter::default(),
			flows: Family::default(),
			direct_responses: Counter::default(),
			pool_hits: Counter::default(),
			pool_misses: Counter::default(),
			pool_creates: Counter::default(),
			pool_destroys: Counter::default(),
			pool_connect_errors: Counter::default(),
			pool_active: Family::default(),
			certs_minted: Counter::default(),
			cert_probe_failures: Counter::default(),
			fake_servers: Gauge::default(),
			request_duration: Histogram::new(exponential_buckets(0.001, 2.0, 16)),
		};
		registry.register(
			"downstream_connections",
			"Accepted client connections",
			m.downstream_connections.clone(),
		);
		registry.register("flows", "Dispatched flows by kind", m.flows.clone());
		registry.register(
			"direct_responses",
			"Responses short-circuited by an interceptor",
			m.direct_responses.clone(),
		);
		registry.register("pool_hits", "Pool checkouts served from idle", m.pool_hits.clone());
		registry.register("pool_misses", "Pool checkouts requiring a dial", m.pool_misses.clone());
		registry.register("pool_creates", "Origin connections dialed", m.pool_creates.clone());
		registry.register("pool_destroys", "Origin connections destroyed", m.pool_destroys.clone());
		registry.register(
			"pool_connect_errors",
			"Failed origin dial attempts",
			m.pool_connect_errors.clone(),
		);
		registry.register(
			"pool_active",
			"Live sockets per pool key",
			m.pool_active.clone(),
		);
		registry.register(
			"certs_minted",
			"Leaf certificates minted",
			m.certs_minted.clone(),
		);
		registry.register(
			"cert_probe_failures",
			"Origin certificate probes that fell back to synthesis",
			m.cert_probe_failures.clone(),
		);
		registry.register(
			"fake_servers",
			"Entries in the fake-server registry",
			m.fake_servers.clone(),
		);
		registry.register(
			"request_duration_seconds",
			"Request handling duration",
			m.request_duration.clone(),
		);
		m
	}

	/// For contexts that do not care about export (tests, embedded use).
	pub fn unregistered() -> Arc<Metrics> {
		Arc::new(Metrics::new(&mut Registry::default()))
	}
}

/// Periodic one-line summary, enabled by `enable_performance_metrics`.
pub fn spawn_reporter(metrics: Arc<Metrics>, interval: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tick.tick().await;
			info!(
				target: "performance",
				connections = metrics.downstream_connections.get(),
				pool_hits = metrics.pool_hits.get(),
				pool_misses = metrics.pool_misses.get(),
				pool_creates = metrics.pool_creates.get(),
				pool_destroys = metrics.pool_destroys.get(),
				connect_errors = metrics.pool_connect_errors.get(),
				certs_minted = metrics.certs_minted.get(),
				fake_servers = metrics.fake_servers.get(),
				"proxy metrics",
			);
		}
	})
}
