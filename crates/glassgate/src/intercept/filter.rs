use crate::config::InterceptConfig;

/// Decides whether a flow goes through the interception pipeline or may be
/// fast-pathed. Rules short-circuit in order; see [`InterceptFilter::should_intercept`].
#[derive(Debug, Default)]
pub struct InterceptFilter {
	cfg: InterceptConfig,
}

impl InterceptFilter {
	pub fn new(mut cfg: InterceptConfig) -> InterceptFilter {
		cfg.normalize();
		InterceptFilter { cfg }
	}

	/// Domain-level decision, used at CONNECT time when only host:port is
	/// known: does any rule make this host's traffic interceptable at all?
	pub fn domain_matches(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		if self.cfg.domains.is_empty() {
			return false;
		}
		if matches_domain(&self.cfg.fast_domains, &host) {
			return false;
		}
		matches_domain(&self.cfg.domains, &host)
	}

	/// Full per-request decision. `url` is the absolute URL, `path` its path
	/// component (query excluded for extension matching).
	pub fn should_intercept(&self, host: &str, url: &str, path: &str) -> bool {
		// 1. No domains configured: everything fast-paths.
		if !self.domain_matches(host) {
			return false;
		}
		// 2. Static extensions never intercept.
		let path_lower = path.to_ascii_lowercase();
		if self
			.cfg
			.static_extensions
			.iter()
			.any(|ext| path_lower.ends_with(ext.as_str()))
		{
			return false;
		}
		// 3. Domain match alone is not enough; a URL/path rule must exist.
		if self.cfg.urls.is_empty()
			&& self.cfg.url_prefixes.is_empty()
			&& self.cfg.path_prefixes.is_empty()
		{
			return false;
		}
		// 4. Exact URL, URL prefix, or path prefix.
		if self.cfg.urls.iter().any(|u| u == url) {
			return true;
		}
		if self.cfg.url_prefixes.iter().any(|p| url.starts_with(p.as_str())) {
			return true;
		}
		if self
			.cfg
			.path_prefixes
			.iter()
			.any(|p| path.starts_with(p.as_str()))
		{
			return true;
		}
		false
	}
}

fn matches_domain(domains: &[String], host: &str) -> bool {
	domains.iter().any(|d| {
		host == d.as_str()
			|| (host.len() > d.len() && host.ends_with(d.as_str())
				&& host.as_bytes()[host.len() - d.len() - 1] == b'.')
	})
}
