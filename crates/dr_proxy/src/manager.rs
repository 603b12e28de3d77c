use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::UploadSection;
use crate::route::Route;
use crate::upstream::{build_upstream, spawn_upstream_tasks, Upstream};

/// Owns the ordered route list and the upstreams by name, and resolves a
/// payload to the upstream that should carry it.
pub struct UpstreamManager {
    routes: Vec<Route>,
    upstreams: HashMap<String, Arc<dyn Upstream>>,
    default_upstream: Option<Arc<dyn Upstream>>,
}

impl UpstreamManager {
    pub fn new(config: &UploadSection) -> Result<Self> {
        if config.upstreams.is_empty() {
            bail!("no upstreams configured");
        }

        let mut upstreams = HashMap::with_capacity(config.upstreams.len());
        for upstream_config in &config.upstreams {
            if upstreams.contains_key(&upstream_config.name) {
                bail!("duplicated upstream name {}", upstream_config.name);
            }
            let upstream = build_upstream(upstream_config)?;
            upstreams.insert(upstream_config.name.clone(), upstream);
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        for (id, route_config) in config.routes.iter().enumerate() {
            let route = Route::new(
                id,
                &route_config.key_bytes,
                route_config.operator,
                &route_config.value,
                &route_config.upstream,
            )?;
            if !upstreams.contains_key(route.upstream()) {
                bail!("route {id} targets unknown upstream {}", route.upstream());
            }
            routes.push(route);
        }

        let default_upstream = config
            .default_upstream
            .as_ref()
            .map(|name| {
                upstreams
                    .get(name)
                    .cloned()
                    .with_context(|| format!("default upstream {name} is not defined"))
            })
            .transpose()?;

        Ok(Self {
            routes,
            upstreams,
            default_upstream,
        })
    }

    /// Start health checking and rebuild listeners for every upstream.
    pub fn spawn_tasks(&self, cancel: &CancellationToken) {
        for upstream in self.upstreams.values() {
            spawn_upstream_tasks(Arc::clone(upstream), cancel);
        }
    }

    /// Routes are evaluated in declaration order, first match wins; an
    /// unmatched payload falls back to the default upstream, which may be
    /// absent (meaning drop).
    pub fn route_upstream(&self, payload: &[u8]) -> Option<Arc<dyn Upstream>> {
        for route in &self.routes {
            if route.matches(payload) {
                return self.upstreams.get(route.upstream()).cloned();
            }
        }
        self.default_upstream.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        HealthCheckSection, PeerSection, RouteSection, UpstreamKind, UpstreamSection,
    };
    use crate::route::RouteOp;

    fn upstream_section(name: &str, port: u16) -> UpstreamSection {
        UpstreamSection {
            name: name.to_string(),
            kind: UpstreamKind::RoundRobin,
            key_bytes: None,
            peers: vec![PeerSection {
                addr: format!("127.0.0.1:{port}").parse().expect("addr"),
                weight: 1,
                backup: false,
            }],
            health_check: HealthCheckSection {
                interval_secs: 60,
                timeout_secs: 1,
                success_times: 2,
                failed_times: 2,
            },
        }
    }

    fn route_section(operator: RouteOp, value: &str, upstream: &str) -> RouteSection {
        RouteSection {
            operator,
            key_bytes: "0:1".to_string(),
            value: value.to_string(),
            upstream: upstream.to_string(),
        }
    }

    fn upload_section() -> UploadSection {
        UploadSection {
            default_upstream: Some("pool_b".to_string()),
            upstreams: vec![
                upstream_section("pool_a", 9201),
                upstream_section("pool_b", 9202),
            ],
            routes: vec![
                route_section(RouteOp::Equal, "0xAA", "pool_a"),
                route_section(RouteOp::Equal, "0xAB", "pool_b"),
                // Shadowed by the first route; order must win.
                route_section(RouteOp::NotEqual, "0xFF", "pool_b"),
            ],
        }
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let manager = UpstreamManager::new(&upload_section()).expect("manager");
        let upstream = manager.route_upstream(&[0xAA, 0x01]).expect("upstream");
        assert_eq!(upstream.name(), "pool_a");
    }

    #[tokio::test]
    async fn unmatched_payload_falls_back_to_default() {
        let manager = UpstreamManager::new(&upload_section()).expect("manager");
        let upstream = manager.route_upstream(&[0xFF, 0x01]).expect("upstream");
        assert_eq!(upstream.name(), "pool_b");
    }

    #[tokio::test]
    async fn no_default_means_drop() {
        let mut section = upload_section();
        section.default_upstream = None;
        section.routes.truncate(2);
        let manager = UpstreamManager::new(&section).expect("manager");
        assert!(manager.route_upstream(&[0xFF, 0x01]).is_none());
    }

    #[tokio::test]
    async fn empty_payload_reaches_default() {
        let manager = UpstreamManager::new(&upload_section()).expect("manager");
        let upstream = manager.route_upstream(&[]).expect("upstream");
        assert_eq!(upstream.name(), "pool_b");
    }

    #[tokio::test]
    async fn unknown_route_target_fails_construction() {
        let mut section = upload_section();
        section.routes.push(route_section(RouteOp::Equal, "0x01", "missing"));
        assert!(UpstreamManager::new(&section).is_err());
    }
}
