//! Service catalog and address resolution

use serde::Deserialize;
use tracing::trace;

use super::error::OverlayError;

/// What an identity may do with a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Permission {
    Dial,
    Bind,
}

/// Inclusive port range from an intercept config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.low <= port && port <= self.high
    }
}

/// `intercept.v1` service config
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptConfig {
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub port_ranges: Vec<PortRange>,
}

impl InterceptConfig {
    fn matches(&self, protocol: Option<&str>, host: &str, port: u16) -> bool {
        let protocol_ok = match protocol {
            Some(p) => self.protocols.iter().any(|x| x.eq_ignore_ascii_case(p)),
            None => true,
        };
        protocol_ok
            && self.addresses.iter().any(|a| host_matches(a, host))
            && self.port_ranges.iter().any(|r| r.contains(port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceConfigs {
    #[serde(rename = "intercept.v1", default)]
    pub intercept: Option<InterceptConfig>,
}

/// A service visible to the identity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub config: ServiceConfigs,
}

impl ServiceInfo {
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SupportedProtocols {
    #[serde(default)]
    pub tls: Option<String>,
}

/// An edge router reachable by the identity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRouter {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub supported_protocols: SupportedProtocols,
}

impl EdgeRouter {
    /// `host:port` of the router's TLS listener
    pub fn tls_address(&self) -> Option<String> {
        let url = self.supported_protocols.tls.as_deref()?;
        let address = url.strip_prefix("tls://").unwrap_or(url);
        (!address.is_empty()).then(|| address.to_string())
    }
}

/// Snapshot of services and edge routers available to an identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<ServiceInfo>,
    routers: Vec<EdgeRouter>,
}

impl ServiceCatalog {
    pub fn new(services: Vec<ServiceInfo>, routers: Vec<EdgeRouter>) -> Self {
        Self { services, routers }
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub fn routers(&self) -> &[EdgeRouter] {
        &self.routers
    }

    pub fn service(&self, name: &str) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.name == name)
    }

    /// TLS addresses of all routers, in catalog order
    pub fn router_addresses(&self) -> Vec<String> {
        self.routers.iter().filter_map(EdgeRouter::tls_address).collect()
    }

    /// Find the service addressed by `network`/`address`
    ///
    /// Intercept configs are consulted first; a service named like the host
    /// is the fallback.
    pub fn resolve(
        &self,
        network: &str,
        address: &str,
        permission: Permission,
    ) -> Result<&ServiceInfo, OverlayError> {
        let protocol = protocol_of(network);
        let (host, port) = split_host_port(address);

        let candidates = || self.services.iter().filter(|s| s.allows(permission));

        if let Some(port) = port {
            let intercepted = candidates().find(|s| {
                s.config
                    .intercept
                    .as_ref()
                    .is_some_and(|i| i.matches(protocol, host, port))
            });
            if let Some(service) = intercepted {
                trace!("{} {} intercepted by service {}", network, address, service.name);
                return Ok(service);
            }
        }

        candidates()
            .find(|s| s.name == host || s.name == address)
            .ok_or_else(|| OverlayError::NoService {
                network: network.to_string(),
                address: address.to_string(),
            })
    }
}

/// Transport protocol named by a Go-style network string
fn protocol_of(network: &str) -> Option<&'static str> {
    if network.starts_with("tcp") {
        Some("tcp")
    } else if network.starts_with("udp") {
        Some("udp")
    } else {
        None
    }
}

/// Split `host:port`, `[v6]:port` or a bare host
pub(crate) fn split_host_port(address: &str) -> (&str, Option<u16>) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (address, None),
        },
        _ => (address, None),
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let host = host.to_ascii_lowercase();
            let suffix = suffix.to_ascii_lowercase();
            host.len() > suffix.len() + 1
                && host.ends_with(&suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, perms: &[Permission], intercept: Option<InterceptConfig>) -> ServiceInfo {
        ServiceInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            permissions: perms.to_vec(),
            config: ServiceConfigs { intercept },
        }
    }

    fn intercept(protocols: &[&str], addresses: &[&str], low: u16, high: u16) -> InterceptConfig {
        InterceptConfig {
            protocols: protocols.iter().map(|s| s.to_string()).collect(),
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            port_ranges: vec![PortRange { low, high }],
        }
    }

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::new(
            vec![
                service(
                    "turn",
                    &[Permission::Dial],
                    Some(intercept(&["udp", "tcp"], &["turn.ziti"], 3478, 3479)),
                ),
                service(
                    "rtc",
                    &[Permission::Dial, Permission::Bind],
                    Some(intercept(&["tcp"], &["*.rtc.ziti"], 7880, 7882)),
                ),
                service("api", &[Permission::Dial], None),
                service("hosted", &[Permission::Bind], None),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn test_resolve_intercept() {
        let catalog = catalog();
        let s = catalog.resolve("udp", "turn.ziti:3478", Permission::Dial).unwrap();
        assert_eq!(s.name, "turn");
        let s = catalog.resolve("tcp4", "TURN.ziti:3479", Permission::Dial).unwrap();
        assert_eq!(s.name, "turn");
    }

    #[test]
    fn test_resolve_port_out_of_range() {
        let catalog = catalog();
        assert!(matches!(
            catalog.resolve("udp", "turn.ziti:3480", Permission::Dial),
            Err(OverlayError::NoService { .. })
        ));
    }

    #[test]
    fn test_resolve_wildcard_and_protocol() {
        let catalog = catalog();
        let s = catalog.resolve("tcp", "node1.rtc.ziti:7881", Permission::Dial).unwrap();
        assert_eq!(s.name, "rtc");
        // suffix alone is not covered by the wildcard
        assert!(catalog.resolve("tcp", "rtc.ziti:7881", Permission::Dial).is_err());
        // rtc intercepts tcp only
        assert!(catalog.resolve("udp", "node1.rtc.ziti:7881", Permission::Dial).is_err());
    }

    #[test]
    fn test_resolve_by_service_name() {
        let catalog = catalog();
        assert_eq!(catalog.resolve("tcp", "api:443", Permission::Dial).unwrap().name, "api");
        assert_eq!(catalog.resolve("tcp", "api", Permission::Dial).unwrap().name, "api");
    }

    #[test]
    fn test_resolve_honours_permission() {
        let catalog = catalog();
        assert!(catalog.resolve("tcp", "hosted:80", Permission::Dial).is_err());
        assert_eq!(
            catalog.resolve("tcp", "hosted:80", Permission::Bind).unwrap().name,
            "hosted"
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.b:80"), ("a.b", Some(80)));
        assert_eq!(split_host_port("[::1]:5000"), ("::1", Some(5000)));
        assert_eq!(split_host_port("svc"), ("svc", None));
        assert_eq!(split_host_port("::1"), ("::1", None));
    }

    #[test]
    fn test_decode_services_and_routers() {
        let services: Vec<ServiceInfo> = serde_json::from_str(
            r#"[{"id":"s1","name":"turn","permissions":["Dial"],
                "config":{"intercept.v1":{"protocols":["udp"],"addresses":["turn.ziti"],
                "portRanges":[{"low":3478,"high":3478}]}}}]"#,
        )
        .unwrap();
        assert!(services[0].allows(Permission::Dial));
        assert!(services[0].config.intercept.is_some());

        let routers: Vec<EdgeRouter> = serde_json::from_str(
            r#"[{"name":"er1","supportedProtocols":{"tls":"tls://er1.ziti:3022"}},{"name":"er2"}]"#,
        )
        .unwrap();
        let catalog = ServiceCatalog::new(services, routers);
        assert_eq!(catalog.router_addresses(), vec!["er1.ziti:3022".to_string()]);
    }
}
