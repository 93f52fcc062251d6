//! Local interface enumeration

use std::net::IpAddr;

use tracing::debug;

use super::error::NetworkError;

/// One local network interface and its addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// 1-based position in the snapshot
    pub index: u32,
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

impl Interface {
    pub fn is_loopback(&self) -> bool {
        !self.addrs.is_empty() && self.addrs.iter().all(IpAddr::is_loopback)
    }
}

/// Current interfaces as reported by the OS
pub fn list_interfaces() -> Result<Vec<Interface>, NetworkError> {
    let pairs = local_ip_address::list_afinet_netifas()
        .map_err(|e| NetworkError::Io(std::io::Error::other(e.to_string())))?;
    let interfaces = group(pairs);
    debug!("Found {} local interface(s)", interfaces.len());
    Ok(interfaces)
}

/// Group `(name, address)` pairs by interface, keeping first-seen order
fn group(pairs: Vec<(String, IpAddr)>) -> Vec<Interface> {
    let mut interfaces: Vec<Interface> = Vec::new();
    for (name, addr) in pairs {
        match interfaces.iter_mut().find(|i| i.name == name) {
            Some(iface) => iface.addrs.push(addr),
            None => interfaces.push(Interface {
                index: interfaces.len() as u32 + 1,
                name,
                addrs: vec![addr],
            }),
        }
    }
    interfaces
}

pub(crate) fn by_index(interfaces: &[Interface], index: u32) -> Result<Interface, NetworkError> {
    interfaces
        .iter()
        .find(|i| i.index == index)
        .cloned()
        .ok_or_else(|| NetworkError::InterfaceNotFound(format!("index {}", index)))
}

pub(crate) fn by_name(interfaces: &[Interface], name: &str) -> Result<Interface, NetworkError> {
    interfaces
        .iter()
        .find(|i| i.name == name)
        .cloned()
        .ok_or_else(|| NetworkError::InterfaceNotFound(name.to_string()))
}
