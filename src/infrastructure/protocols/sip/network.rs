//! Local address discovery

use std::net::IpAddr;
use tracing::{debug, warn};

/// First non-loopback IPv4 address, in enumeration order.
///
/// Returns an empty string when nothing qualifies; callers treat that as
/// "no usable interface", not as an error.
pub fn first_ipv4_address<I>(interfaces: I) -> String
where
    I: IntoIterator<Item = (String, IpAddr)>,
{
    interfaces
        .into_iter()
        .find_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => {
                debug!("Using {} on interface {}", v4, name);
                Some(v4.to_string())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Address the agent should advertise, discovered from the host's interfaces
pub fn discover_local_ip() -> String {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => first_ipv4_address(interfaces),
        Err(e) => {
            warn!("Cannot enumerate network interfaces: {}", e);
            String::new()
        }
    }
}
