//! Blocking, address-family-agnostic name resolution.
//!
//! The original engine calls `gethostbyname` and only ever looks at the
//! first A record (IPv4), commented in the source as a `TODO` to migrate to
//! `getaddrinfo`. Per REDESIGN FLAGS this port resolves both families and
//! prefers an IPv4 address when both are present, for behavioral
//! continuity with callers that relied on the old A-record-only lookup.
//!
//! Builds the resolver from the system configuration, falling back to
//! `ResolverConfig::default()` if that fails, then resolves.

use std::net::IpAddr;

use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no address records for {0}")]
    NoRecords(String),
    #[error("resolver error: {0}")]
    Resolver(#[from] trust_dns_resolver::error::ResolveError),
    #[error("failed to build resolver: {0}")]
    Build(#[source] trust_dns_resolver::error::ResolveError),
}

fn build_resolver() -> Result<Resolver, ResolveError> {
    match Resolver::from_system_conf() {
        Ok(r) => Ok(r),
        Err(_) => Resolver::new(ResolverConfig::default(), ResolverOpts::default())
            .map_err(ResolveError::Build),
    }
}

/// Resolves `host` to a single address, preferring IPv4 when both families
/// are returned.
pub fn resolve(host: &str) -> Result<IpAddr, ResolveError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }

    let resolver = build_resolver()?;
    let response = resolver.lookup_ip(host)?;
    let mut addrs = response.iter();

    let mut first_v6 = None;
    for addr in addrs.by_ref() {
        if addr.is_ipv4() {
            return Ok(addr);
        }
        if first_v6.is_none() {
            first_v6 = Some(addr);
        }
    }
    first_v6.ok_or_else(|| ResolveError::NoRecords(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ipv4_address_short_circuits_the_resolver() {
        let addr = resolve("127.0.0.1").unwrap();
        assert_eq!(addr, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn literal_ipv6_address_short_circuits_the_resolver() {
        let addr = resolve("::1").unwrap();
        assert!(addr.is_ipv6());
    }
}
