//! Name resolution for the external addresses of edge clusters

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

const DNS_PORT: u16 = 53;

/// Resolves domain names to addresses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// First address of `domain` using the default name servers
    async fn resolve(&self, domain: &str) -> Result<IpAddr>;

    /// First address of `domain` asking only the name server at `server`
    async fn resolve_with(&self, server: IpAddr, domain: &str) -> Result<IpAddr>;
}

/// Resolver backed by hickory
///
/// The default name servers are the system ones unless a fixed server was
/// given, e.g. the hub's own DNS forwarded to a local port.
#[derive(Clone, Debug, Default)]
pub struct HickoryResolver {
    server: Option<SocketAddr>,
}

impl HickoryResolver {
    /// Use `server` instead of the system name servers
    pub fn with_server(server: SocketAddr) -> Self {
        Self { server: Some(server) }
    }

    fn default_resolver(&self) -> Result<TokioAsyncResolver> {
        match self.server {
            Some(server) => Ok(fixed(server.ip(), server.port())),
            None => TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| Error::internal_with_context("resolver", e.to_string())),
        }
    }
}

fn fixed(ip: IpAddr, port: u16) -> TokioAsyncResolver {
    let servers = NameServerConfigGroup::from_ips_clear(&[ip], port, true);
    TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], servers), ResolverOpts::default())
}

async fn first_address(resolver: &TokioAsyncResolver, domain: &str) -> Result<IpAddr> {
    let lookup = resolver
        .lookup_ip(domain)
        .await
        .map_err(|e| Error::transport(format!("failed to resolve domain '{}': {}", domain, e)))?;
    lookup
        .iter()
        .next()
        .ok_or_else(|| Error::transport(format!("domain '{}' has no addresses", domain)))
}

#[async_trait]
impl DomainResolver for HickoryResolver {
    async fn resolve(&self, domain: &str) -> Result<IpAddr> {
        first_address(&self.default_resolver()?, domain).await
    }

    async fn resolve_with(&self, server: IpAddr, domain: &str) -> Result<IpAddr> {
        first_address(&fixed(server, DNS_PORT), domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_server_resolves_literal_addresses() {
        let resolver = HickoryResolver::with_server("127.0.0.1:1".parse().unwrap());
        let address = resolver.resolve("10.0.0.5").await.unwrap();
        assert_eq!(address, "10.0.0.5".parse::<IpAddr>().unwrap());
    }
}
