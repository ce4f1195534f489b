use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use url::{Host, Url};

use crate::util::{is_blocked_hostname, is_blocked_ip, normalize_host, validate_parsed_url};

use super::fetcher::FetchError;

/// Resolves a hostname to every address it currently maps to.
///
/// Implementations must return all A and AAAA records rather than the first
/// one, so that a response mixing public and private addresses is caught.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// A resolved address that falls inside the deny-list.
#[derive(Debug, Error)]
#[error("{host} resolves to blocked address {ip}")]
pub struct BlockedAddress {
    pub host: String,
    pub ip: IpAddr,
}

/// Applies the SSRF policy to fetch targets.
///
/// Every URL is checked twice: once before the request is issued (static
/// rules plus a full DNS lookup), and again at connect time through
/// [`GuardedResolver`], so a DNS answer that changes between the two lookups
/// still cannot reach a private address.
#[derive(Clone)]
pub struct TargetGuard {
    resolver: Arc<dyn HostResolver>,
    allow_loopback: bool,
}

impl TargetGuard {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            allow_loopback: false,
        }
    }

    /// Lets loopback targets through so tests can talk to a local mock server.
    /// Every other blocked range stays blocked.
    #[cfg(test)]
    pub(crate) fn allowing_loopback(mut self) -> Self {
        self.allow_loopback = true;
        self
    }

    fn ip_blocked(&self, ip: IpAddr) -> bool {
        if self.allow_loopback && ip.is_loopback() {
            return false;
        }
        is_blocked_ip(ip)
    }

    /// Validates a URL and every address its host resolves to.
    ///
    /// Performs no network I/O other than the DNS lookup, and none at all for
    /// literal IP hosts.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] for unparseable or non-HTTP(S) URLs
    /// - [`FetchError::Blocked`] for credentials, blocked names or addresses
    /// - [`FetchError::Unresolvable`] when DNS fails or returns nothing
    pub async fn check(&self, url: &Url) -> Result<(), FetchError> {
        match url.host() {
            Some(Host::Ipv4(ip)) => return self.check_literal(url, IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => return self.check_literal(url, IpAddr::V6(ip)),
            _ => {}
        }

        validate_parsed_url(url).map_err(|e| FetchError::from_validation(url.as_str(), e))?;

        let host = url
            .host_str()
            .map(normalize_host)
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let addrs = self.resolve_checked(&host).await?;
        tracing::debug!(host = %host, addresses = addrs.len(), "Fetch target passed address checks");
        Ok(())
    }

    fn check_literal(&self, url: &Url, ip: IpAddr) -> Result<(), FetchError> {
        if self.ip_blocked(ip) {
            tracing::warn!(url = %url, ip = %ip, "Blocked fetch to non-public address");
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: format!("address not allowed: {ip}"),
            });
        }
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::InvalidUrl(format!("unsupported scheme {other}"))),
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: "embedded credentials".to_owned(),
            });
        }
        Ok(())
    }

    /// Resolves `host` and rejects the whole set if any address is blocked.
    async fn resolve_checked(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        if is_blocked_hostname(host) {
            return Err(FetchError::Blocked {
                url: host.to_owned(),
                reason: "hostname not allowed".to_owned(),
            });
        }

        let addrs = self
            .resolver
            .lookup(host)
            .await
            .map_err(|e| FetchError::Unresolvable {
                host: host.to_owned(),
                reason: e.to_string(),
            })?;

        if addrs.is_empty() {
            return Err(FetchError::Unresolvable {
                host: host.to_owned(),
                reason: "no addresses".to_owned(),
            });
        }

        if let Some(ip) = addrs.iter().copied().find(|ip| self.ip_blocked(*ip)) {
            tracing::warn!(
                host = %host,
                ip = %ip,
                resolved = addrs.len(),
                "Blocked fetch: host resolves to non-public address"
            );
            return Err(FetchError::Blocked {
                url: host.to_owned(),
                reason: BlockedAddress {
                    host: host.to_owned(),
                    ip,
                }
                .to_string(),
            });
        }

        Ok(addrs)
    }
}

/// DNS resolver handed to the HTTP client so connections can only be opened
/// to addresses that pass the same checks as [`TargetGuard::check`].
pub(crate) struct GuardedResolver {
    guard: TargetGuard,
}

impl GuardedResolver {
    pub(crate) fn new(guard: TargetGuard) -> Self {
        Self { guard }
    }
}

impl reqwest::dns::Resolve for GuardedResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let guard = self.guard.clone();
        let host = normalize_host(name.as_str());
        Box::pin(async move {
            if is_blocked_hostname(&host) {
                return Err(Box::new(BlockedAddress {
                    host,
                    ip: IpAddr::from([0, 0, 0, 0]),
                }) as Box<dyn std::error::Error + Send + Sync>);
            }
            let addrs = guard.resolver.lookup(&host).await?;
            if let Some(ip) = addrs.iter().copied().find(|ip| guard.ip_blocked(*ip)) {
                return Err(Box::new(BlockedAddress { host, ip }) as Box<_>);
            }
            let sockets: Vec<SocketAddr> =
                addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)).collect();
            Ok(Box::new(sockets.into_iter()) as reqwest::dns::Addrs)
        })
    }
}

/// Returns the [`BlockedAddress`] buried in an error's source chain, if any.
pub(crate) fn blocked_in_chain<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a BlockedAddress> {
    let mut current: Option<&'a (dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(blocked) = e.downcast_ref::<BlockedAddress>() {
            return Some(blocked);
        }
        current = e.source();
    }
    None
}
