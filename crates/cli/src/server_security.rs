use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;

/// Where the proxy will listen, checked against the loopback rule.
///
/// The proxy forwards to the inference server without authentication, so
/// any address that is reachable from other hosts needs an explicit
/// `--public`.
#[derive(Debug, Clone)]
pub(crate) struct ProxyBind {
    requested: String,
    addrs: Vec<SocketAddr>,
}

impl ProxyBind {
    pub(crate) async fn resolve(requested: &str, public: bool) -> Result<Self> {
        // lookup_host so `localhost:1235` works as well as literal IPs.
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(requested)
            .await
            .with_context(|| format!("Failed to resolve proxy bind address: {requested}"))?
            .collect();
        Self::checked(requested, addrs, public)
    }

    fn checked(requested: &str, addrs: Vec<SocketAddr>, public: bool) -> Result<Self> {
        if addrs.is_empty() {
            anyhow::bail!("Proxy bind address resolved to nothing: {requested}")
        }
        let bind = Self {
            requested: requested.to_string(),
            addrs,
        };
        if bind.is_exposed() && !public {
            anyhow::bail!(
                "Refusing to bind to non-loopback address without --public: {requested}. The proxy forwards to your inference server unauthenticated; pass --public only on a trusted network."
            )
        }
        Ok(bind)
    }

    /// True when any resolved address accepts connections from other hosts.
    pub(crate) fn is_exposed(&self) -> bool {
        self.addrs.iter().any(|addr| !addr.ip().is_loopback())
    }

    /// The address to listen on: IPv4 first, since LM Studio clients
    /// default to `127.0.0.1`.
    pub(crate) fn listen_addr(&self) -> SocketAddr {
        self.addrs
            .iter()
            .copied()
            .find(SocketAddr::is_ipv4)
            .unwrap_or(self.addrs[0])
    }

    pub(crate) fn describe(&self) -> String {
        let addrs = self
            .addrs
            .iter()
            .map(SocketAddr::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} ({addrs})", self.requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(raw: &[&str]) -> Vec<SocketAddr> {
        raw.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn loopback_needs_no_public_flag() {
        let bind = ProxyBind::resolve("127.0.0.1:0", false).await.unwrap();
        assert!(!bind.is_exposed());

        let err = ProxyBind::resolve("0.0.0.0:0", false).await.unwrap_err();
        assert!(err.to_string().starts_with("Refusing to bind"));

        let bind = ProxyBind::resolve("0.0.0.0:0", true).await.unwrap();
        assert!(bind.is_exposed());
    }

    #[test]
    fn mixed_resolution_counts_as_exposed() {
        let mixed = addrs(&["127.0.0.1:1235", "192.168.1.20:1235"]);
        assert!(ProxyBind::checked("studio.lan:1235", mixed.clone(), false).is_err());
        let bind = ProxyBind::checked("studio.lan:1235", mixed, true).unwrap();
        assert_eq!(
            bind.describe(),
            "studio.lan:1235 (127.0.0.1:1235, 192.168.1.20:1235)"
        );
    }

    #[test]
    fn listens_on_ipv4_when_available() {
        let bind = ProxyBind::checked("localhost:1235", addrs(&["[::1]:1235", "127.0.0.1:1235"]), false).unwrap();
        assert_eq!(bind.listen_addr(), "127.0.0.1:1235".parse().unwrap());

        let bind = ProxyBind::checked("localhost:1235", addrs(&["[::1]:1235"]), false).unwrap();
        assert_eq!(bind.listen_addr(), "[::1]:1235".parse().unwrap());

        assert!(ProxyBind::checked("nowhere:1235", Vec::new(), true).is_err());
    }
}
