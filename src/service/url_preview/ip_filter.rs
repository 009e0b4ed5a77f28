//! Keeps link previews away from addresses they have no business contacting

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{warn, Instrument};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::IpNetwork;

/// Allow and deny lists applied to every address a preview connects to
#[derive(Clone, Debug, Default)]
pub(crate) struct AddressFilter {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
}

impl AddressFilter {
    pub(crate) fn new(allow: Vec<IpNetwork>, deny: Vec<IpNetwork>) -> Self {
        Self {
            allow,
            deny,
        }
    }

    /// An explicit allow entry wins over any deny entry
    pub(crate) fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allow.iter().any(|network| network.contains(ip))
            || !self.deny.iter().any(|network| network.contains(ip))
    }
}

/// DNS resolver that only hands out addresses passing an [`AddressFilter`]
///
/// Filtering the resolved addresses, rather than the hostname, means a name
/// that starts pointing somewhere internal between checks is still caught.
pub(crate) struct FilteringResolver {
    inner: TokioAsyncResolver,
    filter: Arc<AddressFilter>,
}

impl FilteringResolver {
    pub(crate) fn new(
        inner: TokioAsyncResolver,
        filter: Arc<AddressFilter>,
    ) -> Self {
        Self {
            inner,
            filter,
        }
    }
}

impl Resolve for FilteringResolver {
    #[tracing::instrument(skip(self))]
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.inner.clone();
        let filter = Arc::clone(&self.filter);

        Box::pin(
            async move {
                let lookup = resolver.lookup_ip(name.as_str()).await?;

                let addrs: Vec<_> = lookup
                    .iter()
                    .filter(|ip| {
                        let allowed = filter.is_allowed(*ip);
                        if !allowed {
                            warn!(%ip, "refusing to connect to address");
                        }
                        allowed
                    })
                    // The port is filled in by the caller
                    .map(|ip| SocketAddr::new(ip, 0))
                    .collect();

                if addrs.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} has no allowed addresses", name.as_str()),
                    )
                    .into());
                }

                let addrs: Addrs = Box::new(addrs.into_iter());
                Ok(addrs)
            }
            .in_current_span(),
        )
    }
}
