//! The origin key.
//!
//! Connections are poolable together exactly when their origins are equal:
//! same scheme, lowercased host, normalized port, TLS profile and proxy
//! route.

use std::fmt;

use url::Url;

use crate::http::url::{port_of, Scheme};
use crate::proxy::ProxyIntercept;
use crate::tls::TlsProfileKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
    tls: Option<TlsProfileKey>,
    proxy: Option<u64>,
}

impl Origin {
    pub(crate) fn new(
        url: &Url,
        scheme: Scheme,
        tls: TlsProfileKey,
        proxy: Option<&ProxyIntercept>,
    ) -> Origin {
        Origin {
            scheme,
            host: url.host_str().unwrap_or_default().to_ascii_lowercase(),
            port: port_of(url),
            tls: scheme.is_tls().then_some(tls),
            proxy: proxy.map(ProxyIntercept::key),
        }
    }

    pub(crate) fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)?;
        if self.proxy.is_some() {
            f.write_str(" (proxied)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url::parse_target;

    fn origin(target: &str, tls: TlsProfileKey) -> Origin {
        let (url, scheme) = parse_target(target).unwrap();
        Origin::new(&url, scheme, tls, None)
    }

    #[test]
    fn equal_targets_pool_together() {
        assert_eq!(
            origin("https://Example.com/a", 7),
            origin("https://example.com:443/b?q=1", 7)
        );
    }

    #[test]
    fn tls_profile_splits_the_pool() {
        assert_ne!(origin("https://example.com/", 1), origin("https://example.com/", 2));
        // Plain-text origins ignore the TLS profile.
        assert_eq!(origin("http://example.com/", 1), origin("http://example.com/", 2));
    }

    #[test]
    fn scheme_port_and_proxy_split_the_pool() {
        assert_ne!(origin("http://example.com/", 0), origin("https://example.com/", 0));
        assert_ne!(
            origin("http://example.com/", 0),
            origin("http://example.com:8080/", 0)
        );

        let (url, scheme) = parse_target("http://example.com/").unwrap();
        let proxied = Origin::new(
            &url,
            scheme,
            0,
            Some(&ProxyIntercept {
                url: "http://proxy.local:3128".parse().unwrap(),
                auth: None,
            }),
        );
        assert_ne!(origin("http://example.com/", 0), proxied);
    }
}
