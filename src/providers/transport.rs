//! Pooled HTTP client for provider traffic.

use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::error::GatewayError;

/// Default per-attempt deadline for unary sends.
pub const DEFAULT_UNARY_TIMEOUT: Duration = Duration::from_secs(120);
/// Connect timeout for all upstream sockets.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(
    timeout: Option<Duration>,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Some(Duration::from_secs(15)))
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| GatewayError::Internal(format!("invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| GatewayError::Internal(format!("failed to build HTTP client: {err}")))
}

/// HTTP transport for provider adapters: one pooled client for unary sends
/// (request deadline applied), one without a total deadline for streams
/// (which use the idle timeout instead), plus lazily-built per-proxy
/// clients.
pub struct HttpTransport {
    unary_client: reqwest::Client,
    stream_client: reqwest::Client,
    proxy_clients: RwLock<FxHashMap<String, Arc<reqwest::Client>>>,
    unary_timeout: Duration,
}

impl HttpTransport {
    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] when the TLS stack fails to
    /// initialize.
    pub fn new(unary_timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            unary_client: build_client(Some(unary_timeout), None)?,
            stream_client: build_client(None, None)?,
            proxy_clients: RwLock::new(FxHashMap::default()),
            unary_timeout,
        })
    }

    #[must_use]
    pub fn unary_timeout(&self) -> Duration {
        self.unary_timeout
    }

    /// Client for a unary send, honoring an optional per-target proxy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] for an invalid proxy URL.
    pub fn unary_client(&self, proxy: Option<&str>) -> Result<reqwest::Client, GatewayError> {
        match proxy {
            None => Ok(self.unary_client.clone()),
            Some(proxy_url) => self.proxy_client(proxy_url, Some(self.unary_timeout)),
        }
    }

    /// Client for a streaming send (no total deadline).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] for an invalid proxy URL.
    pub fn stream_client(&self, proxy: Option<&str>) -> Result<reqwest::Client, GatewayError> {
        match proxy {
            None => Ok(self.stream_client.clone()),
            Some(proxy_url) => self.proxy_client(proxy_url, None),
        }
    }

    fn proxy_client(
        &self,
        proxy_url: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Client, GatewayError> {
        let cache_key = format!(
            "{}|{}",
            proxy_url,
            timeout.map_or(0, |t| t.as_millis() as u64)
        );
        if let Some(client) = self.proxy_clients.read().get(&cache_key) {
            return Ok(client.as_ref().clone());
        }
        let client = Arc::new(build_client(timeout, Some(proxy_url))?);
        let mut cache = self.proxy_clients.write();
        if cache.len() >= 64 {
            cache.clear();
        }
        cache.insert(cache_key, Arc::clone(&client));
        Ok(client.as_ref().clone())
    }
}
