//! Trust probe for the root CA
//!
//! A probe is a real HTTPS round trip through the running engine. If the
//! platform trust store trusts our CA, the handshake with the minted leaf
//! succeeds and any HTTP response counts. Hosts that keep their own bundle
//! pass it as extra roots, which then replace the platform roots.

use crate::config::TrustProbeConfig;
use reqwest::{Certificate, Proxy};
use tracing::{debug, info, warn};

/// Run the probe against a proxy listening on `proxy_port` on the loopback interface.
pub async fn probe_through_proxy(
    proxy_port: u16,
    probe_url: &str,
    config: &TrustProbeConfig,
    extra_roots_pem: &[String],
) -> bool {
    let proxy = match Proxy::all(format!("http://127.0.0.1:{}", proxy_port)) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!("Trust probe proxy setup failed: {}", e);
            return false;
        }
    };

    let mut builder = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(config.timeout())
        .redirect(reqwest::redirect::Policy::none());

    if !extra_roots_pem.is_empty() {
        builder = builder.tls_built_in_root_certs(false);
    }
    for pem in extra_roots_pem {
        match Certificate::from_pem(pem.as_bytes()) {
            Ok(cert) => builder = builder.add_root_certificate(cert),
            Err(e) => {
                warn!("Ignoring unparseable trust root: {}", e);
            }
        }
    }

    let client = match builder.build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Trust probe client setup failed: {}", e);
            return false;
        }
    };

    match client.get(probe_url).send().await {
        Ok(response) => {
            info!("Trust probe {} answered {}", probe_url, response.status());
            true
        }
        Err(e) => {
            debug!("Trust probe {} failed: {}", probe_url, e);
            false
        }
    }
}
