use crate::{
    admin::Metrics,
    ca::{CaMaterial, CertificateAuthority, CertificateAuthorityManager, InterceptAuthority},
    capture::CaptureEntry,
    config::ProxyConfig,
    error::ProxyError,
    events::{EventBroadcaster, Subscription},
    filter::ScopeMatcher,
    handlers::{ExchangeContext, InterceptHandler},
    log_buffer::LogBuffer,
    rules::RuleEngine,
    trust,
    upstream::UpstreamClient,
    Result,
};
use hudsucker::ProxyBuilder;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const BIND_WAIT_ATTEMPTS: u32 = 100;
const BIND_WAIT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub port: Option<u16>,
}

struct RunningProxy {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The embeddable proxy: listener lifecycle plus the shared rule, log and event state.
///
/// Rules, captures and subscribers outlive `stop()`/`start()` cycles.
pub struct InterceptionEngine {
    config: ProxyConfig,
    rules: Arc<RuleEngine>,
    log: Arc<LogBuffer>,
    events: Arc<EventBroadcaster>,
    metrics: Arc<Metrics>,
    running: Mutex<Option<RunningProxy>>,
    ca: parking_lot::RwLock<Option<CaMaterial>>,
}

impl InterceptionEngine {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBroadcaster::new(config.events.subscriber_queue));
        let rules = Arc::new(
            RuleEngine::new(events.clone()).with_debug_snapshot_size(config.capture.debug_snapshot_size),
        );
        let log = Arc::new(LogBuffer::new(config.capture.buffer_capacity, events.clone()));

        Ok(Self {
            config,
            rules,
            log,
            events,
            metrics: Arc::new(Metrics::default()),
            running: Mutex::new(None),
            ca: parking_lot::RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn log(&self) -> &Arc<LogBuffer> {
        &self.log
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<CaptureEntry> {
        self.log.snapshot()
    }

    /// CA in use by the last successful `start()`.
    pub fn ca_material(&self) -> Option<CaMaterial> {
        self.ca.read().clone()
    }

    /// Start listening and return the bound port.
    ///
    /// Without explicit PEMs the CA is loaded from (or created in) the configured
    /// storage path. Calling this while running returns the current port.
    pub async fn start(&self, ca_cert_pem: Option<&str>, ca_key_pem: Option<&str>) -> Result<u16> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                debug!("Proxy already running on port {}", current.port);
                return Ok(current.port);
            }
            warn!("Proxy task on port {} exited unexpectedly, restarting", current.port);
            *running = None;
        }

        let material = match (ca_cert_pem, ca_key_pem) {
            (Some(cert_pem), Some(key_pem)) => CaMaterial {
                cert_pem: cert_pem.to_string(),
                key_pem: key_pem.to_string(),
            },
            (None, None) => CertificateAuthorityManager::new(&self.config.certificate).ensure()?,
            _ => {
                return Err(ProxyError::Tls(
                    "CA certificate and key must be supplied together".to_string(),
                ))
            }
        };
        let provider = Arc::new(CertificateAuthority::from_material(
            &material,
            self.config.certificate.leaf_validity_days,
        )?);
        let authority = InterceptAuthority::new(provider, self.config.certificate.leaf_cache_size);

        let handler = InterceptHandler::new(ExchangeContext {
            rules: self.rules.clone(),
            log: self.log.clone(),
            metrics: self.metrics.clone(),
            upstream: UpstreamClient::new(&self.config.upstream)?,
            scope: ScopeMatcher::from_config(&self.config.capture),
            capture: self.config.capture.clone(),
            session_header: self.config.session_header.to_ascii_lowercase(),
        });

        let addr = self.resolve_listen_addr()?;
        let connect_addr = SocketAddr::new(loopback_for(addr.ip()), addr.port());

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(handler)
            .build();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = proxy.start(shutdown).await {
                error!("Proxy failed: {}", e);
            }
        });

        wait_until_listening(connect_addr, &task).await.map_err(|e| {
            task.abort();
            e
        })?;

        *self.ca.write() = Some(material);
        *running = Some(RunningProxy {
            port: addr.port(),
            shutdown: shutdown_tx,
            task,
        });
        info!("Proxy listening on {}", addr);
        Ok(addr.port())
    }

    /// Stop accepting connections and release the port.
    ///
    /// In-flight exchanges get the configured grace window. Returns false when
    /// the engine was not running.
    pub async fn stop(&self) -> bool {
        let Some(current) = self.running.lock().await.take() else {
            return false;
        };

        let _ = current.shutdown.send(());
        let mut task = current.task;
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("In-flight exchanges did not finish within {:?}, aborting", grace);
            task.abort();
            let _ = task.await;
        }

        info!("Proxy on port {} stopped", current.port);
        true
    }

    pub async fn status(&self) -> EngineStatus {
        match self.running.lock().await.as_ref() {
            Some(current) if !current.task.is_finished() => EngineStatus {
                running: true,
                port: Some(current.port),
            },
            _ => EngineStatus {
                running: false,
                port: None,
            },
        }
    }

    /// Check whether this environment trusts the CA, using the configured probe URL.
    pub async fn verify_trust(&self) -> bool {
        self.verify_trust_with(&self.config.trust.probe_url, &[]).await
    }

    /// Trust probe against `probe_url`, additionally trusting `extra_roots_pem`.
    pub async fn verify_trust_with(&self, probe_url: &str, extra_roots_pem: &[String]) -> bool {
        let status = self.status().await;
        let Some(port) = status.port else {
            debug!("Trust probe skipped: proxy not running");
            return false;
        };
        trust::probe_through_proxy(port, probe_url, &self.config.trust, extra_roots_pem).await
    }

    fn resolve_listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.listen_address.parse().map_err(|e| {
            ProxyError::Network(format!(
                "Invalid listen address {}: {}",
                self.config.listen_address, e
            ))
        })?;
        // Bind once to fail early on a taken port and to resolve port 0
        let probe = std::net::TcpListener::bind(SocketAddr::new(ip, self.config.listen_port))
            .map_err(|e| {
                ProxyError::Network(format!(
                    "Failed to bind {}:{}: {}",
                    ip, self.config.listen_port, e
                ))
            })?;
        let addr = probe.local_addr()?;
        drop(probe);
        Ok(addr)
    }
}

impl Drop for InterceptionEngine {
    fn drop(&mut self) {
        if let Some(current) = self.running.get_mut().take() {
            let _ = current.shutdown.send(());
            current.task.abort();
        }
    }
}

fn loopback_for(ip: IpAddr) -> IpAddr {
    if !ip.is_unspecified() {
        return ip;
    }
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    }
}

async fn wait_until_listening(addr: SocketAddr, task: &JoinHandle<()>) -> Result<()> {
    for _ in 0..BIND_WAIT_ATTEMPTS {
        if task.is_finished() {
            return Err(ProxyError::Network(format!("Proxy exited while binding {}", addr)));
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(BIND_WAIT_INTERVAL).await;
    }
    Err(ProxyError::Network(format!("Proxy did not start listening on {}", addr)))
}
