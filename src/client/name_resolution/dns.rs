//! The DNS resolver: A/AAAA address lookups interleaved v4-first, with
//! service configs delivered over TXT records.

use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Address, ResolutionListener, Resolver, ResolverFactory, Target, TargetHost};
use crate::client::service_config::select_txt_service_config;
use crate::status::Status;

/// Whether this host can dial IPv6 literals. Checked once per process; when
/// false, AAAA results and IPv6 literal targets are suppressed.
static IPV6_AVAILABLE: LazyLock<bool> =
    LazyLock::new(|| UdpSocket::bind("[::1]:0").is_ok());

/// Performs the actual lookups. The production implementation wraps hickory;
/// tests substitute fakes.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Resolves A and AAAA records for `name`.
    async fn lookup_ips(&self, name: &str) -> Result<Vec<IpAddr>, String>;

    /// Resolves TXT records for `name`. Multi-string records are joined.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, String>;
}

/// A [`DnsProvider`] backed by hickory with the tokio connection provider.
pub struct HickoryDnsProvider {
    resolver: TokioResolver,
}

impl HickoryDnsProvider {
    /// Creates a provider using the system DNS configuration, or the given
    /// `authority` server when the target named one.
    pub fn new(authority: Option<std::net::SocketAddr>) -> Result<HickoryDnsProvider, String> {
        let builder = if let Some(server) = authority {
            let provider = TokioConnectionProvider::default();
            let name_servers =
                NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
            let config = ResolverConfig::from_parts(None, vec![], name_servers);
            TokioResolver::builder_with_config(config, provider)
        } else {
            TokioResolver::builder_tokio().map_err(|err| err.to_string())?
        };
        let mut resolver_opts = ResolverOpts::default();
        resolver_opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        Ok(HickoryDnsProvider {
            resolver: builder.with_options(resolver_opts).build(),
        })
    }
}

#[async_trait]
impl DnsProvider for HickoryDnsProvider {
    async fn lookup_ips(&self, name: &str) -> Result<Vec<IpAddr>, String> {
        let response = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|err| err.to_string())?;
        Ok(response.iter().collect())
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, String> {
        let response = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|err| err.to_string())?
            .iter()
            .map(|txt_record| {
                txt_record
                    .iter()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .collect::<Vec<String>>()
                    .join("")
            })
            .collect();
        Ok(response)
    }
}

/// Resolves `dns:` targets and IP literals.
pub struct DnsResolver {
    target: Target,
    listener: Arc<dyn ResolutionListener>,
    provider: Arc<dyn DnsProvider>,
    /// Drawn once at construction; keeps the TXT service config choice stable
    /// for the resolver's lifetime.
    selection_percentage: u32,
    ipv6_available: bool,
    in_flight: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DnsResolver {
    pub fn new(
        target: Target,
        listener: Arc<dyn ResolutionListener>,
        provider: Arc<dyn DnsProvider>,
    ) -> DnsResolver {
        DnsResolver::with_capabilities(target, listener, provider, *IPV6_AVAILABLE)
    }

    fn with_capabilities(
        target: Target,
        listener: Arc<dyn ResolutionListener>,
        provider: Arc<dyn DnsProvider>,
        ipv6_available: bool,
    ) -> DnsResolver {
        DnsResolver {
            target,
            listener,
            provider,
            selection_percentage: rand::rng().random_range(0..100),
            ipv6_available,
            in_flight: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    fn resolve(&self) {
        // One outcome per request: further requests coalesce into the
        // in-flight one.
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let target = self.target.clone();
        let listener = self.listener.clone();
        let provider = self.provider.clone();
        let selection_percentage = self.selection_percentage;
        let ipv6_available = self.ipv6_available;
        let in_flight = self.in_flight.clone();

        let handle = tokio::spawn(async move {
            match target.host() {
                TargetHost::Ip(ip) => {
                    if ip.is_ipv6() && !ipv6_available {
                        listener.on_error(Status::unavailable(format!(
                            "Name resolution failed for target {target}"
                        )));
                    } else {
                        listener.on_successful_resolution(
                            vec![Address::from_ip(*ip, target.port())],
                            None,
                            None,
                        );
                    }
                }
                TargetHost::Domain(host) => {
                    let (ips, txt) =
                        tokio::join!(provider.lookup_ips(host), provider.lookup_txt(host));
                    match ips {
                        Ok(ips) => {
                            let addresses =
                                interleave_addresses(&ips, target.port(), ipv6_available);
                            if addresses.is_empty() {
                                listener.on_error(Status::unavailable(format!(
                                    "Name resolution failed for target {target}"
                                )));
                            } else {
                                let (config, config_error) = match txt {
                                    Ok(records) => {
                                        match select_txt_service_config(
                                            &records,
                                            selection_percentage,
                                        ) {
                                            Ok(config) => (config, None),
                                            Err(err) => {
                                                warn!(%target, err = %err, "invalid service config in TXT record");
                                                (None, Some(Status::unavailable(err)))
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        debug!(%target, err = %err, "TXT lookup failed");
                                        (None, Some(Status::unavailable("TXT query failed")))
                                    }
                                };
                                listener.on_successful_resolution(addresses, config, config_error);
                            }
                        }
                        Err(err) => {
                            debug!(%target, err = %err, "address lookup failed");
                            listener.on_error(Status::unavailable(format!(
                                "Name resolution failed for target {target}"
                            )));
                        }
                    }
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        });
        *self.task.lock().unwrap() = Some(handle);
    }
}

impl Resolver for DnsResolver {
    fn start_resolution(&self) {
        self.resolve();
    }

    fn update_resolution(&self) {
        self.resolve();
    }

    fn destroy(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Interleaves A and AAAA results round-robin, A first, dropping AAAA results
/// on hosts without IPv6 support.
fn interleave_addresses(ips: &[IpAddr], port: u16, ipv6_available: bool) -> Vec<Address> {
    let v4: Vec<&IpAddr> = ips.iter().filter(|ip| ip.is_ipv4()).collect();
    let v6: Vec<&IpAddr> = if ipv6_available {
        ips.iter().filter(|ip| ip.is_ipv6()).collect()
    } else {
        Vec::new()
    };

    let mut addresses = Vec::with_capacity(v4.len() + v6.len());
    for i in 0..v4.len().max(v6.len()) {
        if let Some(ip) = v4.get(i) {
            addresses.push(Address::from_ip(**ip, port));
        }
        if let Some(ip) = v6.get(i) {
            addresses.push(Address::from_ip(**ip, port));
        }
    }
    addresses
}

const DEFAULT_DNS_PORT: u16 = 53;

/// A resolver that only ever reports a fixed construction error.
struct FailingResolver {
    error: Status,
    listener: Arc<dyn ResolutionListener>,
}

impl Resolver for FailingResolver {
    fn start_resolution(&self) {
        let listener = self.listener.clone();
        let error = self.error.clone();
        tokio::spawn(async move {
            listener.on_error(error);
        });
    }

    fn update_resolution(&self) {
        self.start_resolution();
    }

    fn destroy(&self) {}
}

/// Builds [`DnsResolver`]s over a shared provider. Targets naming their own
/// DNS authority (`dns://8.8.8.8/host`) get a dedicated provider pointed at
/// that server.
pub struct DnsResolverFactory {
    provider: Arc<dyn DnsProvider>,
}

impl DnsResolverFactory {
    pub fn new(provider: Arc<dyn DnsProvider>) -> DnsResolverFactory {
        DnsResolverFactory { provider }
    }

    /// A factory using the system DNS configuration.
    pub fn system() -> Result<DnsResolverFactory, String> {
        Ok(DnsResolverFactory::new(Arc::new(HickoryDnsProvider::new(None)?)))
    }

    fn provider_for(&self, target: &Target) -> Result<Arc<dyn DnsProvider>, String> {
        let Some(authority) = target.authority() else {
            return Ok(self.provider.clone());
        };
        let server = parse_dns_authority(authority)
            .ok_or_else(|| format!("unusable DNS authority {authority:?}: must be an IP address"))?;
        Ok(Arc::new(HickoryDnsProvider::new(Some(server))?))
    }
}

/// Parses a resolver authority as `ip[:port]`, defaulting to the DNS port.
fn parse_dns_authority(authority: &str) -> Option<std::net::SocketAddr> {
    if let Ok(addr) = authority.parse() {
        return Some(addr);
    }
    authority
        .parse::<IpAddr>()
        .ok()
        .map(|ip| std::net::SocketAddr::new(ip, DEFAULT_DNS_PORT))
}

impl ResolverFactory for DnsResolverFactory {
    fn create(&self, target: &Target, listener: Arc<dyn ResolutionListener>) -> Box<dyn Resolver> {
        match self.provider_for(target) {
            Ok(provider) => Box::new(DnsResolver::new(target.clone(), listener, provider)),
            Err(error) => Box::new(FailingResolver {
                error: Status::unavailable(error),
                listener,
            }),
        }
    }
}
