//! Network presence scanning
//!
//! Appliances register their serial number as hostname with the LAN's DNS.
//! A presence pass therefore:
//! 1. reads the gateway host address from a file provided by the host
//! 2. ping-sweeps the /24 siblings of that address in small batches
//! 3. reverse-resolves each live host and checks whether one of the
//!    appliance broker ports accepts TCP connections
//!
//! Results are informational only; sessions always dial the serial hostname.

use dns_lookup::lookup_addr;
use fanlink_core::DeviceId;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Could not read host address from {path}: {source}")]
    IpFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Host address file {0} is empty")]
    EmptyIpFile(PathBuf),
    #[error("Invalid host address: {0}")]
    InvalidAddress(String),
}

/// Presence scanner settings
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ip_file: PathBuf,
    pub probe_ports: Vec<u16>,
    pub probe_timeout: Duration,
    pub sweep_batch_size: usize,
    pub probe_batch_size: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ip_file: PathBuf::from("/opt/host_ip"),
            probe_ports: vec![1883, 8883],
            probe_timeout: Duration::from_secs(2),
            sweep_batch_size: 3,
            probe_batch_size: 2,
        }
    }
}

/// A live host that answered on an appliance port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Host address of the gateway, taken from the first line of `path`
pub fn read_local_address(path: &Path) -> Result<Ipv4Addr, PresenceError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PresenceError::IpFile {
        path: path.to_path_buf(),
        source,
    })?;
    let line = contents.lines().next().map(str::trim).unwrap_or_default();
    if line.is_empty() {
        return Err(PresenceError::EmptyIpFile(path.to_path_buf()));
    }
    line.parse()
        .map_err(|_| PresenceError::InvalidAddress(line.to_string()))
}

/// `x.y.z.1` through `x.y.z.254`, minus the local address itself
pub fn sibling_range(local: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();
    (1..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != local)
        .collect()
}

async fn ping(host: Ipv4Addr) -> bool {
    let result = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", "1", &host.to_string()])
        .output()
        .await;
    matches!(result, Ok(output) if output.status.success())
}

/// Ping every host; each batch runs sequentially, batches run in parallel
pub async fn sweep(hosts: &[Ipv4Addr], batch_size: usize) -> Vec<Ipv4Addr> {
    let mut tasks = JoinSet::new();

    for batch in hosts.chunks(batch_size.max(1)) {
        let batch = batch.to_vec();
        tasks.spawn(async move {
            let mut alive = Vec::new();
            for host in batch {
                if ping(host).await {
                    alive.push(host);
                }
            }
            alive
        });
    }

    let mut alive = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(batch) = result {
            alive.extend(batch);
        }
    }
    alive.sort();

    debug!(scanned = hosts.len(), alive = alive.len(), "Ping sweep finished");
    alive
}

/// Reverse-resolve a host; a name equal to the address does not count
async fn reverse_lookup(host: Ipv4Addr) -> Option<String> {
    let ip = IpAddr::V4(host);
    let name = tokio::task::spawn_blocking(move || lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()?;
    if name == host.to_string() {
        None
    } else {
        Some(name)
    }
}

/// First port on `host` accepting a TCP connection within `timeout`
pub async fn first_open_port(host: Ipv4Addr, ports: &[u16], timeout: Duration) -> Option<u16> {
    for &port in ports {
        let addr = SocketAddr::new(IpAddr::V4(host), port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => return Some(port),
            Ok(Err(e)) => trace!(addr = %addr, error = %e, "Port closed"),
            Err(_) => trace!(addr = %addr, "Port probe timed out"),
        }
    }
    None
}

async fn probe_host(host: Ipv4Addr, ports: &[u16], timeout: Duration) -> Option<(String, ProbeHit)> {
    let name = reverse_lookup(host).await?;
    let port = first_open_port(host, ports, timeout).await?;
    Some((name.to_uppercase(), ProbeHit { ip: host, port }))
}

/// Probe live hosts; returns upper-cased hostname -> hit
pub async fn probe(hosts: &[Ipv4Addr], config: &PresenceConfig) -> HashMap<String, ProbeHit> {
    let mut tasks = JoinSet::new();

    for batch in hosts.chunks(config.probe_batch_size.max(1)) {
        let batch = batch.to_vec();
        let ports = config.probe_ports.clone();
        let timeout = config.probe_timeout;
        tasks.spawn(async move {
            let mut hits = Vec::new();
            for host in batch {
                if let Some(hit) = probe_host(host, &ports, timeout).await {
                    hits.push(hit);
                }
            }
            hits
        });
    }

    let mut hits = HashMap::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(batch) = result {
            hits.extend(batch);
        }
    }

    debug!(probed = hosts.len(), found = hits.len(), "Probe finished");
    hits
}

/// Full presence pass: address file, sweep, probe
pub async fn scan(config: &PresenceConfig) -> Result<HashMap<String, ProbeHit>, PresenceError> {
    let local = read_local_address(&config.ip_file)?;
    let range = sibling_range(local);
    debug!(local = %local, hosts = range.len(), "Scanning local network");

    let alive = sweep(&range, config.sweep_batch_size).await;
    Ok(probe(&alive, config).await)
}

/// Devices whose serial appears in a resolved hostname
pub fn match_devices<'a>(
    ids: impl IntoIterator<Item = &'a DeviceId>,
    id_prefix: &str,
    hits: &HashMap<String, ProbeHit>,
) -> Vec<(DeviceId, String, ProbeHit)> {
    let mut matches = Vec::new();
    for id in ids {
        let serial = id.serial(id_prefix).to_uppercase();
        if let Some((hostname, hit)) = hits.iter().find(|(name, _)| name.contains(&serial)) {
            matches.push((id.clone(), hostname.clone(), *hit));
        }
    }
    matches
}
