use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::{Host, Url};

use crate::config::{DEFAULT_PROXY, DEFAULT_PROXY_PORT, DEFAULT_TOR_SOCKS_PORT};
use crate::error::{Result, TunnelError};

/// Where the target hostname gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// Resolve locally, send an address to the proxy
    Socks5,
    /// Send the hostname, the proxy resolves it
    Socks5h,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxySpec {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// The local Tor client's SOCKS listener for this platform.
    pub fn tor() -> Self {
        Self::new(ProxyScheme::Socks5h, "127.0.0.1", DEFAULT_TOR_SOCKS_PORT)
    }

    /// Parses a `socks5://` / `socks5h://` URI or one of the keywords
    /// `tor`, `socks`, `proxy`, `1080`, `true`, `1`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tor" => Ok(Self::tor()),
            "socks" | "proxy" | "1080" | "true" | "1" => Self::parse_uri(DEFAULT_PROXY),
            _ => Self::parse_uri(s),
        }
    }

    fn parse_uri(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(TunnelError::Config("empty proxy string".to_string()));
        }
        if !s.contains("://") {
            return Err(TunnelError::Config(format!(
                "proxy {:?} must look like socks5h://host:port",
                s
            )));
        }

        let url = Url::parse(s)
            .map_err(|e| TunnelError::Config(format!("Invalid proxy URL {:?}: {}", s, e)))?;

        let scheme = match url.scheme() {
            "socks5" => ProxyScheme::Socks5,
            "socks5h" => ProxyScheme::Socks5h,
            other => {
                return Err(TunnelError::Config(format!(
                    "unsupported proxy scheme {:?} (expected socks5 or socks5h)",
                    other
                )))
            }
        };

        if !url.username().is_empty() || url.password().is_some() {
            return Err(TunnelError::Config(
                "proxy authentication is not supported".to_string(),
            ));
        }

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => {
                return Err(TunnelError::Config(format!(
                    "proxy {:?} is missing a host",
                    s
                )))
            }
        };

        Ok(Self::new(
            scheme,
            host,
            url.port().unwrap_or(DEFAULT_PROXY_PORT),
        ))
    }
}

impl FromStr for ProxySpec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}",
            self.scheme.as_str(),
            host_port(&self.host, self.port)
        )
    }
}

pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Opens a TCP stream to `host:port`, through the proxy when one is given.
///
/// Every network wait (resolution, each connect attempt, the SOCKS
/// handshake) is bounded by `timeout`. On failure nothing stays open.
pub(crate) async fn open_tcp(
    host: &str,
    port: u16,
    proxy: Option<&ProxySpec>,
    timeout: Duration,
) -> Result<TcpStream> {
    match proxy {
        None => connect_direct(host, port, timeout).await,
        Some(proxy) => connect_via_socks(proxy, host, port, timeout).await,
    }
}

async fn resolve(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>> {
    let addrs = tokio::time::timeout(timeout, lookup_host((host, port)))
        .await
        .map_err(|_| TunnelError::timeout(format!("resolving {}", host), timeout))?
        .map_err(|e| TunnelError::Resolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(TunnelError::Resolution {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        });
    }
    Ok(addrs)
}

async fn connect_direct(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = host_port(host, port);
    let mut last_err = None;

    for addr in resolve(host, port, timeout).await? {
        debug!("Connecting to {} ({})", target, addr);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                last_err = Some(TunnelError::Connect {
                    target: target.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                last_err = Some(TunnelError::timeout(
                    format!("connecting to {}", target),
                    timeout,
                ))
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TunnelError::Connect {
        target,
        reason: "no address could be tried".to_string(),
    }))
}

async fn connect_via_socks(
    proxy: &ProxySpec,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream> {
    let target = host_port(host, port);

    let local_addr = match proxy.scheme {
        ProxyScheme::Socks5 => resolve(host, port, timeout).await?.first().copied(),
        ProxyScheme::Socks5h => None,
    };

    let socket = connect_direct(&proxy.host, proxy.port, timeout)
        .await
        .map_err(|e| TunnelError::ProxyUnreachable {
            proxy: proxy.to_string(),
            reason: e.to_string(),
        })?;

    debug!("SOCKS handshake with {} for {}", proxy, target);

    let handshake = async {
        match local_addr {
            Some(addr) => Socks5Stream::connect_with_socket(socket, addr).await,
            None => Socks5Stream::connect_with_socket(socket, (host, port)).await,
        }
    };

    match tokio::time::timeout(timeout, handshake).await {
        Err(_) => Err(TunnelError::timeout(
            format!("negotiating with proxy {}", proxy),
            timeout,
        )),
        Ok(Err(e)) => Err(socks_error(e, &target)),
        Ok(Ok(stream)) => Ok(stream.into_inner()),
    }
}

fn socks_error(err: tokio_socks::Error, target: &str) -> TunnelError {
    use tokio_socks::Error as SocksError;

    let code = match &err {
        SocksError::GeneralSocksServerFailure => 0x01,
        SocksError::ConnectionNotAllowedByRuleset => 0x02,
        SocksError::NetworkUnreachable => 0x03,
        SocksError::HostUnreachable => 0x04,
        SocksError::ConnectionRefused => 0x05,
        SocksError::TtlExpired => 0x06,
        SocksError::CommandNotSupported => 0x07,
        SocksError::AddressTypeNotSupported => 0x08,
        _ => {
            return TunnelError::ProxyHandshake(format!(
                "{} (while connecting to {})",
                err, target
            ))
        }
    };

    TunnelError::ProxyRejected {
        target: target.to_string(),
        code,
        reason: reply_description(code).to_string(),
    }
}

/// Human-readable text for a SOCKS5 CONNECT reply code.
pub fn reply_description(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}
