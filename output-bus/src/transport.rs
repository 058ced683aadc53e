use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpSocket, lookup_host};
use url::Url;

use crate::{error::OutputError, sink::BoxedWriter};

/// Where a streaming output connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub key: String,
    /// Local address to bind before connecting; `None` lets the OS choose.
    pub bind_ip: Option<IpAddr>,
}

impl ConnectTarget {
    /// `"default"` or an empty string means no explicit bind address.
    pub fn parse_bind_ip(value: &str) -> Result<Option<IpAddr>, OutputError> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("default") {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|_| OutputError::InvalidStream(format!("invalid bind address: {value}")))
    }
}

/// Opens the byte connection a streaming output writes FLV into.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedWriter, OutputError>;
}

/// Plain TCP ingest: `tcp://host:port`.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    async fn resolve(url: &str) -> Result<Vec<SocketAddr>, OutputError> {
        let parsed = Url::parse(url).map_err(|e| OutputError::BadPath(format!("{url}: {e}")))?;
        if parsed.scheme() != "tcp" {
            return Err(OutputError::InvalidStream(format!(
                "unsupported scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| OutputError::BadPath(format!("{url}: missing host")))?;
        let port = parsed
            .port()
            .ok_or_else(|| OutputError::BadPath(format!("{url}: missing port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| OutputError::ConnectFailed(format!("resolve {host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(OutputError::ConnectFailed(format!("no address for {host}")));
        }
        Ok(addrs)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedWriter, OutputError> {
        let addrs = Self::resolve(&target.url).await?;
        if !target.key.is_empty() {
            log::debug!("tcp ingest ignores the stream key");
        }

        let mut last_err = None;
        for addr in addrs {
            if let Some(bind) = target.bind_ip {
                if bind.is_ipv4() != addr.is_ipv4() {
                    continue;
                }
            }
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(|e| OutputError::ConnectFailed(e.to_string()))?;

            if let Some(bind) = target.bind_ip {
                socket
                    .bind(SocketAddr::new(bind, 0))
                    .map_err(|e| OutputError::ConnectFailed(format!("bind {bind}: {e}")))?;
            }

            match socket.connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    log::info!("connected to {}", addr);
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(format!("{addr}: {e}")),
            }
        }
        Err(OutputError::ConnectFailed(
            last_err.unwrap_or_else(|| "no address matches the bind address family".into()),
        ))
    }
}
