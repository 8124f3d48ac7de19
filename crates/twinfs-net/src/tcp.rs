//! TCP transport for the data- and admin-protocol surfaces.
//!
//! Connections are per-call: the connector probes the peer once at proxy
//! creation (so unreachable peers are classified immediately), after which
//! every RPC opens a fresh connection, sends one [`WireRequest`] line, and
//! reads one [`WireResponse`] line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;
use twinfs_proto::{Block, DatanodeRegistration, ErrorSeverity, NamespaceInfo};

use crate::error::{NetError, NetResult};
use crate::protocol::{AdminProtocol, DataProtocol, ProtocolConnector};
use crate::wire::{WireRequest, WireResponse};

/// Dials metadata servers over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl TcpConnector {
    async fn probe(&self, addr: SocketAddr) -> NetResult<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(NetError::from_io)?;
        drop(stream);
        Ok(())
    }

    async fn call(&self, addr: SocketAddr, request: &WireRequest) -> NetResult<WireResponse> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(NetError::from_io)?;

        let exchange = async {
            let (read_half, mut write_half) = stream.into_split();
            let mut frame = serde_json::to_vec(request).map_err(invalid_data)?;
            frame.push(b'\n');
            write_half.write_all(&frame).await.map_err(NetError::from_io)?;
            write_half.shutdown().await.map_err(NetError::from_io)?;

            let mut line = String::new();
            let n = BufReader::new(read_half)
                .read_line(&mut line)
                .await
                .map_err(NetError::from_io)?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            serde_json::from_str::<WireResponse>(line.trim_end()).map_err(invalid_data)
        };
        let response = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| NetError::Timeout)??;

        trace!(peer = %addr, "rpc exchange complete");
        match response {
            WireResponse::Error(remote) => Err(NetError::Remote(remote)),
            other => Ok(other),
        }
    }
}

fn invalid_data(e: serde_json::Error) -> NetError {
    NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn unexpected_response() -> NetError {
    NetError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "unexpected response variant",
    ))
}

#[async_trait]
impl ProtocolConnector for TcpConnector {
    async fn connect_data(&self, addr: SocketAddr) -> NetResult<Arc<dyn DataProtocol>> {
        self.probe(addr).await?;
        Ok(Arc::new(TcpDataProxy {
            addr,
            connector: self.clone(),
        }))
    }

    async fn connect_admin(&self, addr: SocketAddr) -> NetResult<Arc<dyn AdminProtocol>> {
        self.probe(addr).await?;
        Ok(Arc::new(TcpAdminProxy {
            addr,
            connector: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct TcpDataProxy {
    addr: SocketAddr,
    connector: TcpConnector,
}

#[async_trait]
impl DataProtocol for TcpDataProxy {
    async fn version_request(&self) -> NetResult<NamespaceInfo> {
        match self
            .connector
            .call(self.addr, &WireRequest::VersionRequest)
            .await?
        {
            WireResponse::NamespaceInfo(info) => Ok(info),
            _ => Err(unexpected_response()),
        }
    }

    async fn register(
        &self,
        registration: DatanodeRegistration,
        transfer_protocol_version: u32,
    ) -> NetResult<DatanodeRegistration> {
        let request = WireRequest::Register {
            registration,
            transfer_protocol_version,
        };
        match self.connector.call(self.addr, &request).await? {
            WireResponse::Registration(registration) => Ok(registration),
            _ => Err(unexpected_response()),
        }
    }

    async fn error_report(
        &self,
        registration: &DatanodeRegistration,
        severity: ErrorSeverity,
        message: &str,
    ) -> NetResult<()> {
        let request = WireRequest::ErrorReport {
            registration: registration.clone(),
            severity,
            message: message.to_string(),
        };
        match self.connector.call(self.addr, &request).await? {
            WireResponse::Ack => Ok(()),
            _ => Err(unexpected_response()),
        }
    }
}

#[derive(Debug)]
struct TcpAdminProxy {
    addr: SocketAddr,
    connector: TcpConnector,
}

#[async_trait]
impl AdminProtocol for TcpAdminProxy {
    async fn primary_status(&self, registration: &DatanodeRegistration) -> NetResult<bool> {
        let request = WireRequest::PrimaryStatus {
            registration: registration.clone(),
        };
        match self.connector.call(self.addr, &request).await? {
            WireResponse::PrimaryStatus(primary) => Ok(primary),
            _ => Err(unexpected_response()),
        }
    }

    async fn sync_block(&self, block: Block) -> NetResult<Vec<String>> {
        match self
            .connector
            .call(self.addr, &WireRequest::SyncBlock { block })
            .await?
        {
            WireResponse::Locations(locations) => Ok(locations),
            _ => Err(unexpected_response()),
        }
    }
}
