//! Payload Transfer
//!
//! Packets that carry a payload (shared files, album art) advertise a
//! `payloadSize` and a `payloadTransferInfo.port`. The bytes travel on a
//! separate TLS connection:
//!
//! 1. Sender binds a TCP port in 1739-1764 and sends the packet with that port
//! 2. Receiver connects to the sender's IP and that port
//! 3. The sender is the TLS server, the receiver the TLS client
//! 4. Exactly `payloadSize` bytes are streamed, then the connection closes

use super::tls_config::TlsConfig;
use crate::{ProtocolError, Result};
use rustls::pki_types::ServerName;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Time the receiver has to connect, and the sender to answer
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Port range for payload servers
pub const PAYLOAD_PORT_RANGE_START: u16 = 1739;
pub const PAYLOAD_PORT_RANGE_END: u16 = 1764;

/// Metadata of a file about to be shared
#[derive(Debug, Clone)]
pub struct FileTransferInfo {
    pub filename: String,
    pub size: u64,
    /// Creation time (UNIX milliseconds)
    pub creation_time: Option<i64>,
    /// Last modified time (UNIX milliseconds)
    pub last_modified: Option<i64>,
}

impl FileTransferInfo {
    /// Read metadata of the file at `path`
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProtocolError::InvalidPacket("Invalid filename".to_string()))?
            .to_string();

        let millis = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
        };

        Ok(Self {
            filename,
            size: metadata.len(),
            creation_time: millis(metadata.created()),
            last_modified: millis(metadata.modified()),
        })
    }
}

/// Serves one payload to one receiver
pub struct PayloadServer {
    listener: TcpListener,
    port: u16,
    tls: TlsConfig,
}

impl PayloadServer {
    /// Bind the first free port in the payload range
    pub async fn bind(tls: &TlsConfig) -> Result<Self> {
        for port in PAYLOAD_PORT_RANGE_START..=PAYLOAD_PORT_RANGE_END {
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                debug!("Payload server listening on port {}", port);
                return Ok(Self {
                    listener,
                    port,
                    tls: tls.clone(),
                });
            }
        }

        Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "All payload ports {}-{} are in use",
                PAYLOAD_PORT_RANGE_START, PAYLOAD_PORT_RANGE_END
            ),
        )))
    }

    /// Port to advertise in `payloadTransferInfo`
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one receiver and stream `size` bytes of `source` to it
    pub async fn serve<R>(self, source: R, size: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (tcp_stream, remote_addr) = timeout(CONNECTION_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| ProtocolError::Timeout("No receiver connected for payload".to_string()))??;

        debug!("Payload receiver connected from {}", remote_addr);

        let mut stream = timeout(CONNECTION_TIMEOUT, self.tls.acceptor().accept(tcp_stream))
            .await
            .map_err(|_| ProtocolError::Timeout("Payload TLS handshake".to_string()))??;

        let sent = tokio::io::copy(&mut source.take(size), &mut stream).await?;
        stream.shutdown().await?;

        if sent != size {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("Payload source ended after {} of {} bytes", sent, size),
            )));
        }

        info!("Payload of {} bytes sent to {}", sent, remote_addr);
        Ok(sent)
    }

    /// Accept one receiver and stream the file at `path` to it
    pub async fn serve_file(self, path: impl AsRef<Path>) -> Result<u64> {
        let file = File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        self.serve(file, size).await
    }
}

/// Fetches a payload advertised by a peer
pub struct PayloadClient;

impl PayloadClient {
    /// Connect to the peer's payload port and copy exactly `size` bytes into
    /// `sink`
    pub async fn fetch<W>(addr: SocketAddr, size: u64, tls: &TlsConfig, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        info!("Fetching payload of {} bytes from {}", size, addr);

        let tcp_stream = timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("Payload connect to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "payload connect"))?;

        let mut stream = timeout(
            CONNECTION_TIMEOUT,
            tls.connector().connect(ServerName::from(addr.ip()), tcp_stream),
        )
        .await
        .map_err(|_| ProtocolError::Timeout("Payload TLS handshake".to_string()))??;

        let received = tokio::io::copy(&mut (&mut stream).take(size), sink).await?;
        sink.flush().await?;

        if received != size {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "Connection closed prematurely: received {} bytes, expected {}",
                    received, size
                ),
            )));
        }

        debug!("Payload of {} bytes received from {}", received, addr);
        Ok(received)
    }

    /// Fetch a payload into memory
    pub async fn fetch_to_vec(addr: SocketAddr, size: u64, tls: &TlsConfig) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size.min(16 * 1024 * 1024) as usize);
        Self::fetch(addr, size, tls, &mut data).await?;
        Ok(data)
    }

    /// Fetch a payload into a new file, removing it again if the transfer
    /// fails
    pub async fn fetch_to_file(
        addr: SocketAddr,
        size: u64,
        tls: &TlsConfig,
        path: impl AsRef<Path>,
    ) -> Result<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(path).await?;
        let result = Self::fetch(addr, size, tls, &mut file).await;

        if result.is_err() {
            warn!("Transfer failed, removing partial file {:?}", path);
            drop(file);
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!("Could not remove partial file {:?}: {}", path, e);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateInfo;
    use tempfile::TempDir;

    fn tls(id: &str) -> TlsConfig {
        TlsConfig::new(&CertificateInfo::generate(id).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let server = PayloadServer::bind(&tls("sender")).await.unwrap();
        let port = server.port();
        assert!((PAYLOAD_PORT_RANGE_START..=PAYLOAD_PORT_RANGE_END).contains(&port));

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let size = data.len() as u64;
        let sender = tokio::spawn(async move { server.serve(&data[..], size).await });

        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let received = PayloadClient::fetch_to_vec(addr, size, &tls("receiver"))
            .await
            .unwrap();

        assert_eq!(received, expected);
        assert_eq!(sender.await.unwrap().unwrap(), size);
    }

    #[tokio::test]
    async fn test_short_payload_removes_partial_file() {
        let server = PayloadServer::bind(&tls("sender")).await.unwrap();
        let port = server.port();
        // advertise more than the source holds
        let sender = tokio::spawn(async move { server.serve(&b"short"[..], 5).await });

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.bin");
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let result = PayloadClient::fetch_to_file(addr, 50, &tls("receiver"), &path).await;
        assert!(result.is_err());
        assert!(!path.exists());
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_file_transfer_info_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        std::fs::write(&path, b"test content").unwrap();

        let info = FileTransferInfo::from_path(&path).await.unwrap();
        assert_eq!(info.filename, "notes.txt");
        assert_eq!(info.size, 12);
        assert!(info.last_modified.is_some());
    }
}
