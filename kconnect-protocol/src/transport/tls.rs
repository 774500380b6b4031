//! TLS Transport
//!
//! Establishes the encrypted stream for a device connection.
//!
//! KDE Connect swaps the usual TLS roles: the device that opened the TCP
//! connection sends its identity in plain text and then acts as the TLS
//! **server**; the device that accepted it reads that identity and acts as
//! the TLS **client**.
//!
//! ```text
//!   connecting side                 accepting side
//!   ---------------                 --------------
//!   TCP connect         ------->    accept
//!   identity + "\n"     ------->    read identity (bounded, 10 s)
//!   TLS server          <------>    TLS client
//! ```
//!
//! No identity is exchanged after TLS (protocol version 7).

use super::tls_config::TlsConfig;
use crate::discovery::{PORT_RANGE_END, PORT_RANGE_START};
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use rustls::pki_types::ServerName;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

/// Time allowed for the peer to send its identity line
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for TCP connect and the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest plain-text identity line accepted
pub const MAX_IDENTITY_SIZE: usize = 64 * 1024;

/// Encrypted device stream, in whichever TLS role we ended up
pub type TlsTransport = TlsStream<BufReader<TcpStream>>;

/// A device connection that completed the identity exchange and TLS
pub struct EstablishedConnection {
    pub stream: TlsTransport,
    pub remote_addr: SocketAddr,
    /// Identity of the peer
    pub identity: DeviceInfo,
    /// DER certificate the peer presented
    pub peer_certificate: Vec<u8>,
}

impl std::fmt::Debug for EstablishedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedConnection")
            .field("remote_addr", &self.remote_addr)
            .field("device_id", &self.identity.device_id)
            .finish_non_exhaustive()
    }
}

fn timed_out(what: &str, addr: SocketAddr) -> ProtocolError {
    ProtocolError::Timeout(format!("{} with {}", what, addr))
}

fn first_certificate<'a>(
    certificates: Option<&'a [rustls::pki_types::CertificateDer<'a>]>,
    addr: SocketAddr,
) -> Result<Vec<u8>> {
    certificates
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(format!("{} presented no certificate", addr))
        })
}

/// Open a connection to `peer`, whose identity we already know from
/// discovery
pub async fn connect(
    addr: SocketAddr,
    our_identity: &DeviceInfo,
    peer: DeviceInfo,
    tls: &TlsConfig,
) -> Result<EstablishedConnection> {
    info!("Connecting to {} at {}", peer.device_id, addr);

    let tcp_stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out("TCP connect", addr))?
        .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;
    tcp_stream.set_nodelay(true)?;

    let mut stream = BufReader::new(tcp_stream);
    let identity = our_identity.to_identity_packet().to_bytes()?;
    stream.write_all(&identity).await?;
    stream.flush().await?;

    debug!("Sent identity to {}, starting TLS as server", addr);

    let tls_stream = timeout(HANDSHAKE_TIMEOUT, tls.acceptor().accept(stream))
        .await
        .map_err(|_| timed_out("TLS handshake", addr))??;

    let peer_certificate = first_certificate(tls_stream.get_ref().1.peer_certificates(), addr)?;

    info!("TLS connection established to {} at {}", peer.device_id, addr);

    Ok(EstablishedConnection {
        stream: tls_stream.into(),
        remote_addr: addr,
        identity: peer,
        peer_certificate,
    })
}

/// Complete an accepted TCP connection: read the peer identity, then TLS
///
/// Connections announcing `own_device_id` are refused.
pub async fn accept(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    own_device_id: &str,
    tls: &TlsConfig,
) -> Result<EstablishedConnection> {
    tcp_stream.set_nodelay(true)?;
    let mut stream = BufReader::new(tcp_stream);

    let line = timeout(IDENTITY_TIMEOUT, read_identity_line(&mut stream))
        .await
        .map_err(|_| timed_out("Identity read", remote_addr))??;

    let identity = DeviceInfo::from_identity_packet(&Packet::from_bytes(&line)?)?;
    if identity.device_id == own_device_id {
        return Err(ProtocolError::InvalidPacket(
            "Connection from our own device id".to_string(),
        ));
    }

    debug!(
        "Received identity of {} from {}, starting TLS as client",
        identity.device_id, remote_addr
    );

    let server_name = ServerName::from(remote_addr.ip());
    let tls_stream = timeout(
        HANDSHAKE_TIMEOUT,
        tls.connector().connect(server_name, stream),
    )
    .await
    .map_err(|_| timed_out("TLS handshake", remote_addr))??;

    let peer_certificate =
        first_certificate(tls_stream.get_ref().1.peer_certificates(), remote_addr)?;

    info!(
        "TLS connection established with {} ({}) at {}",
        identity.device_name, identity.device_id, remote_addr
    );

    Ok(EstablishedConnection {
        stream: tls_stream.into(),
        remote_addr,
        identity,
        peer_certificate,
    })
}

/// Read one newline-terminated line of at most [`MAX_IDENTITY_SIZE`] bytes
///
/// Bytes after the newline stay buffered in `stream` for the TLS handshake.
async fn read_identity_line(stream: &mut BufReader<TcpStream>) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let read = (&mut *stream)
        .take(MAX_IDENTITY_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.last() == Some(&b'\n') {
        return Ok(line);
    }

    if read >= MAX_IDENTITY_SIZE {
        warn!("Identity line exceeds {} bytes", MAX_IDENTITY_SIZE);
        return Err(ProtocolError::PacketSizeExceeded(read, MAX_IDENTITY_SIZE));
    }

    Err(ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "Connection closed before identity packet",
    )))
}

/// TCP listener for incoming device connections
pub struct TlsListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TlsListener {
    /// Bind on `port`, falling back to the KDE Connect range when it is taken
    ///
    /// Port 0 binds an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => listener,
            Err(e) if port != 0 => {
                warn!("Port {} unavailable ({}), trying fallback range", port, e);
                Self::bind_in_range().await?
            }
            Err(e) => return Err(e.into()),
        };

        let local_addr = listener.local_addr()?;
        info!("Listening for device connections on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    async fn bind_in_range() -> Result<TcpListener> {
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                return Ok(listener);
            }
        }

        Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "All ports in range {}-{} are in use",
                PORT_RANGE_START, PORT_RANGE_END
            ),
        )))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next TCP connection; the handshake is left to [`accept`]
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CertificateInfo, DeviceType};

    fn identity(id: &str) -> DeviceInfo {
        DeviceInfo::with_id(id, id, DeviceType::Desktop, 1716)
    }

    #[test]
    fn test_first_certificate_from_borrowed_chain() {
        let addr: SocketAddr = "127.0.0.1:1716".parse().unwrap();
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x07];
        let chain = vec![
            rustls::pki_types::CertificateDer::from(der.as_slice()),
            rustls::pki_types::CertificateDer::from(&[0x30, 0x00][..]),
        ];

        assert_eq!(first_certificate(Some(chain.as_slice()), addr).unwrap(), der);
        assert!(matches!(
            first_certificate(Some(&chain[..0]), addr),
            Err(ProtocolError::CertificateValidation(_))
        ));
        assert!(first_certificate(None, addr).is_err());
    }

    #[tokio::test]
    async fn test_role_swapped_handshake() {
        let cert_a = CertificateInfo::generate("device_a").unwrap();
        let cert_b = CertificateInfo::generate("device_b").unwrap();
        let tls_a = TlsConfig::new(&cert_a).unwrap();
        let tls_b = TlsConfig::new(&cert_b).unwrap();

        let listener = TlsListener::bind(0).await.unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", listener.local_addr().port())
            .parse()
            .unwrap();

        let server = tokio::spawn(async move {
            let (tcp, remote) = listener.accept().await.unwrap();
            accept(tcp, remote, "device_b", &tls_b).await.unwrap()
        });

        let mut outgoing = connect(addr, &identity("device_a"), identity("device_b"), &tls_a)
            .await
            .unwrap();
        let mut incoming = server.await.unwrap();

        assert_eq!(incoming.identity.device_id, "device_a");
        assert_eq!(incoming.peer_certificate, cert_a.certificate);
        assert_eq!(outgoing.peer_certificate, cert_b.certificate);

        outgoing.stream.write_all(b"hello\n").await.unwrap();
        outgoing.stream.flush().await.unwrap();
        let mut buf = [0u8; 6];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_refuses_own_identity() {
        let cert = CertificateInfo::generate("device_a").unwrap();
        let tls = TlsConfig::new(&cert).unwrap();

        let listener = TlsListener::bind(0).await.unwrap();
        let port = listener.local_addr().port();

        let server = tokio::spawn(async move {
            let (tcp, remote) = listener.accept().await.unwrap();
            accept(tcp, remote, "device_a", &tls).await
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let line = identity("device_a").to_identity_packet().to_bytes().unwrap();
        client.write_all(&line).await.unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(ProtocolError::InvalidPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_before_identity() {
        let cert = CertificateInfo::generate("device_a").unwrap();
        let tls = TlsConfig::new(&cert).unwrap();

        let listener = TlsListener::bind(0).await.unwrap();
        let port = listener.local_addr().port();

        let server = tokio::spawn(async move {
            let (tcp, remote) = listener.accept().await.unwrap();
            accept(tcp, remote, "device_a", &tls).await
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"{\"id\":1").await.unwrap();
        drop(client);

        assert!(matches!(server.await.unwrap(), Err(ProtocolError::Io(_))));
    }
}
