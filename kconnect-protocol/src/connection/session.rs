//! Session I/O loop

use super::events::ConnectionEvent;
use crate::codec::PacketCodec;
use crate::error::DecodeError;
use crate::Packet;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Commands that can be sent to a session task
#[derive(Debug)]
pub(super) enum SessionCommand {
    SendPacket(Packet),
    Close,
}

/// Why a session ended
#[derive(Debug)]
pub(super) enum SessionEnd {
    /// Closed on our side
    Closed,
    /// Peer closed or the stream failed
    Lost(String),
}

/// Run one device session until it is closed or the stream fails
///
/// Malformed frames are logged and skipped. Frames of unknown type are
/// still reported so the dispatcher can drop them.
pub(super) async fn run_session<S>(
    stream: S,
    device_id: String,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut incoming = FramedRead::new(reader, PacketCodec::new());
    let mut outgoing = FramedWrite::new(writer, PacketCodec::new());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::SendPacket(packet)) => {
                    debug!("Sending packet '{}' to {}", packet.packet_type, device_id);
                    if let Err(e) = outgoing.send(packet).await {
                        warn!("Failed to send packet to {}: {}", device_id, e);
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Some(SessionCommand::Close) | None => {
                    debug!("Closing session with {}", device_id);
                    if let Err(e) = outgoing.close().await {
                        debug!("Error closing stream to {}: {}", device_id, e);
                    }
                    return SessionEnd::Closed;
                }
            },

            frame = incoming.next() => match frame {
                Some(Ok(Ok(packet))) => {
                    debug!("Received packet '{}' from {}", packet.packet_type, device_id);
                    let _ = event_tx.send(ConnectionEvent::PacketReceived {
                        device_id: device_id.clone(),
                        packet,
                    });
                }
                Some(Ok(Err(DecodeError::UnknownType { packet }))) => {
                    debug!("Packet of unknown type '{}' from {}", packet.packet_type, device_id);
                    let _ = event_tx.send(ConnectionEvent::PacketReceived {
                        device_id: device_id.clone(),
                        packet: *packet,
                    });
                }
                Some(Ok(Err(e))) => {
                    warn!("Dropping undecodable frame from {}: {}", device_id, e);
                }
                Some(Err(e)) => {
                    warn!("Session with {} failed: {}", device_id, e);
                    return SessionEnd::Lost(e.to_string());
                }
                None => {
                    debug!("Peer {} closed the stream", device_id);
                    return SessionEnd::Lost("Connection closed by peer".to_string());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_session_skips_malformed_frames() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run_session(local, "dev1".to_string(), command_rx, event_tx));

        remote
            .write_all(b"not json\n{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .await
            .unwrap();
        remote
            .write_all(b"{\"id\":2,\"type\":\"vendor.custom\",\"body\":{}}\n")
            .await
            .unwrap();

        for expected in ["kdeconnect.ping", "vendor.custom"] {
            match event_rx.recv().await.unwrap() {
                ConnectionEvent::PacketReceived { packet, .. } => {
                    assert_eq!(packet.packet_type, expected)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        drop(remote);
        assert!(matches!(session.await.unwrap(), SessionEnd::Lost(_)));
    }

    #[tokio::test]
    async fn test_session_writes_commands() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run_session(local, "dev1".to_string(), command_rx, event_tx));

        command_tx
            .send(SessionCommand::SendPacket(Packet::with_id(
                7,
                "kdeconnect.ping",
                json!({}),
            )))
            .unwrap();
        command_tx.send(SessionCommand::Close).unwrap();

        assert!(matches!(session.await.unwrap(), SessionEnd::Closed));

        let mut written = String::new();
        remote.read_to_string(&mut written).await.unwrap();
        assert!(written.ends_with('\n'));
        assert_eq!(Packet::from_bytes(written.as_bytes()).unwrap().packet_type, "kdeconnect.ping");
    }
}
