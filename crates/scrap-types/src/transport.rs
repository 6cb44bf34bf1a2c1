//! JSON-datagram helpers over UDP.
//!
//! Every protocol message is a single UTF-8 JSON object per datagram.
//! Transport is best-effort: no retries, no acknowledgements; liveness is the
//! caller's concern.

use serde::Serialize;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Maximum datagram we will receive.
pub const MAX_DATAGRAM: usize = 65535;

/// Serializes `message` and sends it to `target` as one datagram.
pub async fn send_message<T: Serialize>(
    socket: &UdpSocket,
    target: SocketAddr,
    message: &T,
) -> io::Result<()> {
    let payload = serde_json::to_vec(message)?;
    socket.send_to(&payload, target).await?;
    Ok(())
}

/// Waits up to `wait` for one datagram and decodes it as JSON.
///
/// Returns `Ok(None)` on timeout. Decode failures are an error carrying the
/// source address so the caller can log and drop.
pub async fn recv_message(
    socket: &UdpSocket,
    wait: Duration,
) -> io::Result<Option<(Value, SocketAddr)>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let received = tokio::time::timeout(wait, socket.recv_from(&mut buf)).await;
    match received {
        Err(_) => Ok(None),
        Ok(result) => {
            let (len, addr) = result?;
            let value = serde_json::from_slice(&buf[..len]).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid json from {addr}: {err}"),
                )
            })?;
            Ok(Some((value, addr)))
        }
    }
}
