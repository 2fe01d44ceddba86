//! Tagged, optionally encrypted transport for consensus peer traffic.
//!
//! Consensus and application traffic can share one listening port: every
//! consensus connection opens by writing a single identification byte, and
//! an outer first-byte multiplexer (out of scope here) routes matching
//! connections to this layer's listener. `accept` re-verifies the byte, so
//! a stray connection fails loudly at establishment instead of corrupting
//! the message stream.
//!
//! When TLS configurations are present, connections are upgraded right
//! after the tag byte. The handshake is driven eagerly so that mismatched
//! peer material or a stalled peer surfaces as a connection-establishment
//! error, bounded by the socket timeout.
//!
//! Peer messages are framed as a `u32` big-endian length prefix followed
//! by the protobuf-encoded message.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::error::StoreError;

/// First byte of every consensus connection.
pub const CONSENSUS_RPC_TAG: u8 = 1;

/// A consensus connection, plain or TLS-wrapped.
#[derive(Debug)]
pub enum StreamConn {
    Plain(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for StreamConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamConn::Plain(conn) => conn.read(buf),
            StreamConn::TlsClient(conn) => conn.read(buf),
            StreamConn::TlsServer(conn) => conn.read(buf),
        }
    }
}

impl Write for StreamConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamConn::Plain(conn) => conn.write(buf),
            StreamConn::TlsClient(conn) => conn.write(buf),
            StreamConn::TlsServer(conn) => conn.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamConn::Plain(conn) => conn.flush(),
            StreamConn::TlsClient(conn) => conn.flush(),
            StreamConn::TlsServer(conn) => conn.flush(),
        }
    }
}

/// The consensus transport endpoint: dials peers and accepts their
/// connections over a dedicated (or demultiplexed) listener.
pub struct StreamLayer {
    listener: TcpListener,
    server_tls: Option<Arc<rustls::ServerConfig>>,
    peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl StreamLayer {
    /// TLS configurations arrive pre-validated; certificate loading is the
    /// embedding application's concern.
    pub fn new(
        listener: TcpListener,
        server_tls: Option<Arc<rustls::ServerConfig>>,
        peer_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            listener,
            server_tls,
            peer_tls,
        }
    }

    /// Opens a connection to a peer: TCP connect bounded by `timeout`,
    /// write the identification byte, then upgrade to TLS when peer
    /// material is configured.
    pub fn dial(&self, addr: &str, timeout: Duration) -> Result<StreamConn, StoreError> {
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|err| StoreError::Transport(format!("resolve {addr}: {err}")))?
            .next()
            .ok_or_else(|| StoreError::Transport(format!("no address for {addr}")))?;

        let mut conn = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(|err| StoreError::Transport(format!("connect {addr}: {err}")))?;
        conn.set_read_timeout(Some(timeout))
            .and_then(|_| conn.set_write_timeout(Some(timeout)))
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        conn.write_all(&[CONSENSUS_RPC_TAG])
            .map_err(|err| StoreError::Transport(format!("tag byte to {addr}: {err}")))?;

        let Some(config) = &self.peer_tls else {
            return Ok(StreamConn::Plain(conn));
        };

        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| StoreError::Transport(format!("server name {host}: {err}")))?;
        let mut tls = ClientConnection::new(Arc::clone(config), server_name)
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        while tls.is_handshaking() {
            tls.complete_io(&mut conn)
                .map_err(|err| StoreError::Transport(format!("tls handshake with {addr}: {err}")))?;
        }
        Ok(StreamConn::TlsClient(Box::new(StreamOwned::new(tls, conn))))
    }

    /// Accepts an inbound consensus connection, verifying the
    /// identification byte before optionally upgrading to TLS. A mismatch
    /// means the connection was routed here in error and is rejected.
    pub fn accept(&self) -> Result<StreamConn, StoreError> {
        let (mut conn, peer) = self
            .listener
            .accept()
            .map_err(|err| StoreError::Transport(format!("accept: {err}")))?;

        let mut tag = [0u8; 1];
        conn.read_exact(&mut tag)
            .map_err(|err| StoreError::Transport(format!("tag byte from {peer}: {err}")))?;
        if tag[0] != CONSENSUS_RPC_TAG {
            return Err(StoreError::Transport(format!(
                "connection from {peer} is not consensus traffic (tag {:#04x})",
                tag[0]
            )));
        }

        let Some(config) = &self.server_tls else {
            return Ok(StreamConn::Plain(conn));
        };

        let mut tls = ServerConnection::new(Arc::clone(config))
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        while tls.is_handshaking() {
            tls.complete_io(&mut conn)
                .map_err(|err| StoreError::Transport(format!("tls handshake with {peer}: {err}")))?;
        }
        Ok(StreamConn::TlsServer(Box::new(StreamOwned::new(tls, conn))))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(conn: &mut W, payload: &[u8]) -> io::Result<()> {
    conn.write_all(&(payload.len() as u32).to_be_bytes())?;
    conn.write_all(payload)?;
    conn.flush()
}

/// Reads one length-prefixed frame; `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(conn: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match conn.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn plain_layer() -> (StreamLayer, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (StreamLayer::new(listener, None, None), addr)
    }

    #[test]
    fn test_dial_and_accept_roundtrip() {
        let (layer, addr) = plain_layer();

        let dialer = thread::spawn(move || {
            let layer = StreamLayer::new(TcpListener::bind("127.0.0.1:0").unwrap(), None, None);
            let mut conn = layer.dial(&addr, Duration::from_secs(1)).unwrap();
            write_frame(&mut conn, b"ping").unwrap();
        });

        let mut conn = layer.accept().unwrap();
        let frame = read_frame(&mut conn).unwrap().unwrap();
        assert_eq!(frame, b"ping");
        assert!(read_frame(&mut conn).unwrap().is_none());
        dialer.join().unwrap();
    }

    #[test]
    fn test_accept_rejects_wrong_tag() {
        let (layer, addr) = plain_layer();

        let rogue = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            conn.write_all(&[0x7f]).unwrap();
        });

        let err = layer.accept().unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
        rogue.join().unwrap();
    }

    #[test]
    fn test_dial_unreachable_address() {
        let (layer, _) = plain_layer();
        // Port 1 on localhost is almost certainly closed.
        let err = layer.dial("127.0.0.1:1", Duration::from_millis(200));
        assert!(matches!(err, Err(StoreError::Transport(_))));
    }

    #[test]
    fn test_frame_roundtrip_empty_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}
