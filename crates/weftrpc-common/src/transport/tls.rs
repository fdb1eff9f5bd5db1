//! rustls session glue for [`ByteStream`](super::ByteStream)

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::protocol::error::{Result, WeftError};

/// Installs the ring crypto provider as the process default. Later calls are
/// no-ops.
pub fn install_default_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Client or server TLS session layered over a socket.
pub struct TlsSession {
    conn: Connection,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("server", &matches!(self.conn, Connection::Server(_)))
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsSession {
    /// Session for an accepted connection.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        Ok(TlsSession {
            conn: Connection::Server(ServerConnection::new(config)?),
        })
    }

    /// Session for an outgoing connection, verifying the peer as `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| WeftError::Transport(format!("invalid TLS server name '{}'", server_name)))?;
        Ok(TlsSession {
            conn: Connection::Client(ClientConnection::new(config, name)?),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Certificate chain presented by the peer, leaf first.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }

    /// Reads ciphertext from `socket` and processes it. Returns the number of
    /// ciphertext bytes read, zero on end of stream.
    pub(crate) fn read_tls(&mut self, socket: &mut impl Read) -> io::Result<usize> {
        let n = self.conn.read_tls(socket)?;
        self.conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(n)
    }

    /// Writes pending ciphertext to `socket` until it would block.
    pub(crate) fn write_tls(&mut self, socket: &mut impl Write) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(socket)?;
        }
        Ok(())
    }

    /// Moves decrypted plaintext into `out`. Returns the number of bytes
    /// moved; `Ok(0)` after the peer's close_notify.
    pub(crate) fn read_plain(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypts a prefix of `data` into the session's outgoing buffer.
    /// Returns how much was accepted; zero while the buffer is full.
    pub(crate) fn write_plain(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    pub(crate) fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

/// Unwraps a rustls error carried through an `io::Error`.
pub(crate) fn tls_error(err: io::Error) -> WeftError {
    if err.kind() == io::ErrorKind::InvalidData {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
            return WeftError::Tls(inner.clone());
        }
    }
    WeftError::Io(err)
}
