//! TLS transport tests
//!
//! Both ends run in one thread: the handshake is driven step by step on two
//! nonblocking streams.

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};

    fn tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        install_default_provider();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (Arc::new(server), Arc::new(client))
    }

    fn tls_pair() -> (ByteStream, ByteStream) {
        let (server_config, client_config) = tls_configs();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client =
            ByteStream::connect(&listener.local_addr().unwrap(), Duration::from_secs(5)).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut server = ByteStream::new(accepted).unwrap();

        client.set_tls(TlsSession::client(client_config, "localhost").unwrap());
        server.set_tls(TlsSession::server(server_config).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut client_done, mut server_done) = (false, false);
        while !(client_done && server_done) {
            assert!(Instant::now() < deadline, "handshake stalled");
            client_done = client.handshake_step().unwrap();
            server_done = server.handshake_step().unwrap();
        }
        (client, server)
    }

    #[test]
    fn test_tls_handshake_and_echo() {
        let (mut client, mut server) = tls_pair();
        assert!(server.tls().unwrap().peer_certificates().is_none());
        assert_eq!(client.tls().unwrap().peer_certificates().unwrap().len(), 1);

        client.output_mut().extend_from_slice(b"secret");
        client.flush_blocking(Duration::from_secs(5)).unwrap();
        while server.input().len() < 6 {
            server.read_blocking(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(server.input(), b"secret");

        server.output_mut().extend_from_slice(b"reply");
        server.flush_blocking(Duration::from_secs(5)).unwrap();
        while client.input().len() < 5 {
            client.read_blocking(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(client.input(), b"reply");
    }

    #[test]
    fn test_tls_close_notify_is_eof() {
        let (mut client, mut server) = tls_pair();
        client.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.at_eof() {
            assert!(Instant::now() < deadline);
            server.read_blocking(Duration::from_secs(5)).unwrap();
        }
        assert!(server.input().is_empty());
    }

    #[test]
    fn test_tls_rejects_wrong_name() {
        let (server_config, client_config) = tls_configs();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client =
            ByteStream::connect(&listener.local_addr().unwrap(), Duration::from_secs(5)).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut server = ByteStream::new(accepted).unwrap();
        client.set_tls(TlsSession::client(client_config, "example.com").unwrap());
        server.set_tls(TlsSession::server(server_config).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        let failed = loop {
            assert!(Instant::now() < deadline, "handshake stalled");
            if let Err(e) = client.handshake_step() {
                break e;
            }
            // The server fails too once the client's alert arrives.
            let _ = server.handshake_step();
        };
        assert!(failed.is_transport());
    }
}
