//! weftrpc End-to-End Tests
//!
//! Server and client share one reactor on the test thread, the way an
//! application embedding both would run them.

use std::cell::Cell;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use weftrpc::common::transport::install_default_provider;
use weftrpc::{
    ClientConfig, ClientProtocol, Node, Reactor, RpcClient, RpcProtocol, RpcServer, ServerConfig,
    Service, WeftError,
};

fn calculator() -> Service {
    let mut service = Service::new();
    service.register_fn("add", |a: i64, b: i64| a + b);
    service.register_fn("mul", |a: f64, b: f64| a * b);
    service
}

fn tls_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    install_default_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (Arc::new(server), Arc::new(client))
}

fn call_async(reactor: &mut Reactor, client: &RpcClient, method: &str, params: &[Node]) -> weftrpc::Result<Node> {
    client.begin_call(reactor, method, params, None)?;
    client.wait(reactor, Some(Duration::from_secs(5)))?;
    client.end_call()
}

#[test]
fn test_add_over_binary() {
    let mut reactor = Reactor::new().unwrap();
    let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Binary, calculator());
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();
    let sum = call_async(&mut reactor, &client, "add", &[Node::from_value(2), Node::from_value(3)]).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 5);

    let product = call_async(&mut reactor, &client, "mul", &[Node::from_value(1.5), Node::from_value(4)]).unwrap();
    assert_eq!(product.get_value::<f64>().unwrap(), 6.0);
}

#[test]
fn test_add_over_json() {
    let mut reactor = Reactor::new().unwrap();
    let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Json, calculator());
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let client = RpcClient::new(addr, ClientProtocol::Json, ClientConfig::default()).unwrap();
    let sum = call_async(&mut reactor, &client, "add", &[Node::from_value(2), Node::from_value(3)]).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 5);
}

#[test]
fn test_tls_with_certificate_filter() {
    let (server_tls, client_tls) = tls_configs();
    let mut reactor = Reactor::new().unwrap();
    let checked = Rc::new(Cell::new(0));
    let seen = checked.clone();
    let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Binary, calculator())
        .with_tls(server_tls)
        .with_certificate_filter(move |chain| {
            seen.set(seen.get() + 1);
            // Clients present no certificate here.
            chain.is_empty()
        });
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let config = ClientConfig::new().with_tls(client_tls, "localhost");
    let client = RpcClient::new(addr, ClientProtocol::Binary, config).unwrap();
    let sum = call_async(&mut reactor, &client, "add", &[Node::from_value(20), Node::from_value(22)]).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 42);
    assert_eq!(checked.get(), 1);
}

#[test]
fn test_rejected_certificate_fails_call() {
    let (server_tls, client_tls) = tls_configs();
    let mut reactor = Reactor::new().unwrap();
    let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Binary, calculator())
        .with_tls(server_tls)
        .with_certificate_filter(|_| false);
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let config = ClientConfig::new().with_tls(client_tls, "localhost");
    let client = RpcClient::new(addr, ClientProtocol::Binary, config).unwrap();
    let err = call_async(&mut reactor, &client, "add", &[Node::from_value(1), Node::from_value(1)])
        .unwrap_err();
    assert!(err.is_transport(), "{:?}", err);
    assert!(!client.is_connected());
}

#[test]
fn test_idle_connection_times_out_once() {
    let mut reactor = Reactor::new().unwrap();
    let config = ServerConfig::default().with_read_timeout(Duration::from_millis(30));
    let mut server = RpcServer::new(config, RpcProtocol::Binary, calculator());
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let _idle = TcpStream::connect(addr).unwrap();
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert_eq!(server.timeout_count(), 1);
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_second_begin_call_leaves_first_intact() {
    let mut reactor = Reactor::new().unwrap();
    let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Binary, calculator());
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    client
        .begin_call(&mut reactor, "add", &[Node::from_value(2), Node::from_value(3)], None)
        .unwrap();
    let second = client.begin_call(&mut reactor, "add", &[Node::from_value(9), Node::from_value(9)], None);
    assert!(matches!(second, Err(WeftError::Logic(_))));

    client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(client.end_call().unwrap().get_value::<i64>().unwrap(), 5);
}
