//! Client Integration Tests
//!
//! Blocking calls run against a server reactor on its own thread. Reactor
//! driven calls share one reactor with the server, or talk to a listener
//! that never answers.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use weftrpc_client::{ClientConfig, ClientProtocol, RpcClient};
use weftrpc_common::protocol::jsonrpc;
use weftrpc_common::transport::install_default_provider;
use weftrpc_common::{ExitHandle, Node, Reactor, WeftError};
use weftrpc_server::{
    HttpServer, JsonRpcService, RpcProtocol, RpcServer, ServerConfig, Service, XmlRpcService,
};

fn test_service() -> Service {
    let mut service = Service::new();
    service.register_fn("add", |a: i64, b: i64| a + b);
    service.register_fn("math.add", |a: i64, b: i64| a + b);
    service.register_fn("echo", |text: String| text);
    service.register_fn("fail", || -> weftrpc_common::Result<i64> {
        Err(WeftError::remote(7, "boom"))
    });
    service.register_fn("sleep", |ms: u64| {
        thread::sleep(Duration::from_millis(ms));
        ms
    });
    service
}

fn params(values: &[i64]) -> Vec<Node> {
    values.iter().map(|v| Node::from_value(*v)).collect()
}

#[derive(Clone, Copy)]
enum Endpoint {
    Raw(RpcProtocol),
    /// JSON-RPC on `/json`, XML-RPC on `/xml`.
    Http,
}

/// Server reactor running on a background thread until dropped.
struct ServerThread {
    addr: SocketAddr,
    exit: ExitHandle,
    thread: Option<JoinHandle<()>>,
}

impl ServerThread {
    fn spawn(endpoint: Endpoint, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let mut reactor = Reactor::new().unwrap();
            let service = Rc::new(test_service());
            let mut http = None;
            let mut raw = None;
            let addr = match endpoint {
                Endpoint::Raw(protocol) => {
                    let mut server =
                        RpcServer::with_shared_service(ServerConfig::default(), protocol, service);
                    if let Some(tls) = tls {
                        server = server.with_tls(tls);
                    }
                    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();
                    raw = Some(server);
                    addr
                }
                Endpoint::Http => {
                    let mut server = HttpServer::new(ServerConfig::default());
                    if let Some(tls) = tls {
                        server = server.with_tls(tls);
                    }
                    server.add_service("/json", JsonRpcService::shared(service.clone()));
                    server.add_service("/xml", XmlRpcService::shared(service));
                    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();
                    http = Some(server);
                    addr
                }
            };
            tx.send((addr, reactor.exit_handle())).unwrap();
            reactor.run().unwrap();
            drop((http, raw));
        });
        let (addr, exit) = rx.recv().unwrap();
        ServerThread {
            addr,
            exit,
            thread: Some(thread),
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        self.exit.exit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
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

/// Pumps `reactor` until `done` holds.
fn run_until(reactor: &mut Reactor, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "reactor made no progress");
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

// ============================================================================
// Blocking calls
// ============================================================================

#[test]
fn test_binary_call_reuses_connection() {
    let server = ServerThread::spawn(Endpoint::Raw(RpcProtocol::Binary), None);
    let client = RpcClient::new(server.addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    let sum = client.call("add", &params(&[2, 3])).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 5);
    assert!(client.is_connected());

    let sum = client.call("add", &params(&[40, 2])).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 42);
}

#[test]
fn test_json_call_with_method_prefix() {
    let server = ServerThread::spawn(Endpoint::Raw(RpcProtocol::Json), None);
    let config = ClientConfig::new().with_prefix("math.");
    let client = RpcClient::new(server.addr, ClientProtocol::Json, config).unwrap();

    for (a, b) in [(1, 2), (10, 20), (-4, 4)] {
        let sum = client.call("add", &params(&[a, b])).unwrap();
        assert_eq!(sum.get_value::<i64>().unwrap(), a + b);
    }
}

#[test]
fn test_http_protocols() {
    let server = ServerThread::spawn(Endpoint::Http, None);

    let json = RpcClient::new(
        server.addr,
        ClientProtocol::JsonHttp { path: "/json".into() },
        ClientConfig::default(),
    )
    .unwrap();
    let sum = json.call("add", &params(&[2, 3])).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 5);
    assert!(json.is_connected());

    let xml = RpcClient::new(
        server.addr,
        ClientProtocol::XmlHttp { path: "/xml".into() },
        ClientConfig::default(),
    )
    .unwrap();
    let echoed = xml.call("echo", &[Node::from_value("a < b & c")]).unwrap();
    assert_eq!(echoed.get_value::<String>().unwrap(), "a < b & c");
}

#[test]
fn test_remote_fault_keeps_connection() {
    let server = ServerThread::spawn(Endpoint::Raw(RpcProtocol::Binary), None);
    let client = RpcClient::new(server.addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    match client.call("fail", &[]) {
        Err(WeftError::Remote { code, message }) => {
            assert_eq!(code, 7);
            assert_eq!(message, "boom");
        }
        other => panic!("expected remote fault, got {:?}", other),
    }
    assert!(client.is_connected());
    assert_eq!(client.call("add", &params(&[1, 1])).unwrap().get_value::<i64>().unwrap(), 2);
}

#[test]
fn test_unknown_method_over_json_http() {
    let server = ServerThread::spawn(Endpoint::Http, None);
    let client = RpcClient::new(
        server.addr,
        ClientProtocol::JsonHttp { path: "/json".into() },
        ClientConfig::default(),
    )
    .unwrap();

    match client.call("nope", &[]) {
        Err(WeftError::Remote { code, .. }) => assert_eq!(code, jsonrpc::METHOD_NOT_FOUND),
        other => panic!("expected remote fault, got {:?}", other),
    }
}

#[test]
fn test_wrong_http_path_is_protocol_error() {
    let server = ServerThread::spawn(Endpoint::Http, None);
    let client = RpcClient::new(
        server.addr,
        ClientProtocol::JsonHttp { path: "/missing".into() },
        ClientConfig::default(),
    )
    .unwrap();

    let err = client.call("add", &params(&[1, 2])).unwrap_err();
    assert!(matches!(err, WeftError::Protocol(ref m) if m.contains("404")), "{:?}", err);
    assert!(!client.is_connected());
}

#[test]
fn test_timeout_drops_connection_and_recovers() {
    let server = ServerThread::spawn(Endpoint::Raw(RpcProtocol::Binary), None);
    let config = ClientConfig::new().with_timeout(Duration::from_millis(100));
    let client = RpcClient::new(server.addr, ClientProtocol::Binary, config).unwrap();

    let err = client.call("sleep", &[Node::from_value(250u64)]).unwrap_err();
    assert!(matches!(err, WeftError::Timeout(_)), "{:?}", err);
    assert!(!client.is_connected());

    // The server reactor is busy until the sleeping procedure returns.
    thread::sleep(Duration::from_millis(500));
    let sum = client.call("add", &params(&[2, 3])).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 5);
}

#[test]
fn test_close_then_reconnect() {
    let server = ServerThread::spawn(Endpoint::Raw(RpcProtocol::Binary), None);
    let client = RpcClient::new(server.addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();
    client.call("add", &params(&[1, 2])).unwrap();

    client.close().unwrap();
    assert!(!client.is_connected());
    let sum = client.call("add", &params(&[3, 4])).unwrap();
    assert_eq!(sum.get_value::<i64>().unwrap(), 7);
}

#[test]
fn test_connection_refused_is_transport_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();
    let err = client.call("add", &params(&[1, 2])).unwrap_err();
    assert!(err.is_transport(), "{:?}", err);
}

#[test]
fn test_tls_calls() {
    let (server_tls, client_tls) = tls_configs();
    let server = ServerThread::spawn(Endpoint::Http, Some(server_tls));
    let config = ClientConfig::new().with_tls(client_tls, "localhost");
    let client = RpcClient::new(
        server.addr,
        ClientProtocol::JsonHttp { path: "/json".into() },
        config,
    )
    .unwrap();

    for n in 0..3 {
        let sum = client.call("add", &params(&[n, 1])).unwrap();
        assert_eq!(sum.get_value::<i64>().unwrap(), n + 1);
    }
}

#[test]
fn test_invalid_config_rejected() {
    let config = ClientConfig::new().with_timeout(Duration::ZERO);
    let err = RpcClient::new("127.0.0.1:1", ClientProtocol::Binary, config).unwrap_err();
    assert!(matches!(err, WeftError::Logic(_)));
}

// ============================================================================
// Reactor-driven calls
// ============================================================================

fn local_server(reactor: &mut Reactor, protocol: RpcProtocol) -> (RpcServer, SocketAddr) {
    let mut server = RpcServer::new(ServerConfig::default(), protocol, test_service());
    let addr = server.listen(reactor, "127.0.0.1:0").unwrap();
    (server, addr)
}

#[test]
fn test_async_call_with_callback() {
    let mut reactor = Reactor::new().unwrap();
    let (_server, addr) = local_server(&mut reactor, RpcProtocol::Binary);
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    let outcome: Rc<RefCell<Option<i64>>> = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    client
        .begin_call(
            &mut reactor,
            "add",
            &params(&[2, 3]),
            Some(Box::new(move |result| {
                *slot.borrow_mut() = Some(result.unwrap().get_value().unwrap());
            })),
        )
        .unwrap();
    assert!(client.is_pending());

    run_until(&mut reactor, || outcome.borrow().is_some());
    assert_eq!(*outcome.borrow(), Some(5));
    assert!(!client.is_pending());
    assert!(client.is_connected());
}

#[test]
fn test_overlapping_async_calls_rejected() {
    let mut reactor = Reactor::new().unwrap();
    let (_server, addr) = local_server(&mut reactor, RpcProtocol::Json);
    let client = RpcClient::new(addr, ClientProtocol::Json, ClientConfig::default()).unwrap();

    client.begin_call(&mut reactor, "add", &params(&[2, 3]), None).unwrap();
    let err = client.begin_call(&mut reactor, "add", &params(&[1, 1]), None).unwrap_err();
    assert!(matches!(err, WeftError::Logic(_)));
    assert!(matches!(client.call("add", &[]), Err(WeftError::Logic(_))));
    assert!(matches!(client.end_call(), Err(WeftError::Logic(_))));

    client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(client.end_call().unwrap().get_value::<i64>().unwrap(), 5);
    assert!(matches!(client.end_call(), Err(WeftError::Logic(_))));
}

#[test]
fn test_async_calls_in_sequence_reuse_connection() {
    let mut reactor = Reactor::new().unwrap();
    let (server, addr) = local_server(&mut reactor, RpcProtocol::Binary);
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    for n in 1..=3 {
        client.begin_call(&mut reactor, "add", &params(&[n, n]), None).unwrap();
        client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.end_call().unwrap().get_value::<i64>().unwrap(), 2 * n);
    }
    assert_eq!(server.active_connections(), 1);
}

#[test]
fn test_async_remote_fault_reported_by_wait() {
    let mut reactor = Reactor::new().unwrap();
    let (_server, addr) = local_server(&mut reactor, RpcProtocol::Binary);
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    client.begin_call(&mut reactor, "fail", &[], None).unwrap();
    let err = client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, WeftError::Remote { code: 7, .. }));
}

#[test]
fn test_async_start_failure_goes_to_callback() {
    let mut reactor = Reactor::new().unwrap();
    let (_, client_tls) = tls_configs();
    let config = ClientConfig::new().with_tls(client_tls, "not a host name!");
    let client = RpcClient::new("127.0.0.1:1", ClientProtocol::Binary, config).unwrap();

    let outcome: Rc<RefCell<Option<WeftError>>> = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    client
        .begin_call(
            &mut reactor,
            "add",
            &params(&[1, 2]),
            Some(Box::new(move |result| {
                *slot.borrow_mut() = result.err();
            })),
        )
        .unwrap();
    let err = outcome.borrow_mut().take().expect("callback ran");
    assert!(err.is_transport(), "{:?}", err);
    assert!(!client.is_pending());
    assert!(!client.is_connected());
}

#[test]
fn test_async_connection_refused_reported_by_wait() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut reactor = Reactor::new().unwrap();
    let client = RpcClient::new(addr, ClientProtocol::Binary, ClientConfig::default()).unwrap();

    // Refusal may surface at connect time or on the first readiness.
    client.begin_call(&mut reactor, "add", &params(&[1, 2]), None).unwrap();
    let err = client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap_err();
    assert!(err.is_transport(), "{:?}", err);
    assert!(!client.is_connected());

    client.begin_call(&mut reactor, "add", &params(&[1, 2]), None).unwrap();
    client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap_err();
    assert!(client.end_call().is_err());
}

#[test]
fn test_async_timeout_against_silent_peer() {
    // Connections complete in the backlog but nobody ever answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new().unwrap();
    let config = ClientConfig::new().with_timeout(Duration::from_millis(50));
    let client = RpcClient::new(addr, ClientProtocol::Binary, config).unwrap();

    let timed_out = Rc::new(RefCell::new(false));
    let flag = timed_out.clone();
    client
        .begin_call(
            &mut reactor,
            "add",
            &params(&[1, 2]),
            Some(Box::new(move |result| {
                *flag.borrow_mut() = matches!(result, Err(WeftError::Timeout(_)));
            })),
        )
        .unwrap();

    run_until(&mut reactor, || !client.is_pending());
    assert!(*timed_out.borrow());
    assert!(!client.is_connected());
    assert_eq!(reactor.source_count(), 0);
}

#[test]
fn test_wait_timeout_leaves_call_pending_until_cancel() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut reactor = Reactor::new().unwrap();
    let client =
        RpcClient::new(listener.local_addr().unwrap(), ClientProtocol::Binary, ClientConfig::default())
            .unwrap();

    let invoked = Rc::new(RefCell::new(false));
    let flag = invoked.clone();
    client
        .begin_call(
            &mut reactor,
            "add",
            &params(&[1, 2]),
            Some(Box::new(move |_| *flag.borrow_mut() = true)),
        )
        .unwrap();

    let err = client.wait(&mut reactor, Some(Duration::from_millis(30))).unwrap_err();
    assert!(matches!(err, WeftError::Timeout(_)));
    assert!(client.is_pending());

    client.cancel(&mut reactor);
    assert!(!client.is_pending());
    assert!(!client.is_connected());
    assert_eq!(reactor.source_count(), 0);
    for _ in 0..5 {
        reactor.run_once(Some(Duration::from_millis(5))).unwrap();
    }
    assert!(!*invoked.borrow());
}

#[test]
fn test_async_http_call() {
    let mut reactor = Reactor::new().unwrap();
    let mut server = HttpServer::new(ServerConfig::default());
    server.add_service("/xml", XmlRpcService::new(test_service()));
    let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();

    let client = RpcClient::new(
        addr,
        ClientProtocol::XmlHttp { path: "/xml".into() },
        ClientConfig::default(),
    )
    .unwrap();
    client
        .begin_call(&mut reactor, "echo", &[Node::from_value("weft")], None)
        .unwrap();
    client.wait(&mut reactor, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(client.end_call().unwrap().get_value::<String>().unwrap(), "weft");
}
