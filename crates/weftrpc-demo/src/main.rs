//! # weftrpc Demo
//!
//! Serves a handful of arithmetic and string procedures, and calls
//! procedures on any weftrpc server.
//!
//! ## Usage
//!
//! ```bash
//! # JSON-RPC on /json and XML-RPC on /xml
//! weftrpc serve -b 127.0.0.1:8080
//!
//! # Binary envelopes directly on TCP
//! weftrpc serve -b 127.0.0.1:7003 --protocol binary
//!
//! # One call; the result is printed as JSON
//! weftrpc call 127.0.0.1:8080 add --params '[2, 3]'
//! weftrpc call 127.0.0.1:7003 echo -p binary --params '["hi"]'
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use weftrpc_client::{ClientConfig, ClientProtocol, RpcClient};
use weftrpc_common::codec::json::{JsonFormatter, JsonParser};
use weftrpc_common::codec::{from_bytes, to_bytes};
use weftrpc_common::{Category, Node, Reactor, WeftError};
use weftrpc_server::{
    HttpServer, JsonRpcService, RpcProtocol, RpcServer, ServerConfig, Service, XmlRpcService,
};

#[derive(FromArgs)]
/// weftrpc - reactor-driven RPC over binary, JSON-RPC and XML-RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo procedures
struct ServeArgs {
    /// address to bind (default 127.0.0.1:8080)
    #[argh(option, short = 'b', default = "\"127.0.0.1:8080\".into()")]
    bind: String,

    /// wire protocol: http, binary or json (default http)
    #[argh(option, short = 'p', default = "\"http\".into()")]
    protocol: String,

    /// seconds an idle connection is kept open
    #[argh(option, long = "keep-alive", default = "60")]
    keep_alive: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a procedure and print its result as JSON
struct CallArgs {
    /// server address, e.g. 127.0.0.1:8080
    #[argh(positional)]
    server: String,

    /// name of the procedure
    #[argh(positional)]
    method: String,

    /// wire protocol: json-http, xml-http, binary or json (default json-http)
    #[argh(option, short = 'p', default = "\"json-http\".into()")]
    protocol: String,

    /// HTTP path for the http protocols (default /json or /xml)
    #[argh(option)]
    path: Option<String>,

    /// parameters as a JSON array (default [])
    #[argh(option, default = "\"[]\".into()")]
    params: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "10000")]
    timeout_ms: u64,
}

fn demo_service() -> Service {
    let mut service = Service::new();
    service.register_fn("add", |a: i64, b: i64| a + b);
    service.register_fn("sub", |a: i64, b: i64| a - b);
    service.register_fn("div", |a: f64, b: f64| {
        if b == 0.0 {
            return Err(WeftError::remote(1, "division by zero"));
        }
        Ok(a / b)
    });
    service.register_fn("echo", |value: Node| value);
    service.register_fn("concat", |a: String, b: String| a + &b);
    service
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::new().with_keep_alive_timeout(Duration::from_secs(args.keep_alive));
    let mut reactor = Reactor::new()?;
    let service = demo_service();

    match args.protocol.as_str() {
        "http" => {
            let service = std::rc::Rc::new(service);
            let mut server = HttpServer::new(config);
            server.add_service("/json", JsonRpcService::shared(service.clone()));
            server.add_service("/xml", XmlRpcService::shared(service));
            let addr = server.listen(&mut reactor, args.bind.as_str())?;
            tracing::info!("JSON-RPC on http://{}/json, XML-RPC on http://{}/xml", addr, addr);
            reactor.run()?;
        }
        "binary" | "json" => {
            let protocol = if args.protocol == "binary" {
                RpcProtocol::Binary
            } else {
                RpcProtocol::Json
            };
            let mut server = RpcServer::new(config, protocol, service);
            let addr = server.listen(&mut reactor, args.bind.as_str())?;
            tracing::info!("{:?} RPC on {}", protocol, addr);
            reactor.run()?;
        }
        other => bail!("unknown protocol '{}'", other),
    }
    Ok(())
}

fn client_protocol(name: &str, path: Option<String>) -> Result<ClientProtocol> {
    Ok(match name {
        "json-http" => ClientProtocol::JsonHttp {
            path: path.unwrap_or_else(|| "/json".into()),
        },
        "xml-http" => ClientProtocol::XmlHttp {
            path: path.unwrap_or_else(|| "/xml".into()),
        },
        "binary" => ClientProtocol::Binary,
        "json" => ClientProtocol::Json,
        other => bail!("unknown protocol '{}'", other),
    })
}

fn call(args: CallArgs) -> Result<()> {
    let protocol = client_protocol(&args.protocol, args.path)?;
    let params = from_bytes(&mut JsonParser::new(), args.params.as_bytes())
        .context("--params must be valid JSON")?;
    if params.category() != Category::Array {
        bail!("--params must be a JSON array");
    }

    let config = ClientConfig::new().with_timeout(Duration::from_millis(args.timeout_ms));
    let client = RpcClient::new(args.server.as_str(), protocol, config)?;
    let result = client.call(&args.method, &params.into_members())?;

    let json = to_bytes(&mut JsonFormatter::new(), &result)?;
    println!("{}", String::from_utf8_lossy(&json));
    Ok(())
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::Call(args) => call(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_service_procedures() {
        let service = demo_service();
        let two = [Node::from_value(7), Node::from_value(2)];
        assert_eq!(service.call("add", &two).unwrap().get_value::<i64>().unwrap(), 9);
        assert_eq!(service.call("sub", &two).unwrap().get_value::<i64>().unwrap(), 5);
        let zero = [Node::from_value(1.0), Node::from_value(0.0)];
        assert!(matches!(service.call("div", &zero), Err(WeftError::Remote { code: 1, .. })));
    }

    #[test]
    fn test_client_protocol_names() {
        assert_eq!(
            client_protocol("xml-http", None).unwrap(),
            ClientProtocol::XmlHttp { path: "/xml".into() }
        );
        assert_eq!(
            client_protocol("json-http", Some("/rpc".into())).unwrap(),
            ClientProtocol::JsonHttp { path: "/rpc".into() }
        );
        assert_eq!(client_protocol("binary", None).unwrap(), ClientProtocol::Binary);
        assert!(client_protocol("carrier-pigeon", None).is_err());
    }
}
