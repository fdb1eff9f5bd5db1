//! Procedure registry shared by every RPC responder.
//!
//! A [`Service`] maps method names to [`Procedure`]s. Closures taking up to
//! four [`FromNode`] parameters register directly:
//!
//! ```
//! use weftrpc_server::Service;
//! use weftrpc_common::{Node, WeftError};
//!
//! let mut service = Service::new();
//! service.register_fn("add", |a: i64, b: i64| a + b);
//! service.register_fn("div", |a: i64, b: i64| {
//!     if b == 0 {
//!         return Err(WeftError::remote(1, "division by zero"));
//!     }
//!     Ok(a / b)
//! });
//!
//! let sum = service.call("add", &[Node::from_value(2), Node::from_value(3)]).unwrap();
//! assert_eq!(sum.get_value::<i64>().unwrap(), 5);
//! assert!(service.call("div", &[Node::from_value(1), Node::from_value(0)]).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use tracing::debug;
use weftrpc_common::protocol::jsonrpc;
use weftrpc_common::{FromNode, IntoRpcResult, Node, Result, RpcReply, RpcRequest, WeftError};

/// A callable registered under a method name.
pub trait Procedure {
    /// Number of parameters the procedure consumes.
    fn arity(&self) -> usize;

    /// Invokes the procedure. `params` may be shorter or longer than the
    /// arity; missing parameters read as `Void`.
    fn invoke(&self, params: &[Node]) -> Result<Node>;
}

/// Adapts a closure to a [`Procedure`]. `Args` is the parameter tuple.
pub struct FnProcedure<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

/// Closures usable as procedures.
pub trait IntoProcedure<Args> {
    fn into_procedure(self) -> Box<dyn Procedure>;
}

fn param<T: FromNode>(params: &[Node], index: usize) -> Result<T> {
    match params.get(index) {
        Some(node) => T::from_node(node),
        None => T::from_node(&Node::new()),
    }
}

macro_rules! impl_fn_procedure {
    ($arity:expr; $($arg:ident : $idx:tt),*) => {
        impl<F, R, $($arg,)*> Procedure for FnProcedure<F, ($($arg,)*)>
        where
            F: Fn($($arg),*) -> R,
            R: IntoRpcResult,
            $($arg: FromNode,)*
        {
            fn arity(&self) -> usize {
                $arity
            }

            #[allow(unused_variables)]
            fn invoke(&self, params: &[Node]) -> Result<Node> {
                (self.f)($(param::<$arg>(params, $idx)?),*).into_rpc_result()
            }
        }

        impl<F, R, $($arg,)*> IntoProcedure<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + 'static,
            R: IntoRpcResult + 'static,
            $($arg: FromNode + 'static,)*
        {
            fn into_procedure(self) -> Box<dyn Procedure> {
                Box::new(FnProcedure {
                    f: self,
                    _args: PhantomData::<fn(($($arg,)*))>,
                })
            }
        }
    };
}

impl_fn_procedure!(0;);
impl_fn_procedure!(1; A: 0);
impl_fn_procedure!(2; A: 0, B: 1);
impl_fn_procedure!(3; A: 0, B: 1, C: 2);
impl_fn_procedure!(4; A: 0, B: 1, C: 2, D: 3);

/// Name to procedure registry.
#[derive(Default)]
pub struct Service {
    procedures: HashMap<String, Box<dyn Procedure>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.procedures.keys().collect();
        names.sort();
        f.debug_struct("Service").field("procedures", &names).finish()
    }
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `procedure` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, procedure: Box<dyn Procedure>) {
        let name = name.into();
        debug!("registered procedure {} (arity {})", name, procedure.arity());
        self.procedures.insert(name, procedure);
    }

    /// Registers a closure of up to four typed parameters.
    pub fn register_fn<Args, F: IntoProcedure<Args>>(&mut self, name: impl Into<String>, f: F) {
        self.register(name, f.into_procedure());
    }

    pub fn procedure(&self, name: &str) -> Option<&dyn Procedure> {
        self.procedures.get(name).map(|p| p.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    /// Declared parameter count of `name`.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.procedures.get(name).map(|p| p.arity())
    }

    /// Invokes `name`. Unknown names fail with a method-not-found fault.
    pub fn call(&self, name: &str, params: &[Node]) -> Result<Node> {
        match self.procedures.get(name) {
            Some(procedure) => procedure.invoke(params),
            None => Err(WeftError::remote(
                jsonrpc::METHOD_NOT_FOUND,
                format!("method '{}' not found", name),
            )),
        }
    }

    /// Runs a decoded request and maps the outcome to a wire reply.
    pub fn dispatch(&self, request: &RpcRequest) -> RpcReply {
        debug!("dispatching {}", request.method);
        RpcReply::from(self.call(&request.method, &request.params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Service {
        let mut service = Service::new();
        service.register_fn("answer", || 42);
        service.register_fn("negate", |v: i64| -v);
        service.register_fn("concat", |a: String, b: String, c: String| format!("{}{}{}", a, b, c));
        service.register_fn("sum4", |a: i32, b: i32, c: i32, d: i32| a + b + c + d);
        service.register_fn("fail", |code: i32| -> Result<i32> {
            Err(WeftError::remote(code, "requested failure"))
        });
        service.register_fn("list", |items: Vec<i64>| items.len());
        service
    }

    #[test]
    fn test_arity() {
        let service = service();
        assert_eq!(service.arity("answer"), Some(0));
        assert_eq!(service.arity("concat"), Some(3));
        assert_eq!(service.arity("sum4"), Some(4));
        assert_eq!(service.arity("missing"), None);
    }

    #[test]
    fn test_missing_params_read_as_void() {
        let service = service();
        let result = service.call("concat", &[Node::from_value("a")]).unwrap();
        assert_eq!(result.get_value::<String>().unwrap(), "a");
        let result = service.call("negate", &[]).unwrap();
        assert_eq!(result.get_value::<i64>().unwrap(), 0);
    }

    #[test]
    fn test_extra_params_ignored() {
        let service = service();
        let params: Vec<Node> = (1..=6).map(Node::from_value).collect();
        let result = service.call("sum4", &params).unwrap();
        assert_eq!(result.get_value::<i32>().unwrap(), 10);
    }

    #[test]
    fn test_string_param_converts() {
        let service = service();
        let result = service.call("negate", &[Node::from_value(" 7 ")]).unwrap();
        assert_eq!(result.get_value::<i64>().unwrap(), -7);
    }

    #[test]
    fn test_dispatch_faults() {
        let service = service();
        let reply = service.dispatch(&RpcRequest::new("fail", vec![Node::from_value(9)]));
        assert_eq!(reply, RpcReply::fault(9, "requested failure"));

        let reply = service.dispatch(&RpcRequest::new("nope", vec![]));
        match reply {
            RpcReply::Fault { code, .. } => assert_eq!(code, jsonrpc::METHOD_NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }

        let reply = service.dispatch(&RpcRequest::new("negate", vec![Node::from_value("x")]));
        match reply {
            RpcReply::Fault { code, .. } => assert_eq!(code, jsonrpc::SERVER_ERROR),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sequence_param() {
        let service = service();
        let mut list = Node::array();
        list.push(Node::from_value(1));
        list.push(Node::from_value(2));
        let result = service.call("list", &[list]).unwrap();
        assert_eq!(result.get_value::<u64>().unwrap(), 2);
    }
}
