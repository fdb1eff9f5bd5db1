//! JSON-RPC 2.0 over HTTP
//!
//! Requests are `POST`ed with a single JSON-RPC request object as the body.
//! Replies always carry status 200 and an `application/json` body; protocol
//! errors (parse errors, invalid requests, unknown methods) travel inside
//! the JSON-RPC error object. A notification (no `id`) is answered with
//! `204 No Content`.

use std::rc::Rc;

use tracing::{debug, warn};
use weftrpc_common::codec::json::{JsonFormatter, JsonParser};
use weftrpc_common::codec::Formatter;
use weftrpc_common::http::RequestHead;
use weftrpc_common::protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use weftrpc_common::{Node, Result, WeftError};

use super::BodyDocument;
use crate::http::{HttpReply, HttpService, Responder};
use crate::service::Service;

pub const CONTENT_TYPE: &str = "application/json";

/// Serves a [`Service`] as JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcService {
    service: Rc<Service>,
}

impl JsonRpcService {
    pub fn new(service: Service) -> Self {
        Self::shared(Rc::new(service))
    }

    /// Serves a registry that is also used elsewhere.
    pub fn shared(service: Rc<Service>) -> Self {
        JsonRpcService { service }
    }
}

impl HttpService for JsonRpcService {
    fn create_responder(&self, _request: &RequestHead) -> Box<dyn Responder> {
        Box::new(JsonRpcResponder::new(self.service.clone()))
    }
}

/// One JSON-RPC exchange.
#[derive(Debug)]
pub struct JsonRpcResponder {
    service: Rc<Service>,
    body: BodyDocument<JsonParser>,
}

impl JsonRpcResponder {
    pub fn new(service: Rc<Service>) -> Self {
        JsonRpcResponder {
            service,
            body: BodyDocument::new(JsonParser::new()),
        }
    }

    fn answer(&mut self) -> Option<JsonRpcResponse> {
        let document = match self.body.finish() {
            Ok(document) => document,
            Err(e) => {
                debug!("unparseable JSON-RPC body: {}", e);
                return Some(JsonRpcResponse::error(Node::null(), JsonRpcError::parse_error()));
            }
        };
        let request = match JsonRpcRequest::from_node(document) {
            Ok(request) => request,
            Err(error) => return Some(JsonRpcResponse::error(Node::null(), error)),
        };
        let notification = request.id.is_void();
        let id = request.id.clone();
        let reply = self.service.dispatch(&request.into_rpc_request());
        if notification {
            return None;
        }
        Some(JsonRpcResponse::from_reply(id, reply))
    }
}

fn write_response(response: &JsonRpcResponse, reply: &mut HttpReply) -> Result<()> {
    reply.body.clear();
    JsonFormatter::new().format(&response.to_node(), &mut reply.body)?;
    reply.set_status(200);
    reply.set_content_type(CONTENT_TYPE);
    Ok(())
}

impl Responder for JsonRpcResponder {
    fn read_body(&mut self, data: &[u8]) -> Result<()> {
        self.body.feed(data);
        Ok(())
    }

    fn reply(&mut self, request: &RequestHead, reply: &mut HttpReply) -> Result<()> {
        if request.method != "POST" {
            *reply = HttpReply::error(405, "JSON-RPC requests must be POSTed");
            reply.set_header("Allow", "POST");
            return Ok(());
        }
        match self.answer() {
            Some(response) => write_response(&response, reply),
            None => {
                reply.set_status(204);
                Ok(())
            }
        }
    }

    fn reply_error(&mut self, error: &WeftError, reply: &mut HttpReply) {
        warn!("JSON-RPC request failed: {}", error);
        let response =
            JsonRpcResponse::error(Node::null(), JsonRpcError::internal_error(&error.to_string()));
        if write_response(&response, reply).is_err() {
            *reply = HttpReply::error(500, &error.to_string());
        }
    }
}
