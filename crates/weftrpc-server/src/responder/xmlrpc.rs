//! XML-RPC over HTTP

use std::rc::Rc;

use tracing::{debug, warn};
use weftrpc_common::http::RequestHead;
use weftrpc_common::protocol::jsonrpc::{INTERNAL_ERROR, PARSE_ERROR};
use weftrpc_common::protocol::xmlrpc::{format_response, XmlRpcCallParser};
use weftrpc_common::{Result, RpcReply, WeftError};

use super::BodyDocument;
use crate::http::{HttpReply, HttpService, Responder};
use crate::service::Service;

pub const CONTENT_TYPE: &str = "text/xml";

/// Serves a [`Service`] as XML-RPC.
#[derive(Debug, Clone)]
pub struct XmlRpcService {
    service: Rc<Service>,
}

impl XmlRpcService {
    pub fn new(service: Service) -> Self {
        Self::shared(Rc::new(service))
    }

    pub fn shared(service: Rc<Service>) -> Self {
        XmlRpcService { service }
    }
}

impl HttpService for XmlRpcService {
    fn create_responder(&self, _request: &RequestHead) -> Box<dyn Responder> {
        Box::new(XmlRpcResponder::new(self.service.clone()))
    }
}

/// One XML-RPC exchange. Malformed calls are answered with a fault
/// response rather than an HTTP error.
pub struct XmlRpcResponder {
    service: Rc<Service>,
    body: BodyDocument<XmlRpcCallParser>,
}

impl XmlRpcResponder {
    pub fn new(service: Rc<Service>) -> Self {
        XmlRpcResponder {
            service,
            body: BodyDocument::new(XmlRpcCallParser::new()),
        }
    }
}

fn write_outcome(reply: &mut HttpReply, outcome: &RpcReply) {
    reply.body.clear();
    format_response(outcome, &mut reply.body);
    reply.set_status(200);
    reply.set_content_type(CONTENT_TYPE);
}

impl Responder for XmlRpcResponder {
    fn read_body(&mut self, data: &[u8]) -> Result<()> {
        self.body.feed(data);
        Ok(())
    }

    fn reply(&mut self, request: &RequestHead, reply: &mut HttpReply) -> Result<()> {
        if request.method != "POST" {
            *reply = HttpReply::error(405, "XML-RPC requests must be POSTed");
            reply.set_header("Allow", "POST");
            return Ok(());
        }
        let outcome = match self.body.finish() {
            Ok(call) => self.service.dispatch(&call),
            Err(e) => {
                debug!("unparseable XML-RPC body: {}", e);
                RpcReply::fault(PARSE_ERROR, e.to_string())
            }
        };
        write_outcome(reply, &outcome);
        Ok(())
    }

    fn reply_error(&mut self, error: &WeftError, reply: &mut HttpReply) {
        warn!("XML-RPC request failed: {}", error);
        write_outcome(reply, &RpcReply::fault(INTERNAL_ERROR, error.to_string()));
    }
}
