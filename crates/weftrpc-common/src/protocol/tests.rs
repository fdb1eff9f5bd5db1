//! Tests for the protocol-neutral request and reply types
//!
//! These verify fault mapping and that each envelope carries the same call.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::codec::{from_bytes, json::JsonParser, to_bytes};
    use crate::codec::json::JsonFormatter;
    use crate::value::Node;
    use std::time::Duration;

    #[test]
    fn test_request_param_defaults_to_void() {
        let request = RpcRequest::new("f", vec![Node::from_value(1)]);
        assert_eq!(request.param(0).get_value::<i32>().unwrap(), 1);
        assert!(request.param(1).is_void());
        assert!(request.id.is_void());
    }

    #[test]
    fn test_reply_from_result() {
        let ok: Result<Node> = Ok(Node::from_value(1));
        let reply = RpcReply::from(ok);
        assert!(!reply.is_fault());

        let fault: Result<Node> = Err(WeftError::remote(7, "Fault"));
        let reply = RpcReply::from(fault);
        assert_eq!(reply, RpcReply::fault(7, "Fault"));

        let timeout: Result<Node> = Err(WeftError::Timeout(Duration::from_secs(1)));
        let reply = RpcReply::from(timeout);
        match reply {
            RpcReply::Fault { code, message } => {
                assert_eq!(code, jsonrpc::SERVER_ERROR);
                assert!(message.contains("Timeout"));
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_fault_into_remote_error() {
        match RpcReply::fault(3, "boom").into_result() {
            Err(WeftError::Remote { code, message }) => {
                assert_eq!(code, 3);
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_same_call_through_every_envelope() {
        let params = vec![Node::from_value(2i64), Node::from_value("three")];

        let mut bin = Vec::new();
        binrpc::format_request("f", &params, &mut bin).unwrap();
        let from_bin = from_bytes(&mut binrpc::BinaryRequestParser::new(), &bin).unwrap();

        let mut xml = Vec::new();
        xmlrpc::format_call("f", &params, &mut xml);
        let from_xml = from_bytes(&mut xmlrpc::XmlRpcCallParser::new(), &xml).unwrap();

        let json = to_bytes(
            &mut JsonFormatter::new(),
            &jsonrpc::JsonRpcRequest::new("f", params.clone(), 9).to_node(),
        )
        .unwrap();
        let node = from_bytes(&mut JsonParser::new(), &json).unwrap();
        let from_json = jsonrpc::JsonRpcRequest::from_node(node)
            .unwrap()
            .into_rpc_request();

        assert_eq!(from_bin.params, params);
        assert_eq!(from_xml.params, params);
        assert_eq!(from_json.params, params);
        assert_eq!(from_json.id.get_value::<i64>().unwrap(), 9);
    }
}
