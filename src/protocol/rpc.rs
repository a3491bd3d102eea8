use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};

use super::messages::{Notification, Request, Response, RpcError};

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub request: Request,
    pub id: Value,
}

/// JSON-RPC 2.0 success response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub result: Response,
    pub id: Value,
}

/// JSON-RPC 2.0 error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub error: RpcError,
    pub id: Value,
}

/// JSON-RPC 2.0 notification envelope (no id)
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub notification: Notification,
}

impl RpcRequest {
    pub fn new(request: Request, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            request,
            id: id.into(),
        }
    }
}

impl RpcResponse {
    pub fn new(result: Response, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result,
            id,
        }
    }
}

impl RpcErrorResponse {
    pub fn new(error: RpcError, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            error,
            id,
        }
    }
}

impl RpcNotification {
    pub fn new(notification: Notification) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            notification,
        }
    }
}

/// Anything the daemon may send back while a request is in flight.
#[derive(Debug)]
pub enum Incoming {
    Notification(Notification),
    Response(RpcResponse),
    Error(RpcErrorResponse),
}

/// Write a JSON-RPC message as a single line (JSONL)
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> std::io::Result<()> {
    let json = serde_json::to_string(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}

/// Read a JSON-RPC request from a line
pub fn read_request<R: BufRead>(reader: &mut R) -> std::io::Result<Option<RpcRequest>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None); // EOF
    }
    let req: RpcRequest = serde_json::from_str(&line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(req))
}

/// Read a notification or a final response (success or error) from a line
pub fn read_message<R: BufRead>(reader: &mut R) -> std::io::Result<Incoming> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }

    // Only notifications carry a method
    if let Ok(notification) = serde_json::from_str::<RpcNotification>(&line) {
        return Ok(Incoming::Notification(notification.notification));
    }

    // Only error responses carry an error
    if let Ok(err) = serde_json::from_str::<RpcErrorResponse>(&line) {
        return Ok(Incoming::Error(err));
    }

    if let Ok(resp) = serde_json::from_str::<RpcResponse>(&line) {
        return Ok(Incoming::Response(resp));
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "invalid JSON-RPC message",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CloneResult, VersionResult};
    use std::io::Cursor;

    #[test]
    fn test_serialize_request_with_params() {
        let req = RpcRequest::new(
            Request::Resolve {
                query: "owner/repo".to_string(),
            },
            1,
        );
        let json = serde_json::to_string(&req).unwrap();

        // Verify JSON-RPC 2.0 format with flattened request
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""method":"resolve""#));
        assert!(json.contains(r#""params":{"query":"owner/repo"}"#));
        assert!(json.contains(r#""id":1"#));
    }

    #[test]
    fn test_roundtrip_request_with_string_id() {
        let original = RpcRequest::new(Request::Sources, "req-123");

        let mut buffer = Vec::new();
        write_message(&mut buffer, &original).unwrap();

        let mut cursor = Cursor::new(buffer);
        let parsed = read_request(&mut cursor).unwrap().unwrap();

        assert_eq!(parsed.id, "req-123");
        assert!(matches!(parsed.request, Request::Sources));
    }

    #[test]
    fn test_notification_has_no_id() {
        let json = serde_json::to_string(&RpcNotification::new(Notification::Log {
            line: "Receiving objects: 100%".to_string(),
        }))
        .unwrap();

        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""method":"log""#));
        assert!(!json.contains(r#""id""#));
    }

    #[test]
    fn test_read_stream_of_notifications_then_response() {
        let mut buffer = Vec::new();
        write_message(
            &mut buffer,
            &RpcNotification::new(Notification::Log {
                line: "Cloning".to_string(),
            }),
        )
        .unwrap();
        write_message(
            &mut buffer,
            &RpcResponse::new(
                Response::Clone(CloneResult {
                    directory: "/home/me/src/github/octocat/Hello-World".to_string(),
                }),
                Value::from(7),
            ),
        )
        .unwrap();

        let mut cursor = Cursor::new(buffer);
        match read_message(&mut cursor).unwrap() {
            Incoming::Notification(Notification::Log { line }) => assert_eq!(line, "Cloning"),
            other => panic!("Expected log notification, got {:?}", other),
        }
        match read_message(&mut cursor).unwrap() {
            Incoming::Response(resp) => {
                assert_eq!(resp.id, 7);
                assert!(matches!(resp.result, Response::Clone(_)));
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_success_response() {
        let original = RpcResponse::new(
            Response::Version(VersionResult {
                version: "0.1.0".to_string(),
                pid: 42,
            }),
            Value::from(5),
        );

        let mut buffer = Vec::new();
        write_message(&mut buffer, &original).unwrap();

        let mut cursor = Cursor::new(buffer);
        match read_message(&mut cursor).unwrap() {
            Incoming::Response(resp) => match resp.result {
                Response::Version(version) => {
                    assert_eq!(version.version, "0.1.0");
                    assert_eq!(version.pid, 42);
                }
                _ => panic!("Expected Version response"),
            },
            other => panic!("Expected success response, got {:?}", other),
        }
    }

    #[test]
    fn test_null_result_is_a_response() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &RpcResponse::new(Response::Ok(()), Value::from(3))).unwrap();

        let mut cursor = Cursor::new(buffer);
        assert!(matches!(
            read_message(&mut cursor).unwrap(),
            Incoming::Response(RpcResponse {
                result: Response::Ok(()),
                ..
            })
        ));
    }

    #[test]
    fn test_roundtrip_error_response() {
        let original = RpcErrorResponse::new(
            RpcError::operation_failed("unrecognized source (gitlab)"),
            Value::from(99),
        );

        let mut buffer = Vec::new();
        write_message(&mut buffer, &original).unwrap();

        let mut cursor = Cursor::new(buffer);
        match read_message(&mut cursor).unwrap() {
            Incoming::Error(err_resp) => {
                assert_eq!(err_resp.id, 99);
                assert_eq!(err_resp.error.code, -1);
                assert_eq!(err_resp.error.message, "unrecognized source (gitlab)");
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_read_request_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_message_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_message(&mut cursor);
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut cursor = Cursor::new(b"{\"hello\":\"world\"}\n".to_vec());
        assert_eq!(
            read_message(&mut cursor).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }
}
