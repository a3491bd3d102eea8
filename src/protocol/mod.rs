//! JSON-RPC protocol between the CLI and the daemon.

mod messages;
mod rpc;

pub use messages::{
    CloneResult, Notification, ResolveResult, Request, Response, RpcError, SourcesResult,
    VersionResult,
};
pub use rpc::{
    Incoming, RpcErrorResponse, RpcNotification, RpcRequest, RpcResponse, read_message,
    read_request, write_message,
};
