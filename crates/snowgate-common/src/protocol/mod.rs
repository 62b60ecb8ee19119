pub mod error;
pub mod jsonrpc;
pub mod payload;

pub use error::{GatewayError, Result};
pub use jsonrpc::{RpcError, RpcRequest, RpcResponse};
pub use payload::{RpcCall, RpcPayload};
