//! RPC status codes and structured errors

mod code;
mod error;

pub use code::Code;
pub use error::{ErrorDetail, RpcError};
