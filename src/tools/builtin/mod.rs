//! Built-in tools: a prompt echo and a native-transfer transaction builder.

pub mod echo;
pub mod transfer;

pub use echo::EchoTool;
pub use transfer::NativeTransferTool;
