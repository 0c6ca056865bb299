//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{TcpClient, TcpConnector};
pub use rpc::{Request, Response};
pub use server::ColumnStoreServer;
