//! 本地 HTTP 代理, 把请求转给上游 SOCKS5 服务器。
//!
//! 普通 HTTP 请求交给 reqwest 转发; CONNECT (HTTPS) 请求由本库自己完成
//! SOCKS5 握手, 然后在客户端连接和上游连接之间双向转发。

pub mod address;
pub mod config;
pub mod forward;
pub mod router;
pub mod server;
pub mod socks5;
pub mod tunnel;

pub use address::{AddressError, TargetAddress};
pub use config::{Config, ConfigError, UpstreamEndpoint};
pub use router::{Route, RouteError, Router};
pub use socks5::{HandshakeError, HandshakeOptions};
