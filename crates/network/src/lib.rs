//! This crate provides TCP sessions and one-shot HTTP(S) requests that can be routed through a SOCKS5 proxy or Tor.
//!
//! ```rust,no_run
//! use tunnelwire::{Client, Config, Request};
//!
//! #[tokio::main]
//! async fn main() -> tunnelwire::Result<()> {
//!     let client = Client::new(Config::default().with_tor())?;
//!
//!     // One request, one connection
//!     let response = client.fetch(&Request::get("https://check.torproject.org/")).await?;
//!     println!("{} ({} bytes)", response.status(), response.body.len());
//!
//!     // Raw session
//!     let handle = client.connect("example.com", 80, false, false).await?;
//!     client.write(handle, b"HEAD / HTTP/1.0\r\n\r\n").await?;
//!     let mut buf = [0u8; 1024];
//!     let n = client.read(handle, &mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!     client.disconnect(handle).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod http;
pub mod proxy;
pub mod session;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use config::{BasicAuth, Config, DEFAULT_PROXY, DEFAULT_TIMEOUT_MS, DEFAULT_TOR_SOCKS_ADDR, DEFAULT_USER_AGENT};
pub use error::{ErrorKind, ErrorSlot, Result, TunnelError};
pub use headers::HeaderList;
pub use http::{join_url, Fetched, OutputTarget, Request, Response, ResponseHead};
pub use proxy::{ProxyScheme, ProxySpec};
pub use session::{Handle, SessionInfo};
pub use tls::TlsMode;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Client preconfigured for the local Tor SOCKS port.
pub fn tor_client() -> Result<Client> {
    Client::new(Config::default().with_tor())
}
