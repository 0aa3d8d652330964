//! Synchronous front end over [`crate::Client`].
//!
//! Every call blocks the current thread until the operation finishes or its
//! timeout fires. Must not be called from inside an async runtime.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::error::{ErrorSlot, Result, TunnelError};
use crate::http::{Fetched, OutputTarget, Request, Response, ResponseHead};
use crate::session::{Handle, SessionInfo};

pub struct Client {
    inner: crate::Client,
    runtime: Runtime,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tunnelwire-io")
            .enable_all()
            .build()
            .map_err(|e| TunnelError::Io(format!("failed to start runtime: {}", e)))?;

        Ok(Self {
            inner: crate::Client::new(config)?,
            runtime,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    pub fn as_async(&self) -> &crate::Client {
        &self.inner
    }

    pub fn config(&self) -> Config {
        self.inner.config()
    }

    pub fn effective_config(&self) -> Config {
        self.inner.effective_config()
    }

    pub fn set_proxy(&self, spec: &str) -> Result<()> {
        self.inner.set_proxy(spec)
    }

    pub fn set_user_agent(&self, user_agent: impl Into<String>) {
        self.inner.set_user_agent(user_agent)
    }

    pub fn set_timeout(&self, ms: u32) -> Result<()> {
        self.inner.set_timeout(ms)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.set_verbose(verbose)
    }

    pub fn set_basic_auth(&self, user: impl Into<String>, password: impl Into<String>) {
        self.inner.set_basic_auth(user, password)
    }

    pub fn set_default_headers(&self, spec: &str) -> Result<()> {
        self.inner.set_default_headers(spec)
    }

    pub fn last_error(&self) -> String {
        self.inner.last_error()
    }

    pub fn take_last_error(&self) -> Option<String> {
        self.inner.take_last_error()
    }

    pub fn error_slot(&self) -> &ErrorSlot {
        self.inner.error_slot()
    }

    pub fn connect(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        allow_insecure_tls: bool,
    ) -> Result<Handle> {
        self.runtime
            .block_on(self.inner.connect(host, port, use_tls, allow_insecure_tls))
    }

    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        self.runtime.block_on(self.inner.read(handle, buf))
    }

    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.runtime.block_on(self.inner.write(handle, data))
    }

    pub fn disconnect(&self, handle: Handle) -> Result<()> {
        self.runtime.block_on(self.inner.disconnect(handle))
    }

    pub fn session_info(&self, handle: Handle) -> Result<SessionInfo> {
        self.runtime.block_on(self.inner.session_info(handle))
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_count()
    }

    pub fn fetch(&self, request: &Request) -> Result<Response> {
        self.runtime.block_on(self.inner.fetch(request))
    }

    pub fn fetch_head(&self, request: &Request) -> Result<ResponseHead> {
        self.runtime.block_on(self.inner.fetch_head(request))
    }

    pub fn fetch_into(&self, request: &Request, output: OutputTarget) -> Result<Fetched> {
        self.runtime.block_on(self.inner.fetch_into(request, output))
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.runtime.block_on(self.inner.get_bytes(url))
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.runtime.block_on(self.inner.get_json(url))
    }

    pub fn post_json<T: Serialize, R: DeserializeOwned>(&self, url: &str, body: &T) -> Result<R> {
        self.runtime.block_on(self.inner.post_json(url, body))
    }
}
