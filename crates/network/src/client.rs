use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::config::{BasicAuth, Config, EnvDefaults};
use crate::error::{ErrorSlot, Result, TunnelError};
use crate::headers::HeaderList;
use crate::http::{self, BodyError, Fetched, OutputTarget, Request, Response, ResponseHead, Target};
use crate::proxy::{self, host_port, ProxySpec};
use crate::session::{Handle, Session, SessionInfo, SessionTable, SharedSession};
use crate::tls::{TlsConnectors, TlsMode};

/// `info!` when the client is verbose, `debug!` otherwise.
macro_rules! trace_verbose {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Where the body of a transaction goes.
enum Sink {
    HeadOnly,
    Memory,
    File(std::path::PathBuf),
}

/// Connection context: configuration, open sessions and the last error.
///
/// Configuration changes apply to operations started afterwards; open
/// sessions keep the timeout they were connected with. The last-error slot
/// is shared by every caller of this client and the last failure wins.
pub struct Client {
    config: RwLock<Config>,
    env: OnceLock<EnvDefaults>,
    sessions: Mutex<SessionTable>,
    tls: TlsConnectors,
    errors: ErrorSlot,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config: RwLock::new(config),
            env: OnceLock::new(),
            sessions: Mutex::new(SessionTable::default()),
            tls: TlsConnectors::new()?,
            errors: ErrorSlot::new(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Explicitly configured values only.
    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Configuration as the next operation will see it, with `PROXY` and
    /// `USER_AGENT` filled in where nothing was set explicitly. The
    /// environment is read once, on first use.
    pub fn effective_config(&self) -> Config {
        let mut config = self.config();
        if config.env_defaults {
            let env = self.env.get_or_init(EnvDefaults::from_env);
            if config.proxy.is_none() {
                config.proxy = env.proxy.clone();
            }
            if config.user_agent.is_none() {
                config.user_agent = env.user_agent.clone();
            }
        }
        config
    }

    fn update(&self, apply: impl FnOnce(&mut Config) -> Result<()>) -> Result<()> {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut config)
    }

    /// Accepts `socks5://host:port`, `socks5h://host:port`, `tor`, or one of
    /// the aliases for `socks5h://127.0.0.1:1080`.
    pub fn set_proxy(&self, spec: &str) -> Result<()> {
        let result = ProxySpec::parse(spec).and_then(|proxy| {
            debug!("Proxy set to {}", proxy);
            self.update(|config| {
                config.proxy = Some(proxy);
                Ok(())
            })
        });
        self.errors.track(result)
    }

    pub fn set_user_agent(&self, user_agent: impl Into<String>) {
        let user_agent = user_agent.into();
        let _ = self.update(|config| {
            config.user_agent = Some(user_agent);
            Ok(())
        });
    }

    pub fn set_timeout(&self, ms: u32) -> Result<()> {
        let result = self.update(|config| config.set_timeout_ms(ms));
        self.errors.track(result)
    }

    pub fn set_verbose(&self, verbose: bool) {
        let _ = self.update(|config| {
            config.verbose = verbose;
            Ok(())
        });
    }

    pub fn set_basic_auth(&self, user: impl Into<String>, password: impl Into<String>) {
        let (user, password) = (user.into(), password.into());
        let _ = self.update(|config| {
            config.basic_auth = Some(BasicAuth { user, password });
            Ok(())
        });
    }

    /// Headers sent with every request, as a `key=value;key=value` spec.
    pub fn set_default_headers(&self, spec: &str) -> Result<()> {
        let result = HeaderList::parse(spec).and_then(|headers| {
            self.update(|config| {
                config.headers = headers;
                Ok(())
            })
        });
        self.errors.track(result)
    }

    /// Message of the most recent failure, or an empty string.
    pub fn last_error(&self) -> String {
        self.errors.get()
    }

    pub fn take_last_error(&self) -> Option<String> {
        self.errors.take()
    }

    /// The slot behind [`Client::last_error`], for layers that report their
    /// own failures through the same channel.
    pub fn error_slot(&self) -> &ErrorSlot {
        &self.errors
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, handle: Handle) -> Result<SharedSession> {
        self.table().get(handle)
    }

    /// Opens a session to `host:port`, through the configured proxy and
    /// optionally wrapped in TLS. Nothing is registered unless every step
    /// succeeded.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        allow_insecure_tls: bool,
    ) -> Result<Handle> {
        let config = self.effective_config();
        let mode = TlsMode::from_flags(use_tls, allow_insecure_tls);
        let result = self.open_session(host, port, mode, &config).await;
        self.errors.track(result)
    }

    async fn open_session(
        &self,
        host: &str,
        port: u16,
        mode: TlsMode,
        config: &Config,
    ) -> Result<Handle> {
        let timeout = config.timeout();
        match &config.proxy {
            Some(proxy) => trace_verbose!(
                config.verbose,
                "Connecting to {} via {}",
                host_port(host, port),
                proxy
            ),
            None => trace_verbose!(config.verbose, "Connecting to {}", host_port(host, port)),
        }

        let tcp = proxy::open_tcp(host, port, config.proxy.as_ref(), timeout).await?;
        let stream = self.tls.wrap(tcp, host, mode, timeout).await?;

        let handle = self
            .table()
            .insert_with(|handle| Session::new(handle, stream, host, port, mode, timeout))?;
        trace_verbose!(
            config.verbose,
            "Session {} open to {} (tls: {:?})",
            handle,
            host_port(host, port),
            mode
        );
        Ok(handle)
    }

    /// Reads up to `buf.len()` bytes; `Ok(0)` means the peer closed its side,
    /// including a TLS peer that closed without sending close_notify.
    pub async fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let result: Result<usize> = async {
            if buf.is_empty() {
                return Err(TunnelError::Config("read buffer is empty".to_string()));
            }
            let session = self.session(handle)?;
            let mut session = session.lock().await;
            session.read(buf).await
        }
        .await;
        self.errors.track(result)
    }

    /// Writes all of `data`; a partial write is reported as an error.
    pub async fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        let result: Result<usize> = async {
            let session = self.session(handle)?;
            let mut session = session.lock().await;
            session.write_all(data).await
        }
        .await;
        self.errors.track(result)
    }

    /// Closes the session and frees its handle. A second call with the same
    /// handle fails with an invalid-handle error.
    pub async fn disconnect(&self, handle: Handle) -> Result<()> {
        let result = self.close_session(handle).await;
        self.errors.track(result)
    }

    async fn close_session(&self, handle: Handle) -> Result<()> {
        let session = self.table().remove(handle)?;
        let mut session = session.lock().await;
        session.close().await;
        Ok(())
    }

    pub async fn session_info(&self, handle: Handle) -> Result<SessionInfo> {
        let result: Result<SessionInfo> = async {
            let session = self.session(handle)?;
            let session = session.lock().await;
            Ok(session.info())
        }
        .await;
        self.errors.track(result)
    }

    pub fn session_count(&self) -> usize {
        self.table().len()
    }

    /// One request, full response buffered in memory.
    pub async fn fetch(&self, request: &Request) -> Result<Response> {
        let result = self.transact(request, Sink::Memory).await.map(|fetched| match fetched {
            Fetched::Buffered(response) => response,
            Fetched::Written { head, .. } => Response {
                head,
                body: Vec::new(),
            },
        });
        self.errors.track(result)
    }

    /// One request; returns once the blank line ending the headers arrives.
    pub async fn fetch_head(&self, request: &Request) -> Result<ResponseHead> {
        let result = self
            .transact(request, Sink::HeadOnly)
            .await
            .map(Fetched::into_head);
        self.errors.track(result)
    }

    /// One request with the body buffered or streamed to a file.
    pub async fn fetch_into(&self, request: &Request, output: OutputTarget) -> Result<Fetched> {
        let sink = match output {
            OutputTarget::Memory => Sink::Memory,
            OutputTarget::File(path) => Sink::File(path),
        };
        let result = self.transact(request, sink).await;
        self.errors.track(result)
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self.fetch(&Request::get(url)).await?.body)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.fetch(&Request::get(url)).await?;
        self.errors.track(response.json())
    }

    pub async fn post_json<T: Serialize, R: DeserializeOwned>(&self, url: &str, body: &T) -> Result<R> {
        let request = serde_json::to_vec(body)
            .map_err(|e| TunnelError::Json(format!("encoding request body: {}", e)))
            .and_then(|bytes| {
                let mut headers = HeaderList::new();
                headers.try_push("Content-Type", "application/json")?;
                Ok(Request::post(url, bytes).with_headers(headers))
            });
        let request = self.errors.track(request)?;
        let response = self.fetch(&request).await?;
        self.errors.track(response.json())
    }

    async fn transact(&self, request: &Request, sink: Sink) -> Result<Fetched> {
        let config = self.effective_config();
        let target = Target::parse(request.url())?;
        let bytes = http::encode_request(request, &target, &config)?;
        let mode = TlsMode::from_flags(target.use_tls(), request.insecure_tls());

        trace_verbose!(config.verbose, "{} {}", request.method(), request.url());

        let handle = self.open_session(&target.host, target.port, mode, &config).await?;
        let result = self.exchange_on(handle, request, &bytes, sink).await;

        if let Err(e) = self.close_session(handle).await {
            debug!("Closing transaction session {}: {}", handle, e);
        }
        if let Ok(fetched) = &result {
            trace_verbose!(config.verbose, "{} {} -> {}", request.method(), request.url(), fetched.status());
        }
        result
    }

    async fn exchange_on(
        &self,
        handle: Handle,
        request: &Request,
        bytes: &[u8],
        sink: Sink,
    ) -> Result<Fetched> {
        let session = self.session(handle)?;
        let mut session = session.lock().await;
        let timeout = session.timeout();
        let exchange = exchange(session.stream_mut(), request.method(), bytes, sink);
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(TunnelError::timeout(
                format!("fetching {}", request.url()),
                timeout,
            )),
            Ok(result) => result,
        }
    }
}

async fn exchange<S>(stream: &mut S, method: &str, bytes: &[u8], sink: Sink) -> Result<Fetched>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    http::send_request(stream, bytes).await?;
    let (head, leftover) = http::read_head(stream).await?;
    debug!("Response head: {} {}", head.status, head.reason);

    match sink {
        Sink::HeadOnly => Ok(Fetched::Buffered(Response {
            head,
            body: Vec::new(),
        })),
        Sink::Memory => {
            let framing = http::framing(method, &head)?;
            let mut body = Vec::new();
            http::read_body(stream, leftover, framing, &mut body)
                .await
                .map_err(|e| match e {
                    BodyError::Read(e) => e,
                    BodyError::Write(e) => TunnelError::Io(e.to_string()),
                })?;
            Ok(Fetched::Buffered(Response { head, body }))
        }
        Sink::File(path) => {
            let framing = http::framing(method, &head)?;
            let mut file = open_output(&path).await?;
            let bytes = http::read_body(stream, leftover, framing, &mut file)
                .await
                .map_err(|e| e.into_error(&path))?;
            Ok(Fetched::Written { head, path, bytes })
        }
    }
}

async fn open_output(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::create(path)
        .await
        .map_err(|e| TunnelError::Output {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
