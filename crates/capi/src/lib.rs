//! C bindings for tunnelwire.
//!
//! One process-wide client backs every call. Failures return a sentinel
//! (`-1`, `1` or `NULL`) and leave a message readable through
//! [`tw_last_error`]. Strings handed out by `tw_get_url*` and `tw_post_url`
//! belong to the caller and must be released with [`tw_free`].

use std::ffi::{c_char, c_int, CStr, CString};
use std::io::Write;
use std::path::PathBuf;
use std::ptr;
use std::sync::{Mutex, OnceLock};

use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnelwire::blocking::Client;
use tunnelwire::{Handle, OutputTarget, Request, Result, TunnelError};

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

static CLIENT: OnceLock<std::result::Result<Client, String>> = OnceLock::new();

/// Backing storage for the pointer returned by `tw_last_error`.
static LAST_ERROR: Mutex<Option<CString>> = Mutex::new(None);

static LOGGING: OnceLock<()> = OnceLock::new();

fn client() -> std::result::Result<&'static Client, &'static str> {
    CLIENT
        .get_or_init(|| Client::with_defaults().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| e.as_str())
}

/// Runs `op` against the global client; an error is recorded and `fallback`
/// returned instead.
fn with_client<T>(fallback: T, op: impl FnOnce(&Client) -> Result<T>) -> T {
    let Ok(client) = client() else {
        return fallback;
    };
    match op(client) {
        Ok(value) => value,
        Err(e) => {
            debug!("C call failed: {}", e);
            client.error_slot().record(&e);
            fallback
        }
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(TunnelError::Config(format!("{} is NULL", name)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| TunnelError::Config(format!("{} is not valid UTF-8", name)))
}

/// Like [`str_arg`] but NULL reads as the empty string.
unsafe fn optional_str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        Ok("")
    } else {
        str_arg(ptr, name)
    }
}

fn handle_arg(raw: c_int) -> Result<Handle> {
    Handle::from_raw(raw).ok_or(TunnelError::InvalidRawHandle(raw))
}

fn count(n: usize) -> c_int {
    c_int::try_from(n).unwrap_or(c_int::MAX)
}

/// Caller-owned NUL-terminated copy; content after an embedded NUL is cut.
fn into_c_string(mut bytes: Vec<u8>) -> *mut c_char {
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }
    CString::new(bytes)
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}

fn init_logging() {
    LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tunnelwire=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}

/// Library version, statically allocated. Do not free.
#[no_mangle]
pub extern "C" fn tw_version() -> *const c_char {
    VERSION.as_ptr().cast()
}

/// Proxy for future connections: `socks5://host:port`, `socks5h://host:port`,
/// `tor`, or an alias for `socks5h://127.0.0.1:1080`. Returns 0 or -1.
///
/// # Safety
/// `spec` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tw_set_proxy(spec: *const c_char) -> c_int {
    with_client(-1, |client| {
        client.set_proxy(str_arg(spec, "proxy")?)?;
        Ok(0)
    })
}

/// # Safety
/// `user_agent` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tw_set_user_agent(user_agent: *const c_char) -> c_int {
    with_client(-1, |client| {
        client.set_user_agent(str_arg(user_agent, "user agent")?);
        Ok(0)
    })
}

/// Timeout in milliseconds for future connections. Zero or negative values
/// are rejected with -1.
#[no_mangle]
pub extern "C" fn tw_set_timeout(ms: c_int) -> c_int {
    with_client(-1, |client| {
        client.set_timeout(u32::try_from(ms).unwrap_or(0))?;
        Ok(0)
    })
}

/// Non-zero enables lifecycle logging on stderr.
#[no_mangle]
pub extern "C" fn tw_set_verbose(verbose: c_int) -> c_int {
    if verbose != 0 {
        init_logging();
    }
    with_client(-1, |client| {
        client.set_verbose(verbose != 0);
        Ok(0)
    })
}

/// Opens a session. Returns a non-negative handle, or -1.
///
/// # Safety
/// `host` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tw_connect(
    host: *const c_char,
    port: c_int,
    use_tls: c_int,
    allow_insecure_tls: c_int,
) -> c_int {
    with_client(-1, |client| {
        let host = str_arg(host, "host")?;
        let port = u16::try_from(port)
            .map_err(|_| TunnelError::Config(format!("invalid port {}", port)))?;
        let handle = client.connect(host, port, use_tls != 0, allow_insecure_tls != 0)?;
        Ok(handle.as_raw())
    })
}

/// Reads up to `max_len` bytes into `buf`. Returns the count, 0 once the
/// peer has closed, or -1 on error or timeout.
///
/// # Safety
/// `buf` must point to at least `max_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn tw_read(handle: c_int, buf: *mut c_char, max_len: c_int) -> c_int {
    with_client(-1, |client| {
        let handle = handle_arg(handle)?;
        let len = usize::try_from(max_len)
            .ok()
            .filter(|&len| len > 0)
            .ok_or_else(|| TunnelError::Config(format!("invalid read length {}", max_len)))?;
        if buf.is_null() {
            return Err(TunnelError::Config("read buffer is NULL".to_string()));
        }
        let buf = std::slice::from_raw_parts_mut(buf.cast::<u8>(), len);
        Ok(count(client.read(handle, buf)?))
    })
}

/// Writes the NUL-terminated `data`. Returns bytes written or -1.
///
/// # Safety
/// `data` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tw_write(handle: c_int, data: *const c_char) -> c_int {
    with_client(-1, |client| {
        let handle = handle_arg(handle)?;
        if data.is_null() {
            return Err(TunnelError::Config("write data is NULL".to_string()));
        }
        let data = CStr::from_ptr(data).to_bytes();
        Ok(count(client.write(handle, data)?))
    })
}

/// Writes `len` raw bytes, NULs included. Returns bytes written or -1.
///
/// # Safety
/// `data` must point to at least `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn tw_write_bytes(handle: c_int, data: *const u8, len: usize) -> c_int {
    with_client(-1, |client| {
        let handle = handle_arg(handle)?;
        if len > c_int::MAX as usize {
            return Err(TunnelError::Config(format!("write of {} bytes is too large", len)));
        }
        if data.is_null() && len > 0 {
            return Err(TunnelError::Config("write data is NULL".to_string()));
        }
        let data = if len == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(data, len)
        };
        Ok(count(client.write(handle, data)?))
    })
}

/// Closes a session. Returns 0, or -1 for an unknown or closed handle.
#[no_mangle]
pub extern "C" fn tw_disconnect(handle: c_int) -> c_int {
    with_client(-1, |client| {
        client.disconnect(handle_arg(handle)?)?;
        Ok(0)
    })
}

/// One request. `output` NULL, `""`, `"-"`, `"1"` or `"stdout"` prints the
/// body on stdout, `"2"` or `"stderr"` on stderr; anything else is a file
/// path that is created or truncated. Returns 0 or 1.
///
/// # Safety
/// Every argument must be NULL or a valid NUL-terminated string; `url` must
/// not be NULL.
#[no_mangle]
pub unsafe extern "C" fn tw_do(
    method: *const c_char,
    url: *const c_char,
    header_spec: *const c_char,
    output: *const c_char,
) -> c_int {
    with_client(1, |client| {
        let request = Request::new(optional_str_arg(method, "method")?, str_arg(url, "url")?)
            .with_header_spec(optional_str_arg(header_spec, "header spec")?)?;

        match optional_str_arg(output, "output")? {
            "" | "-" | "1" | "stdout" => {
                let response = client.fetch(&request)?;
                write_stream(std::io::stdout().lock(), "stdout", &response.body)?;
            }
            "2" | "stderr" => {
                let response = client.fetch(&request)?;
                write_stream(std::io::stderr().lock(), "stderr", &response.body)?;
            }
            path => {
                client.fetch_into(&request, OutputTarget::File(PathBuf::from(path)))?;
            }
        }
        Ok(0)
    })
}

fn write_stream(mut out: impl Write, name: &str, body: &[u8]) -> Result<()> {
    out.write_all(body)
        .and_then(|_| out.flush())
        .map_err(|e| TunnelError::Output {
            path: name.to_string(),
            reason: e.to_string(),
        })
}

/// GET `url` and return the body. Free the result with [`tw_free`].
///
/// # Safety
/// `url` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tw_get_url(url: *const c_char) -> *mut c_char {
    tw_get_url_headers(url, ptr::null())
}

/// GET `url` with extra headers and return the body.
///
/// # Safety
/// `url` must be a valid NUL-terminated string; `header_spec` may be NULL.
#[no_mangle]
pub unsafe extern "C" fn tw_get_url_headers(
    url: *const c_char,
    header_spec: *const c_char,
) -> *mut c_char {
    with_client(ptr::null_mut(), |client| {
        let request = Request::get(str_arg(url, "url")?)
            .with_header_spec(optional_str_arg(header_spec, "header spec")?)?;
        Ok(into_c_string(client.fetch(&request)?.body))
    })
}

/// GET `url` and return the status line and headers, up to the blank line.
///
/// # Safety
/// `url` must be a valid NUL-terminated string; `header_spec` may be NULL.
#[no_mangle]
pub unsafe extern "C" fn tw_get_url_head(
    url: *const c_char,
    header_spec: *const c_char,
) -> *mut c_char {
    with_client(ptr::null_mut(), |client| {
        let request = Request::get(str_arg(url, "url")?)
            .with_header_spec(optional_str_arg(header_spec, "header spec")?)?;
        Ok(into_c_string(client.fetch_head(&request)?.raw))
    })
}

/// POST `body` to `url` and return the response body.
///
/// # Safety
/// `url` must be a valid NUL-terminated string; `body` and `header_spec`
/// may be NULL.
#[no_mangle]
pub unsafe extern "C" fn tw_post_url(
    url: *const c_char,
    body: *const c_char,
    header_spec: *const c_char,
) -> *mut c_char {
    with_client(ptr::null_mut(), |client| {
        let body = if body.is_null() {
            Vec::new()
        } else {
            CStr::from_ptr(body).to_bytes().to_vec()
        };
        let request = Request::post(str_arg(url, "url")?, body)
            .with_header_spec(optional_str_arg(header_spec, "header spec")?)?;
        Ok(into_c_string(client.fetch(&request)?.body))
    })
}

/// Releases a string returned by this library. NULL is ignored.
///
/// # Safety
/// `ptr` must come from `tw_get_url*` or `tw_post_url` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn tw_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Most recent failure message, or an empty string. The pointer stays valid
/// until the next `tw_last_error` call. Do not free.
#[no_mangle]
pub extern "C" fn tw_last_error() -> *const c_char {
    let message = match client() {
        Ok(client) => client.last_error(),
        Err(init) => init.to_string(),
    };
    let mut slot = LAST_ERROR.lock().unwrap_or_else(|e| e.into_inner());
    let stored = slot.insert(CString::new(message.replace('\0', " ")).unwrap_or_default());
    stored.as_ptr()
}
