#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, AsyncBufReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tunnelwire::{Client, Config};

const CERT: &[u8] = include_bytes!("../fixtures/cert.der");
const KEY: &[u8] = include_bytes!("../fixtures/key.der");

pub fn client() -> Client {
    Client::new(Config::default().without_env_defaults().with_timeout_ms(5_000)).unwrap()
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Line echo server for one connection; `/quit` makes it close its side.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        echo_lines(socket).await;
    });
    addr
}

async fn echo_lines<S: AsyncRead + AsyncWrite + Unpin>(socket: S) {
    let (read, mut write) = tokio::io::split(socket);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line == "/quit" {
            break;
        }
        let reply = format!("{}\n", line);
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Raw bytes of the request head plus whatever body `Content-Length` named.
pub async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return buf;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One-connection HTTP server answering with `response` verbatim. The
/// receiver yields the raw request it got.
pub async fn spawn_http_server(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let _ = tx.send(request);
        let _ = socket.write_all(response).await;
        let _ = socket.shutdown().await;
    });
    (addr, rx)
}

pub fn tls_acceptor() -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY.to_vec())),
        )
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// HTTPS server with the self-signed fixture; serves `response` to every
/// connection that completes a handshake.
pub async fn spawn_https_server(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tls_acceptor();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                read_request(&mut tls).await;
                let _ = tls.write_all(response).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

/// TLS line echo server with the self-signed fixture, one connection.
pub async fn spawn_tls_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tls_acceptor();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        if let Ok(tls) = acceptor.accept(socket).await {
            echo_lines(tls).await;
        }
    });
    addr
}

/// What a fake SOCKS5 proxy saw from its client.
#[derive(Debug, Default, Clone)]
pub struct SocksLog {
    pub methods: Vec<u8>,
    pub atyp: u8,
    pub target: String,
    pub port: u16,
    /// Tunneled bytes from the client, after the handshake
    pub upstream: Vec<u8>,
}

/// One-connection SOCKS5 proxy. Every CONNECT goes to `upstream` regardless
/// of the requested target, unless `reject` names a reply code to refuse with.
pub async fn spawn_socks_proxy(
    upstream: SocketAddr,
    reject: Option<u8>,
) -> (SocketAddr, Arc<Mutex<SocksLog>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(SocksLog::default()));
    let shared = log.clone();
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], 5);
        let mut methods = vec![0u8; usize::from(greeting[1])];
        client.read_exact(&mut methods).await.unwrap();
        client.write_all(&[5, 0]).await.unwrap();

        let mut request = [0u8; 4];
        client.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..3], &[5, 1, 0]);
        let target = match request[3] {
            1 => {
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await.unwrap();
                std::net::Ipv4Addr::from(ip).to_string()
            }
            3 => {
                let len = client.read_u8().await.unwrap();
                let mut name = vec![0u8; usize::from(len)];
                client.read_exact(&mut name).await.unwrap();
                String::from_utf8(name).unwrap()
            }
            4 => {
                let mut ip = [0u8; 16];
                client.read_exact(&mut ip).await.unwrap();
                std::net::Ipv6Addr::from(ip).to_string()
            }
            other => panic!("unexpected address type {}", other),
        };
        let port = client.read_u16().await.unwrap();
        {
            let mut log = shared.lock().unwrap();
            log.methods = methods;
            log.atyp = request[3];
            log.target = target;
            log.port = port;
        }

        if let Some(code) = reject {
            client
                .write_all(&[5, code, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            return;
        }

        let upstream_conn = TcpStream::connect(upstream).await.unwrap();
        client
            .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0])
            .await
            .unwrap();
        relay(client, upstream_conn, shared).await;
    });
    (addr, log)
}

async fn relay(client: TcpStream, upstream: TcpStream, log: Arc<Mutex<SocksLog>>) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let outbound = async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            log.lock().unwrap().upstream.extend_from_slice(&buf[..n]);
            if upstream_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = upstream_write.shutdown().await;
    };
    let inbound = async move {
        let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    };
    tokio::join!(outbound, inbound);
}
