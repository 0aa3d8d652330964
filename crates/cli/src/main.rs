use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnelwire::{Client, Config, Fetched, OutputTarget, Request};

const QUIT_LINE: &str = "/quit";

#[derive(Parser, Debug)]
#[command(name = "tunnelwire")]
#[command(version, about = "Fetch URLs and open raw TCP sessions, optionally through SOCKS5 or Tor")]
struct Cli {
    /// Use the local Tor SOCKS port (9150 on Windows, 9050 elsewhere)
    #[arg(short, long, global = true, conflicts_with = "proxy")]
    tor: bool,

    /// socks5h://host:port or socks5://host:port ($PROXY when unset)
    #[arg(short, long, global = true)]
    proxy: Option<String>,

    /// User-Agent header ($USER_AGENT when unset)
    #[arg(short, long, global = true)]
    user_agent: Option<String>,

    /// Timeout in milliseconds for every network wait
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    timeout: Option<u32>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One HTTP(S) request, body to stdout or a file
    Fetch(FetchArgs),
    /// Interactive line session: each stdin line is sent, then one reply is read
    Session(SessionArgs),
}

#[derive(Args, Debug)]
struct FetchArgs {
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra headers, e.g. "accept=*/*;x-token=abc"
    #[arg(short = 'H', long)]
    headers: Option<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// File path for the body; "-" for stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Skip certificate and hostname checks
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Print the status line and headers only
    #[arg(long, conflicts_with = "output")]
    head: bool,
}

#[derive(Args, Debug)]
struct SessionArgs {
    host: String,
    port: u16,

    #[arg(long)]
    tls: bool,

    /// Skip certificate and hostname checks
    #[arg(short = 'k', long, requires = "tls")]
    insecure: bool,

    /// Read once before sending anything, for servers that greet first
    #[arg(long)]
    read_first: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::default().with_verbose(self.verbose);
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout_ms(timeout);
        }
        if self.tor {
            config = config.with_tor();
        }
        config
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "tunnelwire=debug"
    } else {
        "tunnelwire=warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let client = Client::new(cli.config())?;
    if let Some(proxy) = &cli.proxy {
        client
            .set_proxy(proxy)
            .with_context(|| format!("invalid proxy {:?}", proxy))?;
    }

    let effective = client.effective_config();
    match &effective.proxy {
        Some(proxy) => info!("Routing through {}", proxy),
        None => info!("Connecting directly"),
    }

    match cli.command {
        Command::Fetch(args) => fetch(&client, args).await,
        Command::Session(args) => session(&client, args).await,
    }
}

fn build_request(args: &FetchArgs) -> Result<Request> {
    let mut request = Request::new(&args.method, args.url.clone());
    if let Some(headers) = &args.headers {
        request = request
            .with_header_spec(headers)
            .with_context(|| format!("invalid header spec {:?}", headers))?;
    }
    if let Some(data) = &args.data {
        request = request.with_body(data.clone().into_bytes());
    }
    if args.insecure {
        request = request.allow_insecure_tls();
    }
    Ok(request)
}

async fn fetch(client: &Client, args: FetchArgs) -> Result<()> {
    let request = build_request(&args)?;

    if args.head {
        let head = client.fetch_head(&request).await?;
        tokio::io::stdout().write_all(&head.raw).await?;
        return Ok(());
    }

    let output = OutputTarget::from(args.output.as_deref());
    match client.fetch_into(&request, output).await? {
        Fetched::Buffered(response) => {
            if !response.head.is_success() {
                eprintln!("{}", status_line(response.status(), &response.head.reason));
            }
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&response.body).await?;
            stdout.flush().await?;
        }
        Fetched::Written { head, path, bytes } => {
            eprintln!(
                "{} {} bytes written to {}",
                status_line(head.status, &head.reason),
                bytes,
                path.display()
            );
        }
    }
    Ok(())
}

fn status_line(status: u16, reason: &str) -> String {
    let text = format!("{} {}", status, reason);
    match status {
        200..=299 => text.green().to_string(),
        300..=399 => text.yellow().to_string(),
        _ => text.red().bold().to_string(),
    }
}

async fn session(client: &Client, args: SessionArgs) -> Result<()> {
    let handle = client
        .connect(&args.host, args.port, args.tls, args.insecure)
        .await?;
    eprintln!("{} session {} to {}:{}", "connected".green(), handle, args.host, args.port);

    let result = relay_lines(client, handle, args.read_first).await;

    if let Err(e) = client.disconnect(handle).await {
        eprintln!("{} {}", "disconnect:".yellow(), e);
    }
    eprintln!("disconnected: {}", handle);
    result
}

/// Sends each stdin line and prints one reply. Stops after `/quit`, at end
/// of input, or once the peer closes.
async fn relay_lines(client: &Client, handle: tunnelwire::Handle, read_first: bool) -> Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut stdout = tokio::io::stdout();

    if read_first && !print_reply(client, handle, &mut buf, &mut stdout).await? {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let written = client.write(handle, format!("{}\n", line).as_bytes()).await?;
        info!("wrote {} bytes", written);

        if line == QUIT_LINE {
            break;
        }
        if !print_reply(client, handle, &mut buf, &mut stdout).await? {
            break;
        }
    }
    Ok(())
}

/// Returns false once the peer has closed its side.
async fn print_reply(
    client: &Client,
    handle: tunnelwire::Handle,
    buf: &mut [u8],
    stdout: &mut tokio::io::Stdout,
) -> Result<bool> {
    let n = client
        .read(handle, buf)
        .await
        .map_err(|e| anyhow!("read failed: {}", e))?;
    if n == 0 {
        eprintln!("{}", "peer closed the connection".yellow());
        return Ok(false);
    }
    stdout.write_all(&buf[..n]).await?;
    stdout.flush().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_flags() {
        let cli = Cli::try_parse_from([
            "tunnelwire",
            "-t",
            "-u",
            "MyBrowser/1.0",
            "-c",
            "1800",
            "fetch",
            "-H",
            "foo=bar;bar=foo",
            "-o",
            "/dev/tty",
            "https://httpbin.org/get",
        ])
        .unwrap();
        assert!(cli.tor);
        let config = cli.config();
        assert_eq!(config.timeout_ms, 1800);
        assert_eq!(config.user_agent(), "MyBrowser/1.0");
        assert!(config.proxy.is_some());

        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let request = build_request(&args).unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.headers().len(), 2);
        assert_eq!(
            OutputTarget::from(args.output.as_deref()),
            OutputTarget::File("/dev/tty".into())
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(Cli::try_parse_from(["tunnelwire", "-c", "0", "fetch", "http://x/"]).is_err());
    }

    #[test]
    fn test_tor_conflicts_with_proxy() {
        assert!(Cli::try_parse_from([
            "tunnelwire",
            "--tor",
            "--proxy",
            "socks5h://127.0.0.1:1080",
            "fetch",
            "http://x/"
        ])
        .is_err());
    }

    #[test]
    fn test_session_flags() {
        let cli = Cli::try_parse_from(["tunnelwire", "session", "127.0.0.1", "8080", "--tls", "-k"]).unwrap();
        let Command::Session(args) = cli.command else {
            panic!("expected session");
        };
        assert_eq!(args.port, 8080);
        assert!(args.tls && args.insecure);

        assert!(Cli::try_parse_from(["tunnelwire", "session", "h", "1", "-k"]).is_err());
    }

    #[test]
    fn test_bad_header_spec() {
        let cli = Cli::try_parse_from(["tunnelwire", "fetch", "-H", "novalue", "http://x/"]).unwrap();
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        assert!(build_request(&args).is_err());
    }
}
