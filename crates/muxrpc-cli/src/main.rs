//! # MuxRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Host the demo methods
//! muxrpc serve --bind 127.0.0.1:7000
//!
//! # Make one unary call (response bytes go to stdout)
//! muxrpc call 127.0.0.1:7000 echo --data hello
//!
//! # With a deadline, retries and metadata
//! muxrpc call 127.0.0.1:7000 upper -d hi --timeout-ms 500 --max-attempts 5 -m tenant=acme
//! ```

use std::io::Write;

use anyhow::Result;
use argh::FromArgs;
use bytes::Bytes;
use muxrpc_client::{Client, ClientConfig};
use tokio::net::TcpListener;

#[derive(FromArgs)]
/// muxrpc - multiplexed RPC runtime
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

// Hosts `muxrpc_cli::demo_server` until interrupted.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo methods (echo, upper, echo_stream, _ping)
struct ServeArgs {
    /// address to listen on (port 0 picks a free port)
    #[argh(option, short = 'b', default = "\"127.0.0.1:7000\".into()")]
    bind: String,
}

// Prints the raw response to stdout so the output can be piped. Failures
// go to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make one unary call
struct CallArgs {
    /// endpoint address, e.g. 127.0.0.1:7000
    #[argh(positional)]
    endpoint: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// request payload, sent as UTF-8 bytes
    #[argh(option, short = 'd', default = "String::new()")]
    data: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,

    /// total attempts including the first
    #[argh(option, long = "max-attempts", default = "3")]
    max_attempts: u32,

    /// metadata pair as key=value, may be repeated
    #[argh(option, short = 'm', long = "metadata")]
    metadata: Vec<String>,

    /// log client activity to stderr
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` keeps its output clean for piping unless asked to log.
    let wants_logs = match &cli.command {
        Commands::Serve(_) => true,
        Commands::Call(args) => args.verbose,
    };
    if wants_logs {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind(&args.bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", args.bind, e))?;
    let server = muxrpc_cli::demo_server();
    tracing::info!(addr = %listener.local_addr()?, methods = ?server.methods(), "muxrpc serving");

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            server.shutdown();
        }
    }
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let options = muxrpc_cli::call_options(args.timeout_ms, args.max_attempts, &args.metadata)?;

    let client = Client::new(ClientConfig::default());
    let result = client
        .invoke(&args.endpoint, &args.method, Bytes::from(args.data), options)
        .await;
    client.shutdown();

    let response = result.map_err(|e| {
        let status = e.status();
        anyhow::anyhow!("{} {}: {}", args.method, status.code, status.message)
    })?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response)?;
    stdout.write_all(b"\n")?;
    Ok(())
}
