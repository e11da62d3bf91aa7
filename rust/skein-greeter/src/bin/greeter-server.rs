//! Serves the greeter over TCP.
//!
//! Run with: cargo run --bin greeter-server -- --port 50051

use std::time::Duration;

use clap::Parser;
use skein_greeter::interceptors::{StreamServerLogger, UnaryServerLogger};
use skein_greeter::{DefaultGreeter, GreeterServer, init_tracing};
use skein_session::ServerBuilder;
use skein_stream::{StreamConfig, serve};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "greeter-server")]
#[command(about = "Greeter demo server")]
struct Args {
    /// The server port
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Pause between HelloServerStream replies, in milliseconds
    #[arg(long, default_value_t = 1000)]
    stream_delay_ms: u64,

    /// Largest frame accepted from a client, in bytes
    #[arg(long, default_value_t = skein_stream::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_tracing("info");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<(), BoxError> {
    let greeter =
        DefaultGreeter::new().with_stream_delay(Duration::from_millis(args.stream_delay_ms));
    let server = ServerBuilder::new()
        .unary_interceptor(UnaryServerLogger)
        .stream_interceptor(StreamServerLogger)
        .add_service(GreeterServer::new(greeter).into_service())?
        .build();

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("server listening at {}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            stop.cancel();
        }
    });

    let config = StreamConfig {
        max_frame_size: args.max_frame_size,
        ..StreamConfig::default()
    };
    serve(listener, server, config, shutdown).await?;
    Ok(())
}
