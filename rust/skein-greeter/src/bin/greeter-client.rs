//! Interactive greeter client.
//!
//! Run with: cargo run --bin greeter-client -- --addr localhost:50051

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use clap::Parser;
use skein_greeter::interceptors::{StreamClientLogger, UnaryClientLogger};
use skein_greeter::{GreeterClient, HelloRequest, init_tracing};
use skein_session::{CallOptions, Client};
use skein_stream::{StreamConfig, connect};
use skein_types::Metadata;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Input = Lines<BufReader<Stdin>>;

/// Names read for the client-streaming and bidi modes.
const NAMES_PER_STREAM: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "greeter-client")]
#[command(about = "Interactive greeter demo client")]
struct Args {
    /// The address to connect to
    #[arg(long, default_value = "localhost:50051")]
    addr: String,

    /// Name used when an empty line is entered
    #[arg(long, default_value = "world")]
    name: String,

    /// Deadline of UnaryHello, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    unary_timeout_ms: u64,

    /// Deadline of HelloServerStream, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    server_stream_timeout_ms: u64,

    /// Deadline of HelloClientStream, in milliseconds
    #[arg(long, default_value_t = 100_000)]
    client_stream_timeout_ms: u64,

    /// Deadline of HelloBiStreams, in milliseconds
    #[arg(long, default_value_t = 100_000)]
    bidi_timeout_ms: u64,
}

impl Args {
    fn options(&self, kind: &str, timeout_ms: u64) -> CallOptions {
        CallOptions::new()
            .with_metadata(Metadata::from_pairs([("type", kind), ("from", "client")]))
            .with_timeout(Duration::from_millis(timeout_ms))
    }
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
    let conn = connect(args.addr.as_str(), StreamConfig::default()).await?;
    let client = GreeterClient::new(
        Client::builder(conn)
            .unary_interceptor(UnaryClientLogger)
            .stream_interceptor(StreamClientLogger)
            .build(),
    );
    info!("start gRPC-style client on {}", args.addr);

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        info!("1: send Request");
        info!("2: HelloServerStream");
        info!("3: HelloClientStream");
        info!("4: HelloBiStream");
        info!("5: exit");
        info!("please enter >");

        let Some(line) = input.next_line().await? else {
            break;
        };
        let result = match line.trim() {
            "1" => hello(&client, &args, &mut input).await,
            "2" => hello_server_stream(&client, &args, &mut input).await,
            "3" => hello_client_stream(&client, &args, &mut input).await,
            "4" => hello_bi_streams(&client, &args, &mut input).await,
            "5" => {
                info!("bye.");
                break;
            }
            other => {
                warn!("unknown command {other:?}");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("{err}");
        }
    }
    Ok(())
}

/// Read one name, falling back to `--name` on an empty line.
async fn read_name(input: &mut Input, args: &Args) -> Result<String, BoxError> {
    let line = input.next_line().await?.ok_or("stdin closed")?;
    let name = line.trim();
    if name.is_empty() {
        return Ok(args.name.clone());
    }
    Ok(name.to_string())
}

async fn hello(client: &GreeterClient, args: &Args, input: &mut Input) -> Result<(), BoxError> {
    info!("Please enter your name.");
    let name = read_name(input, args).await?;

    let response = client
        .unary_hello(
            HelloRequest::new(name),
            args.options("unary", args.unary_timeout_ms),
        )
        .await?;
    info!("header: {}", response.header);
    info!("trailer: {}", response.trailer);
    info!("Greeting: {}", response.message.message);
    Ok(())
}

async fn hello_server_stream(
    client: &GreeterClient,
    args: &Args,
    input: &mut Input,
) -> Result<(), BoxError> {
    info!("Please enter your name.");
    let name = read_name(input, args).await?;

    let stream = client
        .hello_server_stream(
            HelloRequest::new(name),
            args.options("stream", args.server_stream_timeout_ms),
        )
        .await?;
    while let Some(reply) = stream.recv().await? {
        info!("{}", reply.message);
    }
    info!("all the responses have already received.");
    Ok(())
}

async fn hello_client_stream(
    client: &GreeterClient,
    args: &Args,
    input: &mut Input,
) -> Result<(), BoxError> {
    let stream = client
        .hello_client_stream(args.options("stream", args.client_stream_timeout_ms))
        .await?;

    info!("Please enter {NAMES_PER_STREAM} names.");
    for _ in 0..NAMES_PER_STREAM {
        let name = read_name(input, args).await?;
        stream.send(HelloRequest::new(name)).await?;
    }

    let response = stream.close_and_recv().await?;
    info!("{}", response.message.message);
    Ok(())
}

/// Counts finished directions of a bidi call.
#[derive(Debug, Default)]
struct Halves(AtomicU8);

impl Halves {
    /// Mark one direction finished. True for the call that finishes the
    /// second one.
    fn finish_one(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) == 1
    }
}

async fn hello_bi_streams(
    client: &GreeterClient,
    args: &Args,
    input: &mut Input,
) -> Result<(), BoxError> {
    let cancel = CancellationToken::new();
    let call = Arc::new(
        client
            .hello_bi_streams(
                args.options("stream", args.bidi_timeout_ms)
                    .with_cancellation(cancel.clone()),
            )
            .await?,
    );
    let halves = Arc::new(Halves::default());

    // Receive in a task of its own so replies show up while names are typed.
    let receiving = {
        let call = Arc::clone(&call);
        let halves = Arc::clone(&halves);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = async {
                info!("{}", call.header().await?);
                while let Some(reply) = call.recv().await? {
                    info!("{}", reply.message);
                }
                Ok::<_, skein_types::CallError>(())
            }
            .await;
            if result.is_err() {
                cancel.cancel();
            }
            if halves.finish_one() {
                if let Some(trailer) = call.trailer() {
                    info!("{trailer}");
                }
            }
            result
        })
    };

    info!("Please enter {NAMES_PER_STREAM} names.");
    let sending = async {
        for _ in 0..NAMES_PER_STREAM {
            let name = tokio::select! {
                name = read_name(input, args) => name?,
                _ = cancel.cancelled() => return Ok(()),
            };
            call.send(HelloRequest::new(name)).await?;
        }
        call.close_send().await?;
        Ok::<_, BoxError>(())
    }
    .await;
    if sending.is_err() {
        cancel.cancel();
    }
    if halves.finish_one() {
        if let Some(trailer) = call.trailer() {
            info!("{trailer}");
        }
    }

    let received = receiving.await?;
    sending?;
    received?;
    Ok(())
}
