#![deny(unsafe_code)]

//! Byte-stream transport for skein.
//!
//! Runs skein connections over any async byte stream (TCP sockets, in-memory
//! duplex pipes) using length-prefixed postcard frames.
//!
//! ```ignore
//! use skein_stream::{StreamConfig, connect};
//!
//! let conn = connect("127.0.0.1:50051", StreamConfig::default()).await?;
//! let client = skein_session::Client::new(conn);
//! ```

mod framing;

use std::io;

use skein_session::{
    CallAcceptor, ConnectionHandle, Driver, Role, Server, SessionConfig, establish, runtime,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FrameWriter, LengthPrefixed};

/// Settings for stream-based connections.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Largest encoded frame accepted or sent.
    pub max_frame_size: usize,
    pub session: SessionConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            session: SessionConfig::default(),
        }
    }
}

/// Set up a connection over `stream` without spawning anything.
pub fn establish_stream<S>(
    stream: S,
    role: Role,
    config: &StreamConfig,
    acceptor: Option<std::sync::Arc<dyn CallAcceptor>>,
) -> (ConnectionHandle, Driver<LengthPrefixed<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let transport = LengthPrefixed::with_max_frame_size(stream, config.max_frame_size);
    establish(transport, role, config.session.clone(), acceptor)
}

fn spawn_driver<S>(driver: Driver<LengthPrefixed<S>>, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    runtime::spawn(async move {
        match driver.run().await {
            Ok(()) => debug!(%peer, "connection closed"),
            Err(e) => warn!(%peer, "connection failed: {e}"),
        }
    });
}

/// Dial `addr` over TCP. The connection driver runs in a spawned task.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    config: StreamConfig,
) -> io::Result<ConnectionHandle> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?.to_string();
    debug!(%peer, "connected");

    let (handle, driver) = establish_stream(stream, Role::Initiator, &config, None);
    spawn_driver(driver, peer);
    Ok(handle)
}

/// Accept TCP connections and serve `server` on each until `shutdown` fires.
///
/// Shutting down also stops the live connections.
pub async fn serve(
    listener: TcpListener,
    server: Server,
    config: StreamConfig,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "serving");
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => {
                info!("server shutting down");
                return Ok(());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, "set_nodelay failed: {e}");
        }
        debug!(%addr, "accepted connection");

        let (handle, driver) = establish_stream(
            stream,
            Role::Acceptor,
            &config,
            Some(server.clone().into_acceptor()),
        );
        let stop = shutdown.clone();
        runtime::spawn(async move {
            let run = driver.run();
            tokio::pin!(run);
            let result = tokio::select! {
                result = &mut run => result,
                _ = stop.cancelled() => {
                    handle.shutdown();
                    run.await
                }
            };
            match result {
                Ok(()) => debug!(%addr, "connection closed"),
                Err(e) => warn!(%addr, "connection failed: {e}"),
            }
        });
    }
}

/// Connect a client to `server` over an in-memory pipe.
///
/// Both drivers run in spawned tasks. Returns the client's handle.
pub fn duplex_pair(server: Server, config: StreamConfig) -> ConnectionHandle {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client, client_driver) = establish_stream(client_io, Role::Initiator, &config, None);
    let (_server, server_driver) = establish_stream(
        server_io,
        Role::Acceptor,
        &config,
        Some(server.into_acceptor()),
    );
    spawn_driver(client_driver, "duplex-client".into());
    spawn_driver(server_driver, "duplex-server".into());
    client
}
