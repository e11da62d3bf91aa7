//! Calls over loopback TCP and the in-memory duplex pipe.

use std::time::Duration;

use facet::Facet;
use skein_session::{
    BidiStream, CallOptions, Client, Server, ServerBuilder, ServerContext, ServiceDefinition,
    bidi_route, unary_route,
};
use skein_stream::{StreamConfig, connect, duplex_pair, serve};
use skein_types::{CallShape, ErrorKind, Metadata, MethodDescriptor, ServiceDescriptor, Status};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Facet)]
struct Ping {
    seq: u32,
    body: String,
}

static METHODS: [MethodDescriptor; 2] = [
    MethodDescriptor::new("/test.Pinger/Ping", CallShape::Unary),
    MethodDescriptor::new("/test.Pinger/Volley", CallShape::Bidi),
];

static SERVICE: ServiceDescriptor = ServiceDescriptor {
    name: "test.Pinger",
    methods: &METHODS,
};

fn pinger() -> Server {
    let service = ServiceDefinition::new(SERVICE)
        .route(unary_route(&METHODS[0], |ctx: ServerContext, ping: Ping| async move {
            ctx.set_trailer(Metadata::from_pairs([("seen", ping.seq.to_string())]))?;
            Ok::<_, Status>(Ping {
                seq: ping.seq + 1,
                body: ping.body,
            })
        }))
        .route(bidi_route(&METHODS[1], |stream: BidiStream<Ping, Ping>| async move {
            while let Some(ping) = stream.recv().await? {
                stream
                    .send(Ping {
                        seq: ping.seq + 1,
                        body: ping.body,
                    })
                    .await?;
            }
            Ok::<_, Status>(())
        }));
    ServerBuilder::new().add_service(service).unwrap().build()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn unary_over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(
        listener,
        pinger(),
        StreamConfig::default(),
        shutdown.clone(),
    ));

    let client = Client::new(connect(addr, StreamConfig::default()).await.unwrap());
    let body = "x".repeat(10_000);
    let response = client
        .unary::<Ping, Ping>(
            &METHODS[0],
            Ping {
                seq: 41,
                body: body.clone(),
            },
            CallOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(response.message, Ping { seq: 42, body });
    assert_eq!(response.trailer.get("seen"), Some("41"));

    shutdown.cancel();
    server.await.unwrap().unwrap();
    let conn = client.connection().clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while !conn.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Live connections are stopped with the listener.
    let err = client
        .unary::<Ping, Ping>(
            &METHODS[0],
            Ping {
                seq: 0,
                body: String::new(),
            },
            CallOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn concurrent_calls_share_one_duplex_connection() {
    init_tracing();
    let client = Client::new(duplex_pair(pinger(), StreamConfig::default()));

    let volleys = (0..4u32).map(|n| {
        let client = client.clone();
        tokio::spawn(async move {
            let call = client
                .bidi_streaming::<Ping, Ping>(&METHODS[1], CallOptions::new())
                .await?;
            let mut last = 0;
            for seq in (n * 100)..(n * 100 + 10) {
                call.send(Ping {
                    seq,
                    body: format!("volley {n}"),
                })
                .await?;
                let reply = call.recv().await?.expect("reply");
                assert_eq!(reply.seq, seq + 1);
                last = reply.seq;
            }
            call.close_send().await?;
            assert!(call.recv().await?.is_none());
            Ok::<_, skein_types::CallError>(last)
        })
    });

    let mut lasts = Vec::new();
    for volley in volleys.collect::<Vec<_>>() {
        lasts.push(volley.await.unwrap().unwrap());
    }
    assert_eq!(lasts, [10, 110, 210, 310]);
}
