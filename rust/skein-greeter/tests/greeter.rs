//! The greeter service end to end over an in-memory pipe.

use std::sync::Arc;
use std::time::Duration;

use skein_greeter::interceptors::{
    StreamClientLogger, StreamServerLogger, UnaryClientLogger, UnaryServerLogger,
};
use skein_greeter::{
    DefaultGreeter, GreeterClient, GreeterServer, HelloReply, HelloRequest, UnimplementedGreeter,
};
use skein_session::{CallOptions, Client, Server, ServerBuilder};
use skein_stream::{StreamConfig, duplex_pair};
use skein_types::{CallError, Code, ErrorKind, Metadata};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn server(greeter: DefaultGreeter) -> Server {
    ServerBuilder::new()
        .add_service(GreeterServer::new(greeter).into_service())
        .unwrap()
        .build()
}

fn client_for(server: Server) -> GreeterClient {
    GreeterClient::from_connection(duplex_pair(server, StreamConfig::default()))
}

fn greeter() -> GreeterClient {
    client_for(server(DefaultGreeter::new().with_stream_delay(Duration::ZERO)))
}

fn stream_options() -> CallOptions {
    CallOptions::new()
        .with_metadata(Metadata::from_pairs([("type", "stream"), ("from", "client")]))
        .with_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn unary_hello_greets_with_header_and_trailer() {
    init_tracing();
    let client = greeter();

    let response = client
        .unary_hello(
            HelloRequest::new("test"),
            CallOptions::new()
                .with_metadata(Metadata::from_pairs([("type", "unary"), ("from", "client")]))
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(response.message, HelloReply::new("Hello, test!"));
    assert_eq!(response.header.get("type"), Some("unary"));
    assert_eq!(response.header.get("from"), Some("server"));
    assert_eq!(response.header.get("in"), Some("header"));
    assert_eq!(response.trailer.get("in"), Some("trailer"));
}

#[tokio::test]
async fn unary_hello_validates_the_name() {
    init_tracing();
    let client = greeter();

    for (name, message) in [("", "name is none"), ("testtest", "name is long")] {
        let err = client
            .unary_hello(HelloRequest::new(name), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Application);
        let status = err.as_status().unwrap();
        assert_eq!(status.code, Code::InvalidArgument);
        assert_eq!(status.message, message);
    }
}

#[tokio::test]
async fn server_stream_sends_five_ordered_replies() {
    init_tracing();
    let client = greeter();

    let stream = client
        .hello_server_stream(HelloRequest::new("test"), stream_options())
        .await
        .unwrap();
    let mut replies = Vec::new();
    while let Some(reply) = stream.recv().await.unwrap() {
        replies.push(reply.message);
    }
    assert_eq!(
        replies,
        [
            "[0] Hello, test!",
            "[1] Hello, test!",
            "[2] Hello, test!",
            "[3] Hello, test!",
            "[4] Hello, test!",
        ]
    );
    // End of stream is sticky.
    assert!(stream.recv().await.unwrap().is_none());
    assert!(stream.trailer().is_some());
}

#[tokio::test(start_paused = true)]
async fn server_stream_is_paced_by_the_stream_delay() {
    init_tracing();
    let client = client_for(server(DefaultGreeter::new()));

    let started = tokio::time::Instant::now();
    let stream = client
        .hello_server_stream(HelloRequest::new("test"), stream_options())
        .await
        .unwrap();
    let mut count = 0;
    while stream.recv().await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 5);
    assert!(started.elapsed() >= Duration::from_secs(4));
}

#[tokio::test]
async fn client_stream_joins_every_name() {
    init_tracing();
    let client = greeter();

    let stream = client.hello_client_stream(stream_options()).await.unwrap();
    for _ in 0..5 {
        stream.send(HelloRequest::new("test")).await.unwrap();
    }
    let response = stream.close_and_recv().await.unwrap();
    assert_eq!(response.message.message, "Hello, [test test test test test]!");
}

#[tokio::test]
async fn bidi_sends_everything_before_reading() {
    init_tracing();
    let client = greeter();

    let call = client.hello_bi_streams(stream_options()).await.unwrap();
    let names = ["a", "b", "c", "d", "e"];
    for name in names {
        call.send(HelloRequest::new(name)).await.unwrap();
    }
    call.close_send().await.unwrap();

    let header = call.header().await.unwrap();
    assert_eq!(header.get("type"), Some("stream"));
    assert_eq!(header.get("in"), Some("header"));

    let mut replies = Vec::new();
    while let Some(reply) = call.recv().await.unwrap() {
        replies.push(reply.message);
    }
    let expected: Vec<String> = names.iter().map(|n| format!("Hello, {n}!")).collect();
    assert_eq!(replies, expected);
    assert_eq!(call.trailer().unwrap().get("in"), Some("trailer"));
}

#[tokio::test]
async fn bidi_header_arrives_before_any_reply() {
    init_tracing();
    let client = greeter();
    let call = client.hello_bi_streams(stream_options()).await.unwrap();

    // Nothing sent yet, so nothing can be received either.
    let header = tokio::time::timeout(Duration::from_secs(5), call.header())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.get("from"), Some("server"));

    call.close_send().await.unwrap();
    assert!(call.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn bidi_send_and_receive_from_separate_tasks() {
    init_tracing();
    let client = greeter();
    let call = Arc::new(client.hello_bi_streams(stream_options()).await.unwrap());

    let receiver = {
        let call = Arc::clone(&call);
        tokio::spawn(async move {
            let mut replies = Vec::new();
            while let Some(reply) = call.recv().await? {
                replies.push(reply.message);
            }
            Ok::<_, CallError>(replies)
        })
    };

    for i in 0..20 {
        call.send(HelloRequest::new(format!("n{i}"))).await.unwrap();
        if i % 7 == 0 {
            tokio::task::yield_now().await;
        }
    }
    call.close_send().await.unwrap();

    let replies = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(replies.len(), 20);
    assert_eq!(replies[0], "Hello, n0!");
    assert_eq!(replies[19], "Hello, n19!");
}

#[tokio::test]
async fn unimplemented_greeter_rejects_every_method() {
    init_tracing();
    let server = ServerBuilder::new()
        .add_service(GreeterServer::new(UnimplementedGreeter).into_service())
        .unwrap()
        .build();
    let client = client_for(server);

    let err = client
        .unary_hello(HelloRequest::new("test"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let stream = client
        .hello_server_stream(HelloRequest::new("test"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(stream.recv().await.unwrap_err().code(), Code::Unimplemented);

    let stream = client.hello_client_stream(CallOptions::new()).await.unwrap();
    assert_eq!(
        stream.close_and_recv().await.unwrap_err().code(),
        Code::Unimplemented
    );

    let call = client.hello_bi_streams(CallOptions::new()).await.unwrap();
    let err = call.recv().await.unwrap_err();
    assert_eq!(
        err.as_status().map(|s| s.message.as_str()),
        Some("method HelloBiStreams not implemented")
    );
}

#[tokio::test]
async fn logging_interceptors_pass_results_through() {
    init_tracing();
    let server = ServerBuilder::new()
        .unary_interceptor(UnaryServerLogger)
        .stream_interceptor(StreamServerLogger)
        .add_service(
            GreeterServer::new(DefaultGreeter::new().with_stream_delay(Duration::ZERO))
                .into_service(),
        )
        .unwrap()
        .build();
    let client = GreeterClient::new(
        Client::builder(duplex_pair(server, StreamConfig::default()))
            .unary_interceptor(UnaryClientLogger)
            .stream_interceptor(StreamClientLogger)
            .build(),
    );

    let response = client
        .unary_hello(HelloRequest::new("bob"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.message.message, "Hello, bob!");

    let err = client
        .unary_hello(HelloRequest::new(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.as_status().unwrap().message, "name is none");

    let call = client.hello_bi_streams(stream_options()).await.unwrap();
    call.send(HelloRequest::new("amy")).await.unwrap();
    assert_eq!(call.recv().await.unwrap().unwrap().message, "Hello, amy!");
    call.close_send().await.unwrap();
    assert!(call.recv().await.unwrap().is_none());
    assert_eq!(call.header().await.unwrap().get("from"), Some("server"));
}
