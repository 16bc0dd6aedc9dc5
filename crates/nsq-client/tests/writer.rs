// Writer scenarios against a scripted in-process nsqd.
mod support;

use nsq_client::{Config, Error, Writer};
use std::time::Duration;
use support::MockNsqd;

#[tokio::test]
async fn publish_waits_for_the_broker_ok() {
    let (listener, addr) = support::listen().await;
    let writer = Writer::new([addr], Config::default()).expect("writer");

    let mut nsqd = MockNsqd::accept(&listener).await;
    nsqd.handshake().await;

    let publish = tokio::spawn(async move {
        writer.publish("clicks", &b"hello"[..]).await.expect("publish");
        writer
    });

    let (line, body) = nsqd.read_command().await;
    assert_eq!(line, "PUB clicks");
    assert_eq!(body.as_deref(), Some(&b"hello"[..]));
    nsqd.send_response(b"OK").await;

    let writer = publish.await.expect("join");
    writer.close().await;
}

#[tokio::test]
async fn multi_publish_batches_bodies() {
    let (listener, addr) = support::listen().await;
    let writer = Writer::new([addr], Config::default()).expect("writer");

    let mut nsqd = MockNsqd::accept(&listener).await;
    nsqd.handshake().await;

    let publish = tokio::spawn(async move {
        writer
            .multi_publish("clicks", [&b"one"[..], &b"two"[..]])
            .await
            .expect("mpub");
        writer
    });

    let (line, body) = nsqd.read_command().await;
    assert_eq!(line, "MPUB clicks");
    let body = body.expect("mpub body");
    assert_eq!(&body[..4], &2u32.to_be_bytes());
    assert_eq!(&body[4..8], &3u32.to_be_bytes());
    assert_eq!(&body[8..11], b"one");
    assert_eq!(&body[11..15], &3u32.to_be_bytes());
    assert_eq!(&body[15..], b"two");
    nsqd.send_response(b"OK").await;

    let writer = publish.await.expect("join");
    writer.close().await;
}

#[tokio::test]
async fn deferred_publish_carries_the_delay() {
    let (listener, addr) = support::listen().await;
    let writer = Writer::new([addr], Config::default()).expect("writer");

    let mut nsqd = MockNsqd::accept(&listener).await;
    nsqd.handshake().await;

    let publish = tokio::spawn(async move {
        writer
            .deferred_publish("clicks", Duration::from_secs(60), &b"later"[..])
            .await
            .expect("dpub");
        writer
    });

    let (line, body) = nsqd.read_command().await;
    assert_eq!(line, "DPUB clicks 60000");
    assert_eq!(body.as_deref(), Some(&b"later"[..]));
    nsqd.send_response(b"OK").await;

    let writer = publish.await.expect("join");
    writer.close().await;
}

#[tokio::test]
async fn broker_error_fails_the_publish() {
    let (listener, addr) = support::listen().await;
    let writer = Writer::new([addr], Config::default()).expect("writer");

    let mut nsqd = MockNsqd::accept(&listener).await;
    nsqd.handshake().await;

    let publish = tokio::spawn(async move {
        let result = writer.publish("clicks", &b"bad"[..]).await;
        (writer, result)
    });

    let (line, _) = nsqd.read_command().await;
    assert_eq!(line, "PUB clicks");
    // A fatal error frame; the broker hangs up right after it.
    nsqd.send_error(b"E_BAD_MESSAGE PUB failed").await;

    let (writer, result) = publish.await.expect("join");
    let err = result.expect_err("publish must fail");
    assert!(matches!(err, Error::ConnectionLost(_)), "got {err:?}");
    writer.close().await;
}

#[tokio::test]
async fn publish_with_no_connections_fails_fast() {
    // An address nothing listens on: the writer comes up with a dead conn.
    let (listener, addr) = support::listen().await;
    drop(listener);
    let writer = Writer::new([addr], Config::default()).expect("writer");

    let err = writer
        .publish("clicks", &b"hello"[..])
        .await
        .expect_err("no connections");
    assert!(matches!(err, Error::NoConnections), "got {err:?}");
    writer.close().await;
}

#[tokio::test]
async fn invalid_topic_is_rejected_locally() {
    let (listener, addr) = support::listen().await;
    let writer = Writer::new([addr], Config::default()).expect("writer");
    let mut nsqd = MockNsqd::accept(&listener).await;
    nsqd.handshake().await;

    let err = writer
        .publish("not a topic!", &b"x"[..])
        .await
        .expect_err("invalid topic");
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    writer.close().await;
}
