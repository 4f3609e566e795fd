//! Loopback tests for the TCP bindings.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use rpilot_network::tcp::{bind_line_listener, subscribe, MAX_FRAME_LEN};
use rpilot_network::{BroadcastSender, Filters, FunnelSender, TcpOptions, TcpPublisher, TcpPusher};
use rpilot_protocol::Address;

fn options() -> TcpOptions {
    TcpOptions {
        queue_capacity: 64,
        reconnect_delay: Duration::from_millis(50),
    }
}

async fn wait_for_subscribers(publisher: &TcpPublisher, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while publisher.subscriber_count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscribers never completed the handshake");
}

#[tokio::test]
async fn test_broadcast_filters_by_target() {
    let publisher = TcpPublisher::bind("127.0.0.1:0", options()).await.unwrap();
    let addr = publisher.local_addr().to_string();

    let p1 = Address::new("pilot_1").unwrap();
    let mut inbound = subscribe(addr, Filters::for_node(&p1), options());
    wait_for_subscribers(&publisher, 1).await;

    publisher
        .send(&Address::new("pilot_2").unwrap(), Bytes::from_static(b"{\"n\":1}"))
        .unwrap();
    publisher.send(&p1, Bytes::from_static(b"{\"n\":2}")).unwrap();
    publisher
        .send(&Address::broadcast(), Bytes::from_static(b"{\"n\":3}"))
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from_static(b"{\"n\":2}"));
    assert_eq!(second, Bytes::from_static(b"{\"n\":3}"));
}

#[tokio::test]
async fn test_funnel_delivers_lines_in_order() {
    let (addr, mut inbound) = bind_line_listener("127.0.0.1:0", 64).await.unwrap();
    let pusher = TcpPusher::connect(addr.to_string(), options());

    pusher.push(Bytes::from_static(b"{\"seq\":1}")).unwrap();
    pusher.push(Bytes::from_static(b"{\"seq\":2}")).unwrap();

    let a = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a, Bytes::from_static(b"{\"seq\":1}"));
    assert_eq!(b, Bytes::from_static(b"{\"seq\":2}"));
}

#[tokio::test]
async fn test_publish_without_subscribers_is_ok() {
    let publisher = TcpPublisher::bind("127.0.0.1:0", options()).await.unwrap();
    assert!(publisher
        .send(&Address::broadcast(), Bytes::from_static(b"{}"))
        .is_ok());
    assert_eq!(publisher.subscriber_count(), 0);
}

async fn recv(inbound: &mut rpilot_network::Inbound) -> Bytes {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("frame never arrived")
        .expect("inbound closed")
}

#[tokio::test]
async fn test_bad_line_does_not_end_connection() {
    let (addr, mut inbound) = bind_line_listener("127.0.0.1:0", 64).await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"{\"key\":\"DATA\",\"value\":1}\n").await.unwrap();
    client.write_all(b"\xff\xfe garbage\n").await.unwrap();
    client.write_all(&vec![b'x'; MAX_FRAME_LEN + 1]).await.unwrap();
    client.write_all(b"\n{\"key\":\"DATA\",\"value\":2}\n").await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(recv(&mut inbound).await, Bytes::from_static(b"{\"key\":\"DATA\",\"value\":1}"));
    // Passed through for the node to reject as malformed.
    let garbage = recv(&mut inbound).await;
    assert_eq!(garbage, Bytes::from_static(b"\xff\xfe garbage"));
    assert!(rpilot_protocol::decode(&garbage).is_err());
    assert_eq!(recv(&mut inbound).await, Bytes::from_static(b"{\"key\":\"DATA\",\"value\":2}"));
}

#[tokio::test]
async fn test_subscriber_survives_bad_broadcast_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let p1 = Address::new("pilot_1").unwrap();
    let mut inbound = subscribe(addr, Filters::for_node(&p1), options());

    let (mut stream, _) = listener.accept().await.unwrap();
    // Skip the subscription line.
    let mut hello = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        hello.push(byte[0]);
    }
    assert!(String::from_utf8(hello).unwrap().contains("pilot_1"));

    stream.write_all(b"\xff\xfe\t{\"n\":0}\n").await.unwrap();
    stream.write_all(b"pilot_1\t\xff\n").await.unwrap();
    stream.write_all(b"no target here\n").await.unwrap();
    stream.write_all(b"pilot_1\t{\"n\":1}\n").await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(recv(&mut inbound).await, Bytes::from_static(b"\xff"));
    assert_eq!(recv(&mut inbound).await, Bytes::from_static(b"{\"n\":1}"));
}
