//! Integration test: WebSocket session transport on loopback.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use localnet_protocol::{connect_session, EnvelopeCodec, ProtocolError, SessionListener};
use localnet_types::{Envelope, PeerId};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn handshake_and_envelope_on_loopback() {
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = SessionListener::bind(bind_addr).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        let (id, mut ws) = incoming.upgrade().await.unwrap();
        assert_eq!(id, PeerId::new("10"));

        let frame = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let envelope = EnvelopeCodec::new().decode(text.as_str()).unwrap();
        assert_eq!(
            envelope,
            Envelope::UserConnected {
                id: "10".into(),
                is_host: false
            }
        );

        let reply = EnvelopeCodec::new().encode(&Envelope::ServerStarted).unwrap();
        ws.send(Message::text(reply)).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let mut client = connect_session("127.0.0.1", port, &PeerId::new("10"))
        .await
        .unwrap();
    let hello = EnvelopeCodec::new()
        .encode(&Envelope::UserConnected {
            id: "10".into(),
            is_host: false,
        })
        .unwrap();
    client.send(Message::text(hello)).await.unwrap();

    let frame = client.next().await.unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text frame, got {frame:?}");
    };
    assert_eq!(
        EnvelopeCodec::new().decode(text.as_str()).unwrap(),
        Envelope::ServerStarted
    );

    server.await.unwrap();
}

#[tokio::test]
async fn missing_id_falls_back_to_remote_address() {
    let listener = SessionListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        let (id, _ws) = incoming.upgrade().await.unwrap();
        id
    });

    let url = format!("ws://127.0.0.1:{port}/ws");
    let (_client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert_eq!(server.await.unwrap(), PeerId::new("1"));
}

#[tokio::test]
async fn wrong_path_is_refused() {
    let listener = SessionListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        incoming.upgrade().await
    });

    let url = format!("ws://127.0.0.1:{port}/other?id=3");
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
    assert!(matches!(
        server.await.unwrap(),
        Err(ProtocolError::Handshake(_))
    ));
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    // Bind then drop to find a port with nothing listening.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let err = connect_session("127.0.0.1", port, &PeerId::new("1"))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err}");
}
