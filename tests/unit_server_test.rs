use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use garnet_tftp::core::handler::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
use garnet_tftp::{Server, SocketFamily, TftpError};
use tokio::net::UdpSocket;
use tokio_test::assert_ok;

struct NopRead;

#[async_trait]
impl ReadHandler for NopRead {
    async fn serve(&self, _req: &mut ReadRequest) {}
}

struct NopWrite;

#[async_trait]
impl WriteHandler for NopWrite {
    async fn receive(&self, _req: &mut WriteRequest) {}
}

#[tokio::test]
async fn test_negative_retransmit_rejected() {
    let err = Server::builder("127.0.0.1:0")
        .retransmit(-1)
        .build()
        .unwrap_err();
    assert!(matches!(err, TftpError::InvalidRetransmit));
}

#[tokio::test]
async fn test_zero_and_positive_retransmit_accepted() {
    assert_ok!(Server::builder("127.0.0.1:0").retransmit(0).build());
    assert_ok!(Server::builder("127.0.0.1:0").retransmit(25).build());
}

#[tokio::test]
async fn test_local_addr_unavailable_before_start() {
    let server = Server::builder("127.0.0.1:0").build().unwrap();
    let err = server.local_addr().unwrap_err();
    assert!(matches!(err, TftpError::AddressNotAvailable));
}

#[tokio::test]
async fn test_serve_without_handlers_fails() {
    let server = Server::builder("127.0.0.1:0").build().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let err = server.serve(socket).await.unwrap_err();
    assert!(matches!(err, TftpError::NoRegisteredHandlers));
}

#[tokio::test]
async fn test_registry_present_only_in_single_port_mode() {
    let server = Server::builder("127.0.0.1:0").build().unwrap();
    assert!(server.registry().is_none());

    let server = Server::builder("127.0.0.1:0")
        .single_port(true)
        .build()
        .unwrap();
    assert!(server.registry().is_some());
}

#[tokio::test]
async fn test_close_stops_receive_loop_gracefully() {
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.read_handler(Arc::new(NopRead));
    let server = Arc::new(server);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(socket).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("receive loop did not stop after close");
    assert_ok!(result.unwrap());
}

#[tokio::test]
async fn test_local_addr_available_after_start() {
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.write_handler(Arc::new(NopWrite));
    let server = Arc::new(server);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let expected = socket.local_addr().unwrap();

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(socket).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.local_addr().unwrap(), expected);
    server.close().unwrap();
    let _ = serving.await;
}

#[tokio::test]
async fn test_listen_and_serve_resolves_and_binds() {
    let mut server = Server::builder("127.0.0.1:0")
        .family(SocketFamily::V4)
        .build()
        .unwrap();
    server.read_handler(Arc::new(NopRead));
    let server = Arc::new(server);

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_and_serve().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let addr = server.local_addr().unwrap();
    assert!(addr.is_ipv4());
    assert_ne!(addr.port(), 0);

    server.close().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("receive loop did not stop after close");
    assert_ok!(result.unwrap());
}
