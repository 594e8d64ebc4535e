use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use garnet_tftp::core::handler::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
use garnet_tftp::core::protocol::{Datagram, ErrorCode, Opcode, TransferMode};
use garnet_tftp::{Server, TftpError};
use tokio::net::UdpSocket;
use tokio::time::timeout;

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

async fn start(server: Server) -> (Arc<Server>, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let server = Arc::new(server);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(socket).await });
    }
    (server, addr)
}

async fn recv_datagram(socket: &UdpSocket) -> (Datagram, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    (Datagram::parse(&buf[..len]).unwrap(), from)
}

async fn assert_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 2048];
    let res = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(res.is_err(), "expected no reply, got one");
}

fn wrq(filename: &str) -> Datagram {
    Datagram::Request {
        opcode: Opcode::Wrq,
        filename: filename.to_string(),
        mode: TransferMode::Octet,
        options: Vec::new(),
    }
}

fn rrq(filename: &str) -> Datagram {
    Datagram::Request {
        opcode: Opcode::Rrq,
        filename: filename.to_string(),
        mode: TransferMode::Octet,
        options: Vec::new(),
    }
}

#[tokio::test]
async fn test_unclaimed_traffic_gets_unknown_tid_error() {
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.read_handler(Arc::new(NopRead));
    let (_server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Datagram::ack(1).to_bytes(), addr)
        .await
        .unwrap();

    let (reply, from) = recv_datagram(&client).await;
    assert_eq!(from, addr);
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::UnknownTransferId.as_u16()
    ));
    // Exactly one reply per offending datagram.
    assert_silence(&client).await;
}

#[tokio::test]
async fn test_unknown_tid_error_in_single_port_mode_without_entry() {
    let mut server = Server::builder("127.0.0.1:0")
        .single_port(true)
        .build()
        .unwrap();
    server.write_handler(Arc::new(NopWrite));
    let (_server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let data = Datagram::data(1, bytes::Bytes::from_static(b"stray"));
    client.send_to(&data.to_bytes(), addr).await.unwrap();

    let (reply, _) = recv_datagram(&client).await;
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::UnknownTransferId.as_u16()
    ));
}

#[tokio::test]
async fn test_runt_datagram_rejected_as_unknown_tid() {
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.read_handler(Arc::new(NopRead));
    let (_server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"\x00", addr).await.unwrap();

    let (reply, _) = recv_datagram(&client).await;
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::UnknownTransferId.as_u16()
    ));
}

#[tokio::test]
async fn test_read_request_without_read_handler_rejected() {
    let mut server = Server::builder("127.0.0.1:0")
        .single_port(true)
        .build()
        .unwrap();
    server.write_handler(Arc::new(NopWrite));
    let (server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.send_to(&rrq("f").to_bytes(), addr).await.unwrap();

    let (reply, _) = recv_datagram(&client).await;
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::IllegalOperation.as_u16()
    ));
    // No connection state is created for a rejected request.
    assert!(server.registry().unwrap().get(&client_addr).is_none());
    assert_silence(&client).await;
}

#[tokio::test]
async fn test_write_request_without_write_handler_rejected() {
    let mut server = Server::builder("127.0.0.1:0")
        .single_port(true)
        .build()
        .unwrap();
    server.read_handler(Arc::new(NopRead));
    let (server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.send_to(&wrq("f").to_bytes(), addr).await.unwrap();

    let (reply, _) = recv_datagram(&client).await;
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::IllegalOperation.as_u16()
    ));
    assert!(server.registry().unwrap().get(&client_addr).is_none());
}

#[tokio::test]
async fn test_rejection_applies_without_single_port_mode_too() {
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.read_handler(Arc::new(NopRead));
    let (_server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&wrq("f").to_bytes(), addr).await.unwrap();

    let (reply, _) = recv_datagram(&client).await;
    assert!(matches!(
        reply,
        Datagram::Error { code, .. } if code == ErrorCode::IllegalOperation.as_u16()
    ));
}

#[tokio::test]
async fn test_malformed_request_is_dropped_without_reply() {
    let mut server = Server::builder("127.0.0.1:0")
        .single_port(true)
        .build()
        .unwrap();
    server.write_handler(Arc::new(NopWrite));
    let (server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();
    // Opcode says WRQ but the body is not a decodable request.
    client.send_to(b"\x00\x02junk", addr).await.unwrap();

    assert_silence(&client).await;
    assert!(server.registry().unwrap().get(&client_addr).is_none());
}

#[tokio::test]
async fn test_setup_error_is_surfaced_to_the_write_handler() {
    use tokio::sync::mpsc;

    struct ReportSetup {
        tx: mpsc::UnboundedSender<Option<TftpError>>,
    }

    #[async_trait]
    impl WriteHandler for ReportSetup {
        async fn receive(&self, req: &mut WriteRequest) {
            let _ = self.tx.send(req.setup_error().cloned());
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut server = Server::builder("127.0.0.1:0").build().unwrap();
    server.write_handler(Arc::new(ReportSetup { tx }));
    let (_server, addr) = start(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dg = Datagram::Request {
        opcode: Opcode::Wrq,
        filename: "f".to_string(),
        mode: TransferMode::Octet,
        options: vec![("tsize".to_string(), "not-a-number".to_string())],
    };
    client.send_to(&dg.to_bytes(), addr).await.unwrap();

    let setup_error = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler was not invoked")
        .unwrap();
    assert!(matches!(
        setup_error,
        Some(TftpError::InvalidOption { option, .. }) if option == "tsize"
    ));
}
