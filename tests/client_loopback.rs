//! End-to-end exchanges against a scripted peer on a loopback UDP socket.

use std::time::Duration;

use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use coap_client::packet::{
    BlockValue, MessageClass, MessageType, ObserveOption, Packet, RequestType, ResponseType,
};
use coap_client::{CoapClient, CoapRequest, Settings};

struct ScriptedPeer {
    socket: UdpSocket,
    client_addr: Option<std::net::SocketAddr>,
}

impl ScriptedPeer {
    async fn bind() -> ScriptedPeer {
        ScriptedPeer {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            client_addr: None,
        }
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&mut self) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, addr) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
            .await
            .expect("peer timed out waiting for the client")
            .unwrap();
        self.client_addr = Some(addr);
        Packet::from_bytes(&buf[..len]).unwrap()
    }

    async fn send(&self, packet: &Packet) {
        let addr = self.client_addr.expect("no client yet");
        self.socket
            .send_to(&packet.to_bytes().unwrap(), addr)
            .await
            .unwrap();
    }
}

fn piggybacked(request: &Packet, code: ResponseType, payload: &[u8]) -> Packet {
    let mut response = Packet::new();
    response.set_type(MessageType::Acknowledgement);
    response.code = MessageClass::Response(code);
    response.message_id = request.message_id;
    response.set_token(request.token());
    response.payload = payload.to_vec();
    response
}

#[tokio::test]
async fn get_with_blockwise_response() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut peer = ScriptedPeer::bind().await;

    let client = CoapClient::connect(peer.addr(), Settings::new())
        .await
        .unwrap();
    let stream = client
        .request(CoapRequest::get("/firmware").build().unwrap())
        .await
        .unwrap();

    // head request
    let head = peer.recv().await;
    assert_eq!(head.code, MessageClass::Request(RequestType::Get));
    assert_eq!(head.get_uri_path(), vec!["firmware"]);
    let token = head.token();

    // three blocks of a 2.05 body, szx 2 = 64-byte blocks
    let mut first = piggybacked(&head, ResponseType::Content, &[b'a'; 64]);
    first.set_block2(BlockValue::new(0, true, 2).unwrap());
    peer.send(&first).await;

    let continuation = peer.recv().await;
    assert_eq!(continuation.token(), token);
    let block = continuation.get_block2().unwrap();
    assert_eq!((block.num, block.more), (1, false));

    let mut second = piggybacked(&continuation, ResponseType::Content, &[b'b'; 64]);
    second.set_block2(BlockValue::new(1, true, 2).unwrap());
    peer.send(&second).await;

    let continuation = peer.recv().await;
    assert_eq!(continuation.get_block2().unwrap().num, 2);

    let mut last = piggybacked(&continuation, ResponseType::Content, &[b'c'; 10]);
    last.set_block2(BlockValue::new(2, false, 2).unwrap());
    peer.send(&last).await;

    let body = stream.assemble().await.unwrap().unwrap();
    assert_eq!(body.len(), 138);
    assert_eq!(&body[..64], &[b'a'; 64]);
    assert_eq!(&body[64..128], &[b'b'; 64]);
    assert_eq!(&body[128..], &[b'c'; 10]);
}

#[tokio::test]
async fn observe_notifications_until_cancelled() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut peer = ScriptedPeer::bind().await;

    let client = CoapClient::connect(peer.addr(), Settings::new())
        .await
        .unwrap();
    let mut stream = client
        .request(CoapRequest::get("/state").observe().build().unwrap())
        .await
        .unwrap();

    let register = peer.recv().await;
    assert_eq!(register.get_observe(), Some(ObserveOption::Register));
    let token = register.token();

    // initial state piggybacked on the ACK
    peer.send(&piggybacked(&register, ResponseType::Content, b"v1"))
        .await;
    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.payload, b"v1");

    // two more notifications as NONs with fresh message ids
    for (id, body) in [(0x2001u16, b"v2"), (0x2002u16, b"v3")] {
        let mut notification = Packet::new();
        notification.set_type(MessageType::NonConfirmable);
        notification.code = MessageClass::Response(ResponseType::Content);
        notification.message_id = id;
        notification.set_token(token);
        notification.payload = body.to_vec();
        peer.send(&notification).await;
    }
    let second = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.payload, b"v2");
    let third = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(third.payload, b"v3");

    // cancellation deregisters on the same token
    stream.cancel();
    let deregister = peer.recv().await;
    assert_eq!(deregister.get_observe(), Some(ObserveOption::Deregister));
    assert_eq!(deregister.get_type(), MessageType::NonConfirmable);
    assert_eq!(deregister.token(), token);
    assert!(timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn put_adopts_advertised_block1_size() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut peer = ScriptedPeer::bind().await;

    let client = CoapClient::connect(peer.addr(), Settings::new())
        .await
        .unwrap();

    // a first exchange whose reply advertises 16-byte blocks; the
    // preference sticks to the connection
    let probe = client
        .request(CoapRequest::put("/config").payload(vec![1, 2, 3]).build().unwrap())
        .await
        .unwrap();
    let head = peer.recv().await;
    assert_eq!(head.code, MessageClass::Request(RequestType::Put));
    assert_eq!(head.get_block1(), None, "3 bytes fit one default block");
    let mut reply = piggybacked(&head, ResponseType::Changed, &[]);
    reply.set_block1(BlockValue::new(0, false, 0).unwrap());
    peer.send(&reply).await;
    probe.assemble().await.unwrap();

    // the next upload is cut into 16-byte blocks
    let payload: Vec<u8> = (0..40).collect();
    let stream = client
        .request(
            CoapRequest::put("/config")
                .payload(payload.clone())
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut expected_num = 0u32;
    loop {
        let block_message = peer.recv().await;
        let block = block_message.get_block1().expect("every cut carries Block1");
        assert_eq!(block.num, expected_num);
        assert_eq!(block.size(), 16);
        received.extend_from_slice(&block_message.payload);

        if block.more {
            let mut reply = piggybacked(&block_message, ResponseType::Continue, &[]);
            reply.set_block1(BlockValue::new(block.num, true, 0).unwrap());
            peer.send(&reply).await;
            expected_num += 1;
        } else {
            let mut reply = piggybacked(&block_message, ResponseType::Changed, &[]);
            reply.set_block1(BlockValue::new(block.num, false, 0).unwrap());
            peer.send(&reply).await;
            break;
        }
    }

    assert_eq!(received, payload);
    stream.assemble().await.unwrap();
}
