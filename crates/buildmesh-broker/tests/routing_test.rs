//! Message-level routing tests against a live master.
//!
//! These tests speak the wire protocol by hand over real TCP connections so
//! the whole path -- handshake, framing, exchange, relay -- is exercised
//! without the client or worker crates in the loop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use buildmesh_broker::{Master, MasterConfig};
use buildmesh_proto::handshake;
use buildmesh_proto::job::code;
use buildmesh_proto::message::{Envelope, Message, Reply, Request};
use buildmesh_proto::wire;

async fn start_master(token: Option<&str>) -> (Master, SocketAddr) {
    let master = Master::start(MasterConfig {
        addr: "127.0.0.1:0".to_string(),
        token: token.map(str::to_string),
        heartbeat: None,
    });
    let addr = master.local_addr().await.unwrap();
    (master, addr)
}

async fn connect(addr: SocketAddr, identity: &str, token: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake::send_client_hello(&mut stream, identity, token)
        .await
        .unwrap();
    handshake::read_server_response(&mut stream, identity)
        .await
        .unwrap();
    stream
}

async fn send(stream: &mut TcpStream, envelope: Envelope) {
    wire::write_frames(stream, &envelope.into_frames())
        .await
        .unwrap();
}

async fn recv(stream: &mut TcpStream) -> Envelope {
    let frames = tokio::time::timeout(Duration::from_secs(5), wire::read_frames(stream))
        .await
        .expect("timed out waiting for a message")
        .unwrap()
        .expect("connection closed");
    Envelope::from_frames(frames).unwrap()
}

fn request(id: u16, method: &str, stdout_tag: Option<u16>) -> Message {
    Message::Request(Request {
        id,
        method: method.to_string(),
        args: b"{}".to_vec(),
        stdout_tag,
        stderr_tag: None,
    })
}

#[tokio::test]
async fn no_provider_yields_reply_254() {
    let (master, addr) = start_master(None).await;
    let mut client = connect(addr, "client-1", None).await;

    send(&mut client, Envelope::new(request(1, "mesh.nosuch.bash", None))).await;

    let envelope = recv(&mut client).await;
    match envelope.message {
        Message::Reply(reply) => {
            assert_eq!(reply.request_id, 1);
            assert_eq!(reply.return_code, code::NO_PROVIDER);
            assert_eq!(reply.return_value, b"No method available");
        }
        other => panic!("expected reply, got {:?}", other),
    }

    master.terminate();
    master.terminated().await;
}

#[tokio::test]
async fn request_stream_and_reply_are_relayed() {
    let (master, addr) = start_master(None).await;
    let mut worker = connect(addr, "worker-1", None).await;
    let mut client = connect(addr, "client-1", None).await;

    send(
        &mut worker,
        Envelope::new(Message::Register {
            method: "mesh.any.bash".to_string(),
        }),
    )
    .await;
    // Registration is processed asynchronously; give the exchange a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut client, Envelope::new(request(7, "mesh.any.bash", Some(3)))).await;

    // Worker sees the request with the sender identity in the route frame.
    let envelope = recv(&mut worker).await;
    assert_eq!(envelope.route.as_deref(), Some("client-1"));
    let Message::Request(req) = envelope.message else {
        panic!("expected request");
    };
    assert_eq!(req.id, 7);
    assert_eq!(req.stdout_tag, Some(3));

    // Worker signals progress, streams two stdout frames, then replies.
    send(
        &mut worker,
        Envelope::routed("client-1", Message::Progress { request_id: 7 }),
    )
    .await;
    for body in [b"hi\n".to_vec(), b"bye\n".to_vec()] {
        send(
            &mut worker,
            Envelope::routed("client-1", Message::StreamFrame { tag: 3, body }),
        )
        .await;
    }
    send(
        &mut worker,
        Envelope::routed(
            "client-1",
            Message::Reply(Reply {
                request_id: 7,
                return_code: 0,
                return_value: b"{\"ok\":true}".to_vec(),
            }),
        ),
    )
    .await;

    // Client receives the progress signal, both frames in order, then the
    // reply.
    let progress = recv(&mut client).await;
    assert_eq!(progress.message, Message::Progress { request_id: 7 });
    let first = recv(&mut client).await;
    assert_eq!(
        first.message,
        Message::StreamFrame {
            tag: 3,
            body: b"hi\n".to_vec()
        }
    );
    let second = recv(&mut client).await;
    assert_eq!(
        second.message,
        Message::StreamFrame {
            tag: 3,
            body: b"bye\n".to_vec()
        }
    );
    let reply = recv(&mut client).await;
    match reply.message {
        Message::Reply(reply) => {
            assert_eq!(reply.request_id, 7);
            assert_eq!(reply.return_code, 0);
        }
        other => panic!("expected reply, got {:?}", other),
    }

    master.terminate();
    master.terminated().await;
}

#[tokio::test]
async fn interrupt_reaches_the_processing_worker() {
    let (master, addr) = start_master(None).await;
    let mut worker = connect(addr, "worker-1", None).await;
    let mut client = connect(addr, "client-1", None).await;

    send(
        &mut worker,
        Envelope::new(Message::Register {
            method: "mesh.any.bash".to_string(),
        }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut client, Envelope::new(request(9, "mesh.any.bash", None))).await;
    let _ = recv(&mut worker).await;

    send(&mut client, Envelope::new(Message::Interrupt { request_id: 9 })).await;
    let envelope = recv(&mut worker).await;
    assert_eq!(envelope.message, Message::Interrupt { request_id: 9 });
    assert_eq!(envelope.route.as_deref(), Some("client-1"));

    master.terminate();
    master.terminated().await;
}

#[tokio::test]
async fn worker_disconnect_unregisters_its_methods() {
    let (master, addr) = start_master(None).await;
    let worker = connect(addr, "worker-1", None).await;
    let mut client = connect(addr, "client-1", None).await;

    {
        let mut worker = worker;
        send(
            &mut worker,
            Envelope::new(Message::Register {
                method: "mesh.any.bash".to_string(),
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Dropping the stream disconnects the worker.
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(&mut client, Envelope::new(request(1, "mesh.any.bash", None))).await;
    let envelope = recv(&mut client).await;
    match envelope.message {
        Message::Reply(reply) => assert_eq!(reply.return_code, code::NO_PROVIDER),
        other => panic!("expected reply, got {:?}", other),
    }

    master.terminate();
    master.terminated().await;
}

#[tokio::test]
async fn bearer_token_is_enforced() {
    let (master, addr) = start_master(Some("sesame")).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake::send_client_hello(&mut stream, "client-1", Some("wrong"))
        .await
        .unwrap();
    assert!(handshake::read_server_response(&mut stream, "client-1")
        .await
        .is_err());

    let _authorized = connect(addr, "client-2", Some("sesame")).await;

    master.terminate();
    master.terminated().await;
}

#[tokio::test]
async fn heartbeat_pings_connected_apps() {
    let master = Master::start(MasterConfig {
        addr: "127.0.0.1:0".to_string(),
        token: None,
        heartbeat: Some(Duration::from_millis(50)),
    });
    let addr = master.local_addr().await.unwrap();

    let mut worker = connect(addr, "worker-1", None).await;
    send(
        &mut worker,
        Envelope::new(Message::Register {
            method: "mesh.any.bash".to_string(),
        }),
    )
    .await;

    // The connection-level heartbeat must ping us within a few periods.
    let envelope = recv(&mut worker).await;
    assert_eq!(envelope.message, Message::Ping);
    send(&mut worker, Envelope::new(Message::Pong)).await;

    master.terminate();
    master.terminated().await;
}
