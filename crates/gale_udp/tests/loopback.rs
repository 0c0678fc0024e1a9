//! Full-stack client/server exchange over real UDP sockets on loopback.

use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
};

use bytes::Bytes;
use gale::{
    Client, ClientEvent, ConnectionConfig, ProtocolId, Server, ServerConfig, ServerEvent,
};
use gale_udp::UdpDriver;
use web_time::{Duration, Instant};

const PROTOCOL: ProtocolId = ProtocolId::of("gale udp loopback");

fn loopback_driver() -> UdpDriver {
    UdpDriver::bound("127.0.0.1:0".parse().expect("valid loopback address"))
}

/// Spins both endpoints until `done` says so; panics if 5 s pass first.
fn drive(
    client: &mut Client<UdpDriver>,
    server: &mut Server<UdpDriver>,
    on_server_event: &mut dyn FnMut(&mut Server<UdpDriver>, ServerEvent<SocketAddr>),
    on_client_event: &mut dyn FnMut(ClientEvent),
    done: &dyn Fn() -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let now = Instant::now();
        client.update(now).unwrap();
        client.flush(now).unwrap();
        server.update(now).unwrap();
        server.flush(now).unwrap();
        while let Some(event) = server.poll() {
            on_server_event(server, event);
        }
        while let Some(event) = client.poll() {
            on_client_event(event);
        }
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("deadline passed");
}

#[test]
fn reliable_exchange_both_directions() {
    let mut server = Server::open(loopback_driver(), ServerConfig::new(PROTOCOL)).unwrap();
    let server_addr = server.driver_mut().local_addr().unwrap();
    let mut client = Client::connect(
        loopback_driver(),
        server_addr,
        ConnectionConfig::new(PROTOCOL),
        Instant::now(),
    )
    .unwrap();

    // connect
    let connected = Cell::new(false);
    drive(
        &mut client,
        &mut server,
        &mut |server, event| {
            if let ServerEvent::ConnectionRequest(peer) = event {
                server.accept(peer).unwrap();
            }
        },
        &mut |event| {
            if matches!(event, ClientEvent::Connected) {
                connected.set(true);
            }
        },
        &|| connected.get(),
    );
    assert!(connected.get());

    // client to server
    for payload in [&b"alpha"[..], b"beta", b"gamma"] {
        client.send_reliable(Bytes::from_static(payload)).unwrap();
    }
    let upstream = RefCell::new(Vec::new());
    drive(
        &mut client,
        &mut server,
        &mut |_, event| {
            if let ServerEvent::Recv { msg, .. } = event {
                upstream.borrow_mut().push(msg);
            }
        },
        &mut |_| {},
        &|| upstream.borrow().len() == 3,
    );
    assert_eq!(
        vec![
            Bytes::from_static(b"alpha"),
            Bytes::from_static(b"beta"),
            Bytes::from_static(b"gamma")
        ],
        upstream.into_inner()
    );

    // server to client
    server.broadcast_reliable(Bytes::from_static(b"welcome"));
    let downstream = RefCell::new(Vec::new());
    drive(
        &mut client,
        &mut server,
        &mut |_, _| {},
        &mut |event| {
            if let ClientEvent::Recv { msg, .. } = event {
                downstream.borrow_mut().push(msg);
            }
        },
        &|| !downstream.borrow().is_empty(),
    );
    assert_eq!(
        vec![Bytes::from_static(b"welcome")],
        downstream.into_inner()
    );

    client.close(Instant::now());
    server.stop(Instant::now());
}

#[test]
fn foreign_traffic_is_ignored() {
    let mut server = Server::open(loopback_driver(), ServerConfig::new(PROTOCOL)).unwrap();
    let server_addr = server.driver_mut().local_addr().unwrap();

    // blast the server with garbage and a wrong-protocol packet
    let mut noisy = loopback_driver();
    gale::Driver::start(&mut noisy).unwrap();
    gale::Driver::send_to(&mut noisy, server_addr, b"complete garbage").unwrap();
    gale::Driver::send_to(&mut noisy, server_addr, &[0u8; 64]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        server.update(Instant::now()).unwrap();
        if server.peer_count() > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    // no connection request, no peers, no crash
    assert!(server.poll().is_none());
    assert_eq!(0, server.peer_count());
}
