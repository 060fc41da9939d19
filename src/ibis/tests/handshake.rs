//! Handshake lifecycle: both roles driven over the software fabric, one
//! thread per endpoint.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use ibis::{
    ConnParam, Endpoint, EndpointState, Error, PortSpace, QpCapability, SoftFabric,
    DEFAULT_RESOLVE_TIMEOUT, DEFAULT_ROUTE_TIMEOUT,
};

fn connected_pair_with(
    fabric: &Arc<SoftFabric>,
    addr: SocketAddr,
    client_cap: QpCapability,
    server_cap: QpCapability,
) -> (Endpoint<SoftFabric>, Endpoint<SoftFabric>) {
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let fabric = Arc::clone(fabric);
        thread::spawn(move || {
            let mut listener = Endpoint::create(fabric, PortSpace::Tcp).unwrap();
            listener.bind(addr).unwrap();
            listener.listen(16).unwrap();
            ready_tx.send(()).unwrap();
            listener.accept(server_cap, &ConnParam::default()).unwrap()
        })
    };
    ready_rx.recv().unwrap();
    let mut client = Endpoint::create(Arc::clone(fabric), PortSpace::Tcp).unwrap();
    client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
    client.attach_queue_pair(client_cap).unwrap();
    client
        .connect(&ConnParam::default(), DEFAULT_ROUTE_TIMEOUT)
        .unwrap();
    let accepted = server.join().unwrap();
    (client, accepted)
}

fn connected_pair(
    fabric: &Arc<SoftFabric>,
    addr: SocketAddr,
) -> (Endpoint<SoftFabric>, Endpoint<SoftFabric>) {
    connected_pair_with(
        fabric,
        addr,
        QpCapability::default(),
        QpCapability::default(),
    )
}

#[test]
fn resolve_and_connect_reach_connected() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.1:6000".parse().unwrap();
    let (client, accepted) = connected_pair(&fabric, addr);
    assert_eq!(client.state(), EndpointState::Connected);
    assert_eq!(accepted.state(), EndpointState::Connected);
    assert_eq!(client.peer_addr().unwrap(), addr);
}

#[test]
fn connect_without_listener_fails() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.2:6100".parse().unwrap();
    let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
    client.attach_queue_pair(QpCapability::default()).unwrap();
    let err = client
        .connect(&ConnParam::default(), DEFAULT_ROUTE_TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(_)));
    assert_eq!(client.state(), EndpointState::Failed);
}

#[test]
fn resolution_failure_is_terminal() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.3:6200".parse().unwrap();
    fabric.set_unreachable(addr);
    let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    let err = client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap_err();
    assert!(matches!(err, Error::ResolutionFailed(_)));
    assert_eq!(client.state(), EndpointState::Failed);
    // the endpoint is dead; nothing may be attached to it anymore
    assert!(matches!(
        client.attach_queue_pair(QpCapability::default()),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn accepted_endpoint_is_independent_of_the_listener() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.4:6300".parse().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let fabric = Arc::clone(&fabric);
        thread::spawn(move || {
            let mut listener = Endpoint::create(fabric, PortSpace::Tcp).unwrap();
            listener.bind(addr).unwrap();
            listener.listen(16).unwrap();
            ready_tx.send(()).unwrap();
            let first = listener
                .accept(QpCapability::default(), &ConnParam::default())
                .unwrap();
            drop(first);
            let second = listener
                .accept(QpCapability::default(), &ConnParam::default())
                .unwrap();
            (listener, second)
        })
    };
    ready_rx.recv().unwrap();

    let connect_one = || {
        let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
        client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
        client.attach_queue_pair(QpCapability::default()).unwrap();
        client
            .connect(&ConnParam::default(), DEFAULT_ROUTE_TIMEOUT)
            .unwrap();
        client
    };
    let _client1 = connect_one();
    let _client2 = connect_one();

    let (listener, second) = server.join().unwrap();
    assert_eq!(listener.state(), EndpointState::Listening);
    assert_eq!(second.state(), EndpointState::Connected);
}

#[test]
fn moved_handle_is_inert() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.5:6400".parse().unwrap();
    let (mut client, mut accepted) = connected_pair(&fabric, addr);

    let mut moved = client.take_ownership().unwrap();
    assert_eq!(client.state(), EndpointState::Invalid);
    assert!(matches!(client.disconnect(), Err(Error::InvalidState(_))));
    assert!(matches!(
        client.take_ownership(),
        Err(Error::InvalidState(_))
    ));
    // the source destructor must not release the transferred resources
    drop(client);

    let mut rbuf = vec![0u8; 64];
    unsafe {
        accepted.post_recv(&mut rbuf, None, None).unwrap();
    }
    let payload = b"after the move";
    unsafe {
        moved.post_send(payload, None, None).unwrap();
    }
    let swc = moved.wait_send_completion().unwrap();
    assert!(swc.status.is_success());
    let rwc = accepted.wait_recv_completion().unwrap();
    assert_eq!(rwc.byte_len as usize, payload.len());
    assert_eq!(&rbuf[..payload.len()], payload);
}

#[test]
fn queue_pair_cannot_be_attached_twice() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.6:6500".parse().unwrap();
    let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
    client.attach_queue_pair(QpCapability::default()).unwrap();
    assert!(matches!(
        client.attach_queue_pair(QpCapability::default()),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn queue_pair_needs_a_resolved_device() {
    let fabric = Arc::new(SoftFabric::new());
    let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    assert!(matches!(
        client.attach_queue_pair(QpCapability::default()),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn bind_conflicts_surface_address_in_use() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.7:6600".parse().unwrap();
    let mut first = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    first.bind(addr).unwrap();
    first.listen(16).unwrap();
    let mut second = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    assert!(matches!(second.bind(addr), Err(Error::AddressInUse)));
}

#[test]
fn listen_requires_bind() {
    let fabric = Arc::new(SoftFabric::new());
    let mut ep = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    assert!(matches!(ep.listen(16), Err(Error::InvalidState(_))));
}

#[test]
fn connect_requires_resolution_and_queue_pair() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.8:6700".parse().unwrap();
    let mut ep = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    assert!(matches!(
        ep.connect(&ConnParam::default(), DEFAULT_ROUTE_TIMEOUT),
        Err(Error::InvalidState(_))
    ));
    ep.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
    // still no queue pair
    assert!(matches!(
        ep.connect(&ConnParam::default(), DEFAULT_ROUTE_TIMEOUT),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn private_data_reaches_the_acceptor() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.9:6800".parse().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let fabric = Arc::clone(&fabric);
        thread::spawn(move || {
            let mut listener = Endpoint::create(fabric, PortSpace::Tcp).unwrap();
            listener.bind(addr).unwrap();
            listener.listen(16).unwrap();
            ready_tx.send(()).unwrap();
            listener
                .accept(QpCapability::default(), &ConnParam::default())
                .unwrap()
        })
    };
    ready_rx.recv().unwrap();
    let mut client = Endpoint::create(Arc::clone(&fabric), PortSpace::Tcp).unwrap();
    client.resolve(addr, DEFAULT_RESOLVE_TIMEOUT).unwrap();
    client.attach_queue_pair(QpCapability::default()).unwrap();
    let param = ConnParam {
        private_data: Some(b"handshake hello".to_vec()),
        ..Default::default()
    };
    client.connect(&param, DEFAULT_ROUTE_TIMEOUT).unwrap();
    let accepted = server.join().unwrap();
    assert_eq!(
        accepted.peer_private_data(),
        Some(b"handshake hello".as_slice())
    );
}

#[test]
fn disconnect_is_terminal() {
    let fabric = Arc::new(SoftFabric::new());
    let addr: SocketAddr = "10.1.0.10:6900".parse().unwrap();
    let (mut client, _accepted) = connected_pair(&fabric, addr);
    client.disconnect().unwrap();
    assert_eq!(client.state(), EndpointState::Disconnected);
    assert!(matches!(client.disconnect(), Err(Error::InvalidState(_))));
}
