#![cfg(target_os = "linux")]

mod common;

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use btif::sock::handoff::{self, send_all};
use btif::sock::{ConnectSignal, L2capSockets, StackEvent};
use btif::types::{SOCK_FLAG_NONE, uuid16};
use btif::{SdpHandle, SlotId, StackHandle, Uuid};

use common::{Call, FakeStack, LOCAL, MTU, PEER, read_exact, setup, wait_until};

fn service() -> Uuid {
    uuid16(0x1101)
}

/// A listener with one accepted connection from a client on the same table.
struct Link {
    fake: Arc<FakeStack>,
    sockets: Arc<L2capSockets>,
    listener_id: SlotId,
    listener_app: OwnedFd,
    client_app: OwnedFd,
    accepted_app: OwnedFd,
    client_id: SlotId,
    psm: [u8; 4],
    signal: ConnectSignal,
}

fn establish() -> Link {
    let (fake, sockets) = setup(8);

    let (listener_id, listener_app) = sockets
        .listen("chat", Some(service()), 0, SOCK_FLAG_NONE)
        .unwrap();
    assert_eq!(listener_id.as_u32(), 0x2000);
    fake.pump(&sockets);
    let listener_psm = read_exact(&fake, &sockets, listener_app.as_fd(), 4);

    let (client_id, client_app) = sockets
        .connect(PEER, Some(service()), 0, SOCK_FLAG_NONE)
        .unwrap();
    fake.pump(&sockets);
    let client_psm = read_exact(&fake, &sockets, client_app.as_fd(), 4);
    assert_eq!(client_psm, listener_psm);

    let mut buf = [0u8; 64];
    let (n, accepted) = handoff::recv_fd(listener_app.as_fd(), &mut buf).unwrap();
    let signal = ConnectSignal::try_from(&buf[..n]).unwrap();

    Link {
        fake,
        sockets,
        listener_id,
        listener_app,
        client_app,
        accepted_app: accepted.expect("accepted fd attached to connect signal"),
        client_id,
        psm: [listener_psm[0], listener_psm[1], listener_psm[2], listener_psm[3]],
        signal,
    }
}

fn queued_bytes(sockets: &L2capSockets, id: SlotId) -> usize {
    sockets
        .snapshot()
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.queued_bytes)
        .unwrap_or(0)
}

#[test]
fn listen_and_connect_by_uuid_agree_on_psm() {
    let link = establish();

    let psm = i32::from_le_bytes(link.psm);
    assert_eq!(psm, 0x1001);
    assert_eq!(link.signal.channel, psm);
    assert_eq!(link.signal.addr, LOCAL);
    assert_eq!(link.signal.status, 0);
    assert_eq!(link.signal.max_tx_packet_size, MTU);

    send_all(link.client_app.as_fd(), b"hello").unwrap();
    let got = read_exact(&link.fake, &link.sockets, link.accepted_app.as_fd(), 5);
    assert_eq!(got, b"hello");

    send_all(link.accepted_app.as_fd(), b"world").unwrap();
    let got = read_exact(&link.fake, &link.sockets, link.client_app.as_fd(), 5);
    assert_eq!(got, b"world");
}

#[test]
fn accept_keeps_listener_id_and_swaps_stack_ids() {
    let link = establish();

    // The listener keeps its id and re-listens under the fresh stack id with a new handle.
    // The connection takes the fresh slot id, the listener's old stack id and its old handle.
    insta::assert_json_snapshot!(link.sockets.snapshot(), @r#"
    [
      {
        "id": 8192,
        "stack_id": 8194,
        "name": "chat",
        "uuid": "00001101-0000-1000-8000-00805f9b34fb",
        "psm": 4097,
        "addr": "00:00:00:00:00:00",
        "server": true,
        "connected": false,
        "congested": false,
        "sdp_pending": false,
        "doing_sdp": false,
        "handle": 3,
        "sdp_record": 1,
        "queued_bytes": 0
      },
      {
        "id": 8193,
        "stack_id": 8193,
        "name": "",
        "uuid": "00001101-0000-1000-8000-00805f9b34fb",
        "psm": 4097,
        "addr": "66:77:88:99:AA:BB",
        "server": false,
        "connected": true,
        "congested": false,
        "sdp_pending": false,
        "doing_sdp": false,
        "handle": 2,
        "sdp_record": null,
        "queued_bytes": 0
      },
      {
        "id": 8194,
        "stack_id": 8192,
        "name": "chat",
        "uuid": "00001101-0000-1000-8000-00805f9b34fb",
        "psm": 4097,
        "addr": "00:11:22:33:44:55",
        "server": false,
        "connected": true,
        "congested": false,
        "sdp_pending": false,
        "doing_sdp": false,
        "handle": 1,
        "sdp_record": null,
        "queued_bytes": 0
      }
    ]
    "#);

    let starts: Vec<Call> = link
        .fake
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::StartServer { .. }))
        .collect();
    assert_eq!(
        starts,
        vec![
            Call::StartServer {
                id: SlotId::from_raw(0x2000).unwrap(),
                psm: 0
            },
            Call::StartServer {
                id: SlotId::from_raw(0x2002).unwrap(),
                psm: 0x1001
            },
        ]
    );

    // The PSM is only announced once; the next message is already the connect signal.
    let mut buf = [0u8; 64];
    assert!(handoff::recv_nonblocking(link.listener_app.as_fd(), &mut buf).is_err());
}

#[test]
fn queued_stack_data_reaches_app_in_order() {
    let link = establish();
    let (fake, sockets, client_id) = (&link.fake, &link.sockets, link.client_id);
    let client_app = &link.client_app;

    // Stuff the client socket until the table has to start queueing.
    let mut expected = Vec::new();
    let mut chunks = 0u32;
    while queued_bytes(&sockets, client_id) == 0 {
        let data = vec![(chunks % 251) as u8; 1000];
        expected.extend_from_slice(&data);
        sockets.on_stack_event(StackEvent::Data {
            id: client_id,
            data: Bytes::from(data),
        });
        chunks += 1;
        assert!(chunks < 100_000, "socket never filled up");
    }

    for part in [&b"B1-first"[..], b"B2-second", b"B3-third"] {
        expected.extend_from_slice(part);
        sockets.on_stack_event(StackEvent::Data {
            id: client_id,
            data: Bytes::copy_from_slice(part),
        });
    }
    assert!(queued_bytes(&sockets, client_id) >= 25);

    let got = read_exact(&fake, &sockets, client_app.as_fd(), expected.len());
    assert_eq!(got, expected);
    wait_until(&fake, &sockets, || queued_bytes(&sockets, client_id) == 0);
}

#[test]
fn congestion_pauses_reading_from_app() {
    let link = establish();
    let (fake, sockets, client_id) = (&link.fake, &link.sockets, link.client_id);
    let client_app = &link.client_app;

    fake.set_congested(true);
    send_all(client_app.as_fd(), b"one").unwrap();
    wait_until(&fake, &sockets, || {
        fake.write_count() == 1
            && sockets
                .snapshot()
                .iter()
                .any(|s| s.id == client_id && s.congested)
    });

    send_all(client_app.as_fd(), b"two").unwrap();
    thread::sleep(Duration::from_millis(100));
    fake.pump(&sockets);
    assert_eq!(fake.write_count(), 1);

    fake.set_congested(false);
    sockets.on_stack_event(StackEvent::Congestion {
        id: client_id,
        congested: false,
    });
    wait_until(&fake, &sockets, || fake.write_count() == 2);

    let last = fake
        .calls()
        .into_iter()
        .rev()
        .find_map(|c| match c {
            Call::Write { id, data, .. } => Some((id, data)),
            _ => None,
        });
    assert_eq!(last, Some((client_id, Bytes::from_static(b"two"))));
}

#[test]
fn app_close_tears_down_both_ends() {
    let link = establish();
    let (fake, sockets) = (Arc::clone(&link.fake), Arc::clone(&link.sockets));
    let accepted_app = &link.accepted_app;

    drop(link.client_app);
    wait_until(&fake, &sockets, || sockets.in_use() == 1);

    let remaining = sockets.snapshot();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].server);

    // Only the client's channel is closed by us; the stack closed the other side itself.
    let closes: Vec<Call> = fake
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Close(_)))
        .collect();
    assert_eq!(closes, vec![Call::Close(StackHandle(2))]);

    let mut buf = [0u8; 16];
    assert_eq!(
        handoff::recv_nonblocking(accepted_app.as_fd(), &mut buf).unwrap(),
        0
    );
}

#[test]
fn disconnect_after_accept_closes_the_listener() {
    let link = establish();
    let (fake, sockets) = (&link.fake, &link.sockets);

    sockets.disconnect(link.listener_id).unwrap();

    let remaining = sockets.snapshot();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|s| !s.server && s.connected));
    assert!(fake.calls().contains(&Call::StopServer(StackHandle(3))));
    assert!(!fake.calls().iter().any(|c| matches!(c, Call::Close(_))));

    // The accepted connection still carries data.
    send_all(link.client_app.as_fd(), b"still up").unwrap();
    let got = read_exact(fake, sockets, link.accepted_app.as_fd(), 8);
    assert_eq!(got, b"still up");
}

#[test]
fn closing_listener_stops_server_then_removes_record() {
    let (fake, sockets) = setup(4);
    let (_, app) = sockets
        .listen("chat", Some(service()), 0, SOCK_FLAG_NONE)
        .unwrap();
    fake.pump(&sockets);
    read_exact(&fake, &sockets, app.as_fd(), 4);

    drop(app);
    wait_until(&fake, &sockets, || sockets.in_use() == 0);

    let teardown: Vec<Call> = fake
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::StopServer(_) | Call::RemoveSdpRecord(_) | Call::Close(_)))
        .collect();
    assert_eq!(
        teardown,
        vec![
            Call::StopServer(StackHandle(1)),
            Call::RemoveSdpRecord(SdpHandle(1)),
        ]
    );
}

#[test]
fn one_discovery_at_a_time_in_id_order() {
    let (fake, sockets) = setup(8);
    let (_, _listener_app) = sockets
        .listen("chat", Some(service()), 0, SOCK_FLAG_NONE)
        .unwrap();
    fake.pump(&sockets);

    fake.hold_discovery();
    let clients: Vec<(SlotId, OwnedFd)> = (0..3)
        .map(|_| {
            sockets
                .connect(PEER, Some(service()), 0, SOCK_FLAG_NONE)
                .unwrap()
        })
        .collect();
    let client_ids: Vec<SlotId> = clients.iter().map(|(id, _)| *id).collect();

    let discovered = || -> Vec<SlotId> {
        fake.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Discover { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    };
    assert_eq!(discovered(), client_ids[..1].to_vec());

    let snapshot = sockets.snapshot();
    let slot = |id: SlotId| snapshot.iter().find(|s| s.id == id).unwrap().clone();
    assert!(slot(client_ids[0]).doing_sdp);
    assert!(slot(client_ids[1]).sdp_pending);
    assert!(slot(client_ids[2]).sdp_pending);

    for done in 1..=3 {
        fake.finish_discovery();
        fake.pump(&sockets);
        assert_eq!(discovered(), client_ids[..(done + 1).min(3)].to_vec());
    }

    // Every client ended up connected to the listener.
    let connected = sockets
        .snapshot()
        .iter()
        .filter(|s| client_ids.contains(&s.id) && s.connected)
        .count();
    assert_eq!(connected, 3);
}

#[test]
fn discovery_failure_closes_app_socket() {
    let (fake, sockets) = setup(4);
    let unknown = uuid16(0x1234);

    let (_, app) = sockets
        .connect(PEER, Some(unknown), 0, SOCK_FLAG_NONE)
        .unwrap();
    fake.pump(&sockets);

    assert_eq!(sockets.in_use(), 0);
    let mut buf = [0u8; 4];
    assert_eq!(handoff::recv_nonblocking(app.as_fd(), &mut buf).unwrap(), 0);
}
