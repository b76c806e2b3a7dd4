// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::thread;
use std::time::Duration;

use axon::MsgOptions;
use axon_abi::desc::{self, Descriptor};
use axon_abi::{bits, Disposition, MsgHeader, Status, HEADER_LEN};
use axon_e2e::{fixture, message_with_bits, simple_message, Fixture};

/// Gives `to` a send right on the endpoint behind `receive_name`.
fn grant(fx: &Fixture, owner: u32, receive_name: u32, to: u32) -> u32 {
    let handle = fx.engine.query_endpoint(owner, receive_name).unwrap();
    fx.engine.grant_send(to, handle).unwrap()
}

#[test]
fn fifo_ordering_is_preserved() {
    let fx = fixture();
    let recv_name = fx.engine.create_endpoint(fx.alice).unwrap();
    let send_name = fx.engine.make_send(fx.alice, recv_name).unwrap();

    for id in 1..=5u32 {
        let status = fx.engine.send(fx.alice, &simple_message(send_name, 0, id, b"payload"));
        assert_eq!(status, Status::Success);
    }
    assert_eq!(fx.engine.pending(fx.alice, recv_name), Some(5));

    let mut buf = vec![0u8; 128];
    for id in 1..=5u32 {
        let (status, len) = fx.engine.recv(fx.alice, recv_name, MsgOptions::empty(), 0, &mut buf);
        assert_eq!(status, Status::Success);
        let header = MsgHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.id, id);
        assert_eq!(&buf[HEADER_LEN..len], b"payload");
    }
}

#[test]
fn blocked_receiver_is_woken_by_send() {
    let fx = fixture();
    let recv_name = fx.engine.create_endpoint(fx.bob).unwrap();
    let send_name = grant(&fx, fx.bob, recv_name, fx.alice);

    let engine = fx.engine.clone();
    let bob = fx.bob;
    let receiver = thread::spawn(move || {
        let mut buf = vec![0u8; 64];
        let (status, len) =
            engine.recv(bob, recv_name, MsgOptions::RECEIVE_TIMEOUT, 2_000, &mut buf);
        (status, buf[..len].to_vec())
    });

    thread::sleep(Duration::from_millis(50));
    let status = fx.engine.send(fx.alice, &simple_message(send_name, 0, 77, b"wake"));
    assert_eq!(status, Status::Success);

    let (status, received) = receiver.join().unwrap();
    assert_eq!(status, Status::Success);
    let header = MsgHeader::parse(&received).unwrap();
    assert_eq!(header.id, 77);
    assert_eq!(&received[HEADER_LEN..], b"wake");
}

#[test]
fn make_send_round_trip_denotes_the_same_endpoint() {
    let fx = fixture();
    // alice owns endpoint E; bob owns his own mailbox.
    let alice_recv = fx.engine.create_endpoint(fx.alice).unwrap();
    let bob_recv = fx.engine.create_endpoint(fx.bob).unwrap();
    let route = grant(&fx, fx.bob, bob_recv, fx.alice);

    // alice sends bob a complex message minting a send right on E.
    let mut msg = simple_message(route, 0, 400, b"");
    desc::push_port(&mut msg, alice_recv, Disposition::MakeSend).unwrap();
    assert_eq!(fx.engine.send(fx.alice, &msg), Status::Success);

    let mut buf = vec![0u8; 256];
    let (status, len) = fx.engine.recv(fx.bob, bob_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    let Descriptor::Port { name, .. } = desc::read_at(&buf[HEADER_LEN..len], 0).unwrap() else {
        panic!("expected port descriptor");
    };
    assert_ne!(name, 0);
    assert_ne!(name, alice_recv, "names are process-local");

    // The translated right denotes E: a message sent through it lands on
    // alice's queue.
    assert_eq!(fx.engine.send(fx.bob, &simple_message(name, 0, 401, b"ping")), Status::Success);
    let (status, len) = fx.engine.recv(fx.alice, alice_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    assert_eq!(MsgHeader::parse(&buf[..len]).unwrap().id, 401);
}

#[test]
fn move_receive_transfers_the_receive_side() {
    let fx = fixture();
    let moved = fx.engine.create_endpoint(fx.alice).unwrap();
    let bob_recv = fx.engine.create_endpoint(fx.bob).unwrap();
    let route = grant(&fx, fx.bob, bob_recv, fx.alice);

    let mut msg = simple_message(route, 0, 500, b"");
    desc::push_port(&mut msg, moved, Disposition::MoveReceive).unwrap();
    assert_eq!(fx.engine.send(fx.alice, &msg), Status::Success);

    let mut buf = vec![0u8; 256];
    let (status, len) = fx.engine.recv(fx.bob, bob_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    let Descriptor::Port { name: bob_name, .. } = desc::read_at(&buf[HEADER_LEN..len], 0).unwrap()
    else {
        panic!("expected port descriptor");
    };
    assert_ne!(bob_name, 0);

    // The sender's table no longer resolves the name with receive kind...
    let mut small = vec![0u8; 64];
    let (status, _) = fx.engine.recv(fx.alice, moved, MsgOptions::RECEIVE_TIMEOUT, 10, &mut small);
    assert_eq!(status, Status::ReceiveInvalidName);
    // ...and the receiver's does: bob can block on the moved endpoint.
    let (status, _) =
        fx.engine.recv(fx.bob, bob_name, MsgOptions::RECEIVE_TIMEOUT, 10, &mut small);
    assert_eq!(status, Status::ReceiveTimedOut);
}

#[test]
fn header_roles_swap_on_delivery() {
    let fx = fixture();
    let alice_reply = fx.engine.create_endpoint(fx.alice).unwrap();
    let bob_recv = fx.engine.create_endpoint(fx.bob).unwrap();
    let route = grant(&fx, fx.bob, bob_recv, fx.alice);

    // alice's local slot carries a make-send-once reply disposition on her
    // own reply endpoint.
    let packed = bits::compose(Disposition::CopySend.as_raw(), Disposition::MakeSendOnce.as_raw());
    let msg = message_with_bits(packed, route, alice_reply, 600, b"rpc");
    assert_eq!(fx.engine.send(fx.alice, &msg), Status::Success);

    let mut buf = vec![0u8; 128];
    let (status, len) = fx.engine.recv(fx.bob, bob_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    let header = MsgHeader::parse(&buf[..len]).unwrap();
    // After the role swap, bob's remote slot names the reply path with the
    // send-once disposition.
    assert_eq!(bits::remote(header.bits), Disposition::MakeSendOnce.as_raw());
    assert_ne!(header.remote, 0);

    let reply = simple_message(header.remote, 0, 601, b"done");
    assert_eq!(fx.engine.send(fx.bob, &reply), Status::Success);
    let (status, len) = fx.engine.recv(fx.alice, alice_reply, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    assert_eq!(MsgHeader::parse(&buf[..len]).unwrap().id, 601);
}

#[test]
fn header_move_send_of_sole_right_evaporates_by_design() {
    // Pins the documented leniency: a header-slot move consumes the sender's
    // reference at send time, so translating the slot at delivery finds
    // nothing and the receiver observes a zero name. Best-effort rights
    // delivery, not an error.
    let fx = fixture();
    let bob_recv = fx.engine.create_endpoint(fx.bob).unwrap();
    let carried = fx.engine.create_endpoint(fx.alice).unwrap();
    let carried_send = fx.engine.make_send(fx.alice, carried).unwrap();
    let route = grant(&fx, fx.bob, bob_recv, fx.alice);

    let packed = bits::compose(Disposition::CopySend.as_raw(), Disposition::MoveSend.as_raw());
    let msg = message_with_bits(packed, route, carried_send, 700, b"");
    assert_eq!(fx.engine.send(fx.alice, &msg), Status::Success);

    // The move consumed alice's only reference with the send itself.
    let probe = simple_message(carried_send, 0, 701, b"");
    assert_eq!(fx.engine.send(fx.alice, &probe), Status::SendInvalidDest);

    let mut buf = vec![0u8; 256];
    let (status, len) = fx.engine.recv(fx.bob, bob_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    let header = MsgHeader::parse(&buf[..len]).unwrap();
    assert_eq!(header.remote, 0, "sole moved right must deliver a zero name");
    assert_eq!(bits::remote(header.bits), Disposition::MoveSend.as_raw());
}

#[test]
fn descriptor_move_send_still_resolves_at_delivery() {
    // Descriptor rights are not dropped at send time (only header slots
    // are), so a moved descriptor right still resolves when the message is
    // dequeued.
    let fx = fixture();
    let bob_recv = fx.engine.create_endpoint(fx.bob).unwrap();
    let carried = fx.engine.create_endpoint(fx.alice).unwrap();
    let carried_send = fx.engine.make_send(fx.alice, carried).unwrap();
    let route = grant(&fx, fx.bob, bob_recv, fx.alice);

    let mut msg = simple_message(route, 0, 710, b"");
    desc::push_port(&mut msg, carried_send, Disposition::MoveSend).unwrap();
    assert_eq!(fx.engine.send(fx.alice, &msg), Status::Success);

    let mut buf = vec![0u8; 256];
    let (status, len) = fx.engine.recv(fx.bob, bob_recv, MsgOptions::empty(), 0, &mut buf);
    assert_eq!(status, Status::Success);
    let Descriptor::Port { name, .. } = desc::read_at(&buf[HEADER_LEN..len], 0).unwrap() else {
        panic!("expected port descriptor");
    };
    assert_ne!(name, 0);
    // bob can use the delivered right.
    assert_eq!(fx.engine.send(fx.bob, &simple_message(name, 0, 711, b"")), Status::Success);
}
