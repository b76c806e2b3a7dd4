// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

use axon::service::{ServiceArgs, ServiceEntry, ServiceTable};
use axon::{MsgArgs, MsgOptions, TransportConfig};
use axon_abi::{
    reply_header, set_trailer, MsgHeader, Status, HEADER_LEN, KERNEL_CLIENT_FIRST_ID,
    REPLY_ID_OFFSET, TRAILER_LEN,
};
use axon_e2e::{fixture_with, simple_message, Fixture};

const ECHO_ID: u32 = 3000;
const FAILING_ID: u32 = 3001;

/// Echoes the request body back, wrapped in a proper reply frame.
fn echo_handler(args: &mut ServiceArgs<'_>) -> Status {
    let Some(request) = MsgHeader::parse(args.request) else {
        return Status::SendInvalidData;
    };
    let body = &args.request[HEADER_LEN..];
    let total = HEADER_LEN + body.len() + TRAILER_LEN;
    if args.reply.len() < total {
        return Status::SendTooLarge;
    }
    let header = reply_header(&request, total as u32);
    args.reply[..HEADER_LEN].copy_from_slice(&header.to_le_bytes());
    args.reply[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(body);
    set_trailer(&mut args.reply[..total]);
    *args.reply_len = total;
    Status::Success
}

fn failing_handler(_args: &mut ServiceArgs<'_>) -> Status {
    Status::SendInvalidData
}

/// Kernel-client band: the request is itself a reply; there is nothing to
/// produce.
fn notification_handler(args: &mut ServiceArgs<'_>) -> Status {
    assert!(args.reply.is_empty(), "no reply buffer on the no-reply path");
    assert_eq!(*args.reply_len, 0);
    Status::Success
}

fn services() -> ServiceTable {
    let mut table = ServiceTable::new();
    table.register(ServiceEntry {
        id: ECHO_ID,
        name: "echo",
        min_request_len: HEADER_LEN,
        max_reply_len: 256,
        handler: echo_handler,
    });
    table.register(ServiceEntry {
        id: FAILING_ID,
        name: "failing",
        min_request_len: HEADER_LEN + 8,
        max_reply_len: 64,
        handler: failing_handler,
    });
    // Band entry: length roles are inverted at dispatch, so the declared
    // reply maximum is the caller's effective request minimum.
    table.register(ServiceEntry {
        id: KERNEL_CLIENT_FIRST_ID,
        name: "notification",
        min_request_len: HEADER_LEN,
        max_reply_len: 64,
        handler: notification_handler,
    });
    table
}

struct KernelFixture {
    fx: Fixture,
    reply_port: u32,
    kernel_send: u32,
}

fn kernel_fixture() -> KernelFixture {
    let fx = fixture_with(TransportConfig::default(), services());
    let reply_port = fx.engine.create_endpoint(fx.alice).unwrap();
    let handle = fx.engine.create_kernel_endpoint(None);
    let kernel_send = fx.engine.grant_send(fx.alice, handle).unwrap();
    KernelFixture { fx, reply_port, kernel_send }
}

#[test]
fn combined_call_round_trips_through_the_dispatcher() {
    let kf = kernel_fixture();
    let request = simple_message(kf.kernel_send, kf.reply_port, ECHO_ID, b"marco");

    let mut buf = vec![0u8; 256];
    let (status, len) = kf.fx.engine.msg(
        kf.fx.alice,
        MsgArgs {
            send: Some(&request),
            options: MsgOptions::SEND | MsgOptions::RECEIVE | MsgOptions::RECEIVE_TIMEOUT,
            recv_name: kf.reply_port,
            timeout_ms: 1_000,
        },
        &mut buf,
    );
    assert_eq!(status, Status::Success);

    let reply = MsgHeader::parse(&buf[..len]).unwrap();
    assert_eq!(reply.id, ECHO_ID + REPLY_ID_OFFSET);
    // Kernel replies carry no sender context: the local slot arrives
    // untranslated, still naming the caller's own reply port.
    assert_eq!(reply.local, kf.reply_port);
    assert_eq!(&buf[HEADER_LEN..len - TRAILER_LEN], b"marco");
}

#[test]
fn unknown_id_on_kernel_endpoint_is_invalid_dest() {
    let kf = kernel_fixture();
    let request = simple_message(kf.kernel_send, kf.reply_port, 9999, b"");
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::SendInvalidDest);
    assert_eq!(kf.fx.engine.pending(kf.fx.alice, kf.reply_port), Some(0));
}

#[test]
fn undersized_request_is_rejected_before_the_handler_runs() {
    let kf = kernel_fixture();
    // FAILING_ID requires eight body bytes; send four. The handler would
    // return SendInvalidData, so SendMsgTooSmall proves it never ran.
    let request = simple_message(kf.kernel_send, kf.reply_port, FAILING_ID, b"1234");
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::SendMsgTooSmall);
}

#[test]
fn handler_status_is_propagated_verbatim() {
    let kf = kernel_fixture();
    let request = simple_message(kf.kernel_send, kf.reply_port, FAILING_ID, b"12345678");
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::SendInvalidData);
    assert_eq!(kf.fx.engine.pending(kf.fx.alice, kf.reply_port), Some(0));
}

#[test]
fn missing_reply_right_is_invalid_reply() {
    let kf = kernel_fixture();
    let request = simple_message(kf.kernel_send, 0, ECHO_ID, b"");
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::SendInvalidReply);
}

#[test]
fn no_reply_id_queues_nothing_and_skips_the_receive() {
    let kf = kernel_fixture();
    // 64 request bytes to satisfy the band's swapped minimum.
    let body = vec![0u8; 64 - HEADER_LEN];
    let request = simple_message(kf.kernel_send, 0, KERNEL_CLIENT_FIRST_ID, &body);

    let mut buf = vec![0u8; 256];
    let (status, len) = kf.fx.engine.msg(
        kf.fx.alice,
        MsgArgs {
            send: Some(&request),
            options: MsgOptions::SEND | MsgOptions::RECEIVE | MsgOptions::RECEIVE_TIMEOUT,
            recv_name: kf.reply_port,
            timeout_ms: 50,
        },
        &mut buf,
    );
    // The receive leg was skipped: success with nothing delivered, and no
    // entry was ever queued anywhere.
    assert_eq!(status, Status::Success);
    assert_eq!(len, 0);
    assert_eq!(kf.fx.engine.pending(kf.fx.alice, kf.reply_port), Some(0));
}

#[test]
fn band_request_skips_reply_right_validation() {
    let kf = kernel_fixture();
    // No local right at all, yet the band id goes through.
    let body = vec![0u8; 64 - HEADER_LEN];
    let request = simple_message(kf.kernel_send, 0, KERNEL_CLIENT_FIRST_ID, &body);
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::Success);
}

#[test]
fn band_request_below_swapped_minimum_is_too_small() {
    let kf = kernel_fixture();
    let request = simple_message(kf.kernel_send, 0, KERNEL_CLIENT_FIRST_ID, b"");
    assert_eq!(kf.fx.engine.send(kf.fx.alice, &request), Status::SendMsgTooSmall);
}
