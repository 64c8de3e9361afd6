mod common;

use common::{cartesian, goto, Bench, Wire};
use franklin::link::Delivery;
use franklin::output_buffer::ScratchOutput;
use franklin::packet::Packet;
use franklin::protocol::{command, event, PROTOCOL_VERSION};
use franklin::{Firmware, LinkConfig, LinkError};

#[test]
fn begin_announces_the_registry() {
    let mut bench = Bench::new(cartesian(2));
    let begin = Packet::new(command::BEGIN).with(PROTOCOL_VERSION);
    assert_eq!(bench.command(&begin), Delivery::Ack);
    bench.run(5);
    assert_eq!(
        bench.events.of(event::START),
        vec![vec![PROTOCOL_VERSION, 1, 0]]
    );
}

#[test]
fn damaged_packet_is_resent_verbatim() {
    let mut bench = Bench::new(cartesian(2));
    let now = bench.now;
    bench.host.send(&Packet::new(command::PING).with(7u8), now);
    let original = bench.host.output().data().to_vec();
    bench.host.output().clear();

    let mut damaged = original.clone();
    damaged[2] ^= 0x01;
    bench.inject(&damaged);
    bench.step();
    assert_eq!(bench.host.output().data(), &original[..]);

    bench.run(5);
    assert_eq!(bench.host.take_delivery(), Some(Delivery::Ack));
    assert_eq!(bench.events.of(event::PONG), vec![vec![7]]);
}

#[test]
fn duplicate_is_answered_but_not_applied() {
    let mut bench = Bench::new(cartesian(2));
    assert_eq!(
        bench.command(&Packet::new(command::PING).with(3u8)),
        Delivery::Ack
    );
    let copy = bench.host.last_sent().to_vec();
    bench.inject(&copy);
    bench.run(10);
    assert_eq!(bench.events.of(event::PONG), vec![vec![3]]);
}

#[test]
fn lost_replies_are_recovered_once() {
    let mut bench = Bench::new(cartesian(2));
    let now = bench.now;
    bench.host.send(&Packet::new(command::PING).with(9u8), now);
    bench.step_losing_board_output();

    let mut delivery = None;
    for _ in 0..100 {
        bench.step();
        if let Some(d) = bench.host.take_delivery() {
            delivery = Some(d);
            break;
        }
    }
    assert_eq!(delivery, Some(Delivery::Ack));
    bench.run(100);
    assert_eq!(bench.events.of(event::PONG), vec![vec![9]]);
}

#[test]
fn unknown_command_stalls_without_side_effects() {
    let mut bench = Bench::new(cartesian(2));
    assert_eq!(bench.command(&Packet::new(0x55)), Delivery::Stall);
    assert!(bench.machine().planner().is_idle());
    // The link keeps working after a stall.
    assert_eq!(
        bench.command(&Packet::new(command::PING).with(1u8)),
        Delivery::Ack
    );
}

#[test]
fn reset_request_aborts_motion() {
    let mut bench = Bench::new(cartesian(2));
    assert_eq!(bench.command(&goto(2, &[(0, 10.)], true)), Delivery::Ack);
    bench.run(100);

    let now = bench.now;
    bench.host.reset_request(now);
    let mut delivery = None;
    for _ in 0..50 {
        bench.step();
        if let Some(d) = bench.host.take_delivery() {
            delivery = Some(d);
            break;
        }
    }
    assert_eq!(delivery, Some(Delivery::Reset));
    bench.run(50);

    assert!(!bench.machine().planner().has_moves());
    assert!(bench.machine().stepper().position(0) < 1000);
    assert_eq!(bench.events.of(event::MOVECB), vec![vec![1]]);
}

#[test]
fn board_gives_up_after_its_retry_budget() {
    let mut board = Firmware::new(Wire::new(), LinkConfig::default(), cartesian(2));
    let mut frame: ScratchOutput = ScratchOutput::new();
    Packet::new(command::PING).with(1u8).encode(false, &mut frame);
    let mut input = Wire::new();
    assert!(input.extend(frame.result()));

    let mut failure = None;
    for t in 0..200u32 {
        if let Err(e) = board.poll(&mut input, t * 1_000) {
            failure = Some(e);
            break;
        }
    }
    assert_eq!(failure, Some(LinkError::RetriesExhausted(5)));
    assert!(!board.link.is_failed());
}
