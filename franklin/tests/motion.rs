mod common;

use common::{cartesian, floats, goto, wired, Bench, BoardMachine, Store};
use franklin::hal::Pin;
use franklin::kinematics::{kind, Kinematics, MotorRef};
use franklin::link::Delivery;
use franklin::packet::Packet;
use franklin::planner::MOVE_QUEUE_LENGTH;
use franklin::protocol::{command, event};
use franklin::sim::{SimAdc, SimPins};
use franklin::space::Space;
use franklin::Machine;

fn machine_with(spaces: Vec<Space>) -> BoardMachine {
    let mut machine = Machine::new(SimPins::new(), SimAdc::new(), Store::new());
    for space in spaces {
        machine.add_space(space).expect("room for the space");
    }
    machine
}

fn position(bench: &mut Bench, space: u8) -> Vec<f32> {
    bench.events.clear();
    let getpos = Packet::new(command::GETPOS).with(space);
    assert_eq!(bench.command(&getpos), Delivery::Ack);
    bench.run(5);
    let reply = bench.events.of(event::POSITION);
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0][0], space);
    floats(&reply[0][1..])
}

fn callbacks(bench: &Bench) -> u32 {
    bench
        .events
        .of(event::MOVECB)
        .iter()
        .map(|p| p[0] as u32)
        .sum()
}

#[test]
fn move_steps_and_reports_its_callback() {
    let mut bench = Bench::new(cartesian(2));
    assert_eq!(
        bench.command(&goto(2, &[(0, 10.), (1, -2.)], true)),
        Delivery::Ack
    );
    bench.settle();

    let pins = bench.machine().pins();
    assert_eq!(pins.rising_edges(20), 1000);
    assert_eq!(pins.rising_edges(24), 200);
    assert!(pins.level(21));
    assert!(!pins.level(25));
    assert_eq!(bench.events.of(event::MOVECB), vec![vec![1]]);

    let xy = position(&mut bench, 0);
    assert!((xy[0] - 10.).abs() < 1e-3);
    assert!((xy[1] + 2.).abs() < 1e-3);
}

#[test]
fn full_queue_waits_for_continue() {
    let mut bench = Bench::new(cartesian(1));
    let mut last = None;
    for i in 0..MOVE_QUEUE_LENGTH + 4 {
        let delivery = bench.command(&goto(1, &[(0, (i + 1) as f64 * 0.1)], false));
        if delivery == Delivery::AckWait {
            last = Some(delivery);
            break;
        }
        assert_eq!(delivery, Delivery::Ack);
    }
    assert_eq!(last, Some(Delivery::AckWait));
    assert_eq!(bench.command(&goto(1, &[(0, 5.)], false)), Delivery::Stall);
    assert!(bench.events.of(event::CONTINUE).is_empty());

    bench.run(1500);
    assert_eq!(bench.events.of(event::CONTINUE).len(), 1);
    assert_ne!(bench.command(&goto(1, &[(0, 5.)], false)), Delivery::Stall);
}

#[test]
fn limit_switch_aborts_and_flushes_callbacks() {
    let mut x = Space::new(kind::CARTESIAN, 1, 1).unwrap();
    wired(&mut x, 0, 20);
    x.motors[0].limit_max = Pin::new(40, false);
    let mut bench = Bench::new(machine_with(vec![x]));

    assert_eq!(bench.command(&goto(1, &[(0, 10.)], true)), Delivery::Ack);
    assert_eq!(bench.command(&goto(1, &[(0, 20.)], true)), Delivery::Ack);
    bench.run(300);
    bench.board.machine.pins_mut().force(40, true);
    bench.settle();

    let limit = bench.events.of(event::LIMIT);
    assert_eq!(limit.len(), 1);
    assert_eq!(limit[0][..2], [0, 0]);
    let at = floats(&limit[0][2..])[0];
    assert!(at > 2. && at < 4., "limit hit at {at}");
    assert_eq!(callbacks(&bench), 2);
    assert!(!bench.machine().planner().has_moves());
    assert!(bench.machine().fragments().is_empty());

    // The planner resumes from where the motor stopped.
    let x = position(&mut bench, 0)[0];
    assert!((x - at).abs() < 1e-3);
}

#[test]
fn pause_freezes_the_tick() {
    let mut bench = Bench::new(cartesian(1));
    bench.command(&goto(1, &[(0, 10.)], false));
    bench.run(100);
    bench.command(&Packet::new(command::PAUSE).with(true));
    let frozen = bench.machine().stepper().position(0);
    bench.run(200);
    assert_eq!(bench.machine().stepper().position(0), frozen);

    bench.command(&Packet::new(command::PAUSE).with(false));
    bench.settle();
    assert_eq!(bench.machine().stepper().position(0), 1000);
}

#[test]
fn stop_discards_queued_moves() {
    let mut bench = Bench::new(cartesian(1));
    bench.command(&goto(1, &[(0, 10.)], true));
    bench.command(&goto(1, &[(0, 0.)], true));
    bench.run(50);
    assert_eq!(bench.command(&Packet::new(command::STOP)), Delivery::Ack);
    bench.settle();
    assert_eq!(callbacks(&bench), 2);
    let stopped = bench.machine().stepper().position(0);
    assert!(stopped > 0 && stopped < 1000);
}

#[test]
fn delta_carriages_rise_together() {
    let mut delta = Space::new(kind::DELTA, 3, 3).unwrap();
    for m in 0..3 {
        wired(&mut delta, m, 20 + 4 * m as u8);
    }
    let mut bench = Bench::new(machine_with(vec![delta]));

    // All carriages start at zero, which puts the effector one rod height below them.
    let start = position(&mut bench, 0);
    assert!((start[2] + 216.506).abs() < 1e-2);

    let target = goto(3, &[(0, 0.), (1, 0.), (2, -200.)], true);
    assert_eq!(bench.command(&target), Delivery::Ack);
    bench.settle();

    let steps: Vec<i32> = (0..3).map(|m| bench.machine().stepper().position(m)).collect();
    assert!((1649..=1652).contains(&steps[0]), "carriage at {}", steps[0]);
    assert_eq!(steps[0], steps[1]);
    assert_eq!(steps[1], steps[2]);

    let end = position(&mut bench, 0);
    assert!(end[0].abs() < 2e-2 && end[1].abs() < 2e-2);
    assert!((end[2] + 200.).abs() < 2e-2);
}

#[test]
fn polar_angle_keeps_turning_past_half_a_turn() {
    let mut polar = Space::new(kind::POLAR, 2, 2).unwrap();
    wired(&mut polar, 0, 20);
    wired(&mut polar, 1, 24);
    let mut bench = Bench::new(machine_with(vec![polar]));

    for (x, y) in [(1., 0.), (0., 1.), (-1., 0.), (0., -1.)] {
        assert_eq!(bench.command(&goto(2, &[(0, x), (1, y)], false)), Delivery::Ack);
    }
    bench.settle();

    let stepper = bench.machine().stepper();
    assert_eq!(stepper.position(0), 100);
    // Three quarter turns forward instead of a quarter turn back.
    assert_eq!(stepper.position(1), 471);

    let xy = position(&mut bench, 0);
    assert!(xy[0].abs() < 1e-2);
    assert!((xy[1] + 1.).abs() < 1e-2);
}

#[test]
fn follower_mirrors_its_leader() {
    let mut x = Space::new(kind::CARTESIAN, 1, 1).unwrap();
    wired(&mut x, 0, 20);
    let mut follower = Space::new(kind::FOLLOWER, 0, 1).unwrap();
    wired(&mut follower, 0, 40);
    follower.motors[0].steps_per_unit = 200.;
    if let Kinematics::Follower(f) = &mut follower.kinematics {
        f.set_leader(0, MotorRef { space: 0, motor: 0 });
    }
    let mut bench = Bench::new(machine_with(vec![x, follower]));

    assert_eq!(bench.command(&goto(1, &[(0, 5.)], true)), Delivery::Ack);
    bench.settle();

    let pins = bench.machine().pins();
    assert_eq!(pins.rising_edges(20), 500);
    assert_eq!(pins.rising_edges(40), 1000);
    assert!(pins.level(41));

    // A follower has no coordinates of its own.
    let getpos = Packet::new(command::GETPOS).with(1u8);
    assert_eq!(bench.command(&getpos), Delivery::Stall);
}
