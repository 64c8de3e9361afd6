mod common;

use common::{cartesian, floats, goto, Bench, BoardMachine, Store};
use franklin::hal::Pin;
use franklin::link::Delivery;
use franklin::packet::Packet;
use franklin::protocol::{command, event, object_kind};
use franklin::sim::{SimAdc, SimPins};
use franklin::store::Store as _;
use franklin::temp::Temp;
use franklin::Machine;

const POWER: u8 = 30;
const THERMISTOR: u8 = 1;

fn with_heater(mut machine: BoardMachine) -> BoardMachine {
    machine
        .add_temp(Temp {
            power_pin: Pin::new(POWER, false),
            thermistor_pin: Pin::new(THERMISTOR, false),
            ..Temp::default()
        })
        .expect("room for the temp");
    machine
}

#[test]
fn settings_survive_a_restart() {
    let mut bench = Bench::new(with_heater(cartesian(2)));
    let mut write = Packet::new(command::WRITE).with(&[object_kind::AXIS, 0, 1][..]);
    for v in [0.5f32, -10., 10.] {
        write.push(v);
    }
    assert_eq!(bench.command(&write), Delivery::Ack);
    let save = Packet::new(command::SAVE).with(&[object_kind::ALL, 0, 0][..]);
    assert_eq!(bench.command(&save), Delivery::Ack);

    let mut store = Store::new();
    for (addr, &byte) in bench.machine().store().data().iter().enumerate() {
        store.write(addr, byte).unwrap();
    }
    let mut restarted = Machine::new(SimPins::new(), SimAdc::new(), store);
    restarted.load_settings().unwrap();

    assert_eq!(restarted.spaces().len(), 1);
    let (before, after) = (&bench.machine().spaces()[0], &restarted.spaces()[0]);
    assert_eq!(after.kinematics, before.kinematics);
    for (a, b) in after.motors.iter().zip(before.motors.iter()) {
        assert_eq!((a.step, a.dir, a.steps_per_unit), (b.step, b.dir, b.steps_per_unit));
    }
    assert_eq!(restarted.temps().len(), 1);
    assert_eq!(restarted.temps()[0].power_pin, Pin::new(POWER, false));
    let axis = restarted.spaces()[0].axes[1];
    assert_eq!((axis.offset, axis.min, axis.max), (0.5, -10., 10.));

    // Targets past the saved bound are clamped after the restart too.
    let mut bench = Bench::new(restarted);
    assert_eq!(bench.command(&goto(2, &[(1, 20.)], true)), Delivery::Ack);
    bench.settle();
    assert_eq!(bench.machine().stepper().position(1), 1000);
}

#[test]
fn motor_settings_change_the_step_scale() {
    let mut bench = Bench::new(cartesian(1));
    let read = Packet::new(command::READ).with(&[object_kind::MOTOR, 0, 0][..]);
    assert_eq!(bench.command(&read), Delivery::Ack);
    bench.run(5);
    let data = bench.events.of(event::DATA);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0][..3], [object_kind::MOTOR, 0, 0]);
    let settings = &data[0][3..];
    assert_eq!(settings.len(), 6 * 2 + 2 * 4);
    assert_eq!(floats(&settings[12..16]), vec![100.]);

    let mut changed = settings.to_vec();
    changed[12..16].copy_from_slice(&80f32.to_le_bytes());
    let write = Packet::new(command::WRITE)
        .with(&[object_kind::MOTOR, 0, 0][..])
        .with(&changed[..]);
    assert_eq!(bench.command(&write), Delivery::Ack);

    assert_eq!(bench.command(&goto(1, &[(0, 1.)], false)), Delivery::Ack);
    bench.settle();
    assert_eq!(bench.machine().pins().rising_edges(20), 80);
}

#[test]
fn heater_follows_target_and_reports_the_window() {
    let mut bench = Bench::new(with_heater(cartesian(1)));
    bench.board.machine.adc_mut().set(THERMISTOR, 512);

    let settemp = Packet::new(command::SETTEMP).with(0u8).with(200f32);
    assert_eq!(bench.command(&settemp), Delivery::Ack);
    bench.run(10);
    assert!(bench.machine().pins().level(POWER));

    let waittemp = Packet::new(command::WAITTEMP)
        .with(0u8)
        .with(190f32)
        .with(210f32);
    assert_eq!(bench.command(&waittemp), Delivery::Ack);
    bench.run(20);
    assert!(bench.events.of(event::TEMPCB).is_empty());

    // About 197 °C with the default thermistor.
    bench.board.machine.adc_mut().set(THERMISTOR, 8);
    bench.run(20);
    assert_eq!(bench.events.of(event::TEMPCB), vec![vec![0]]);

    let readtemp = Packet::new(command::READTEMP).with(0u8);
    assert_eq!(bench.command(&readtemp), Delivery::Ack);
    bench.run(5);
    let temp = bench.events.of(event::TEMP);
    assert_eq!(temp.len(), 1);
    assert_eq!(temp[0][0], 0);
    let celsius = floats(&temp[0][1..])[0];
    assert!(celsius > 190. && celsius < 200., "read {celsius}");
    assert!(bench.machine().pins().level(POWER));

    let off = Packet::new(command::SETTEMP).with(0u8).with(f32::NAN);
    assert_eq!(bench.command(&off), Delivery::Ack);
    assert!(!bench.machine().pins().level(POWER));
}

#[test]
fn unknown_objects_stall() {
    let mut bench = Bench::new(cartesian(1));
    let read = Packet::new(command::READ).with(&[object_kind::TEMP, 0, 0][..]);
    assert_eq!(bench.command(&read), Delivery::Stall);
    let load = Packet::new(command::LOAD).with(&[object_kind::ALL, 0, 0][..]);
    // Nothing was saved yet.
    assert_eq!(bench.command(&load), Delivery::Stall);
    assert_eq!(bench.machine().spaces().len(), 1);
}
