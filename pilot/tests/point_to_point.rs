//! Point-to-point round trips over a thread-backed world.

use pilot::communication::{initialize, Config, ThreadTransport};
use pilot::{pi_call, Datatype, Pilot, PilotOptions, Slot, Value};

type Ctx = Pilot<ThreadTransport>;

fn join_ok(guards: pilot::communication::WorkerGuards<()>) {
    for result in guards.join() {
        result.unwrap();
    }
}

fn relay(pilot: &mut Ctx, _arg: i64) -> i32 {
    let inbound = pilot.channel(1).unwrap();
    let outbound = pilot.channel(2).unwrap();
    let mut data = [0i32; 20];
    pilot
        .read(inbound, "%20d", &mut [Slot::I32s(&mut data)])
        .unwrap();
    pilot.write(outbound, "%20d", &[Value::I32s(&data)]).unwrap();
    0
}

#[test]
fn int_array_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(relay, 0).unwrap();
        let to_worker = pilot.create_channel(None, Some(&worker)).unwrap();
        let from_worker = pilot.create_channel(Some(&worker), None).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let sent: Vec<i32> = (0..20).map(|i| i % 2).collect();
        pi_call!(pilot)
            .write(to_worker, "%20d", &[Value::I32s(&sent)])
            .unwrap();
        let mut back = [0i32; 20];
        pi_call!(pilot)
            .read(from_worker, "%20d", &mut [Slot::I32s(&mut back)])
            .unwrap();
        assert_eq!(&back[..], &sent[..]);
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn scalar_reader(pilot: &mut Ctx, _arg: i64) -> i32 {
    let chan = pilot.channel(1).unwrap();
    let mut c = 0i8;
    let mut hd = 0i16;
    let mut d = 0i32;
    let mut ld = 0i64;
    let mut hhu = 0u8;
    let mut hu = 0u16;
    let mut u = 0u32;
    let mut lu = 0u64;
    let mut f = 0.0f32;
    let mut lf = 0.0f64;
    let mut b = 0u8;
    pilot
        .read(
            chan,
            "%c %hd %d %ld %hhu %hu %u %lu %f %lf %b",
            &mut [
                Slot::I8(&mut c),
                Slot::I16(&mut hd),
                Slot::I32(&mut d),
                Slot::I64(&mut ld),
                Slot::U8(&mut hhu),
                Slot::U16(&mut hu),
                Slot::U32(&mut u),
                Slot::U64(&mut lu),
                Slot::F32(&mut f),
                Slot::F64(&mut lf),
                Slot::U8(&mut b),
            ],
        )
        .unwrap();
    assert_eq!(c, -7);
    assert_eq!(hd, -300);
    assert_eq!(d, 123_456);
    assert_eq!(ld, -5_000_000_000);
    assert_eq!(hhu, 200);
    assert_eq!(hu, 60_000);
    assert_eq!(u, 4_000_000_000);
    assert_eq!(lu, 18_000_000_000_000_000_000);
    assert_eq!(f, 2.5);
    assert_eq!(lf, -0.125);
    assert_eq!(b, 0xA5);
    0
}

#[test]
fn every_scalar_type_round_trips() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(scalar_reader, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        pilot
            .write(
                chan,
                "%c %hd %d %ld %hhu %hu %u %lu %f %lf %b",
                &[
                    Value::I8(-7),
                    Value::I16(-300),
                    Value::I32(123_456),
                    Value::I64(-5_000_000_000),
                    Value::U8(200),
                    Value::U16(60_000),
                    Value::U32(4_000_000_000),
                    Value::U64(18_000_000_000_000_000_000),
                    Value::F32(2.5),
                    Value::F64(-0.125),
                    Value::U8(0xA5),
                ],
            )
            .unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn var_reader(pilot: &mut Ctx, _arg: i64) -> i32 {
    let chan = pilot.channel(1).unwrap();
    let mut length = 0i32;
    let mut data = Vec::new();
    pilot
        .read(
            chan,
            "%^d",
            &mut [Slot::I32(&mut length), Slot::VarI32(&mut data)],
        )
        .unwrap();
    assert_eq!(length, 20);
    assert_eq!(data, (0..20).collect::<Vec<i32>>());
    0
}

#[test]
fn variable_length_array_round_trip() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(var_reader, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let data: Vec<i32> = (0..20).collect();
        pilot.write(chan, "%^d", &[Value::I32s(&data)]).unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn string_reader(pilot: &mut Ctx, _arg: i64) -> i32 {
    let chan = pilot.channel(1).unwrap();
    let mut text = String::new();
    pilot.read(chan, "%s", &mut [Slot::Str(&mut text)]).unwrap();
    assert_eq!(text, "AAAABBBBCCCCDDDDEEE");
    0
}

#[test]
fn string_round_trip() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(string_reader, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        pilot
            .write(chan, "%s", &[Value::Str("AAAABBBBCCCCDDDDEEE")])
            .unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn raw_reader(pilot: &mut Ctx, _arg: i64) -> i32 {
    let chan = pilot.channel(1).unwrap();
    let mut raw = [0u8; 16];
    pilot
        .read(
            chan,
            "%2m",
            &mut [Slot::Datatype(Datatype::User(8)), Slot::U8s(&mut raw)],
        )
        .unwrap();
    assert_eq!(&raw[..4], &[1, 2, 3, 4]);
    assert_eq!(&raw[12..], &[13, 14, 15, 16]);
    0
}

#[test]
fn caller_typed_elements_round_trip() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(raw_reader, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let raw: Vec<u8> = (1..=16).collect();
        pilot
            .write(
                chan,
                "%2m",
                &[Value::Datatype(Datatype::User(8)), Value::U8s(&raw)],
            )
            .unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn mismatched_reader(pilot: &mut Ctx, _arg: i64) -> i32 {
    let chan = pilot.channel(1).unwrap();
    let mut wrong = 0.0f64;
    let error = pilot
        .read(chan, "%lf", &mut [Slot::F64(&mut wrong)])
        .unwrap_err();
    assert!(matches!(error, pilot::PilotError::FormatMismatch { .. }));
    0
}

#[test]
fn format_mismatch_is_caught_at_level_two() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let options = PilotOptions::default().quiet().check_level(2);
        let mut pilot = Pilot::configure(endpoint, options).unwrap();
        let worker = pilot.create_process(mismatched_reader, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        pilot.write(chan, "%d", &[Value::I32(5)]).unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn wrong_end_writer(pilot: &mut Ctx, _arg: i64) -> i32 {
    // This rank is the consumer of channel 1, not its producer.
    let chan = pilot.channel(1).unwrap();
    let error = pilot
        .write(chan, "%d", &[Value::I32(1)])
        .unwrap_err();
    assert!(matches!(error, pilot::PilotError::EndpointWriter { .. }));

    let mut value = 0i32;
    pilot.read(chan, "%d", &mut [Slot::I32(&mut value)]).unwrap();
    assert_eq!(value, 9);
    0
}

#[test]
fn endpoint_direction_is_enforced() {
    let guards = initialize(Config::Process(2), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let worker = pilot.create_process(wrong_end_writer, 0).unwrap();
        let chan = pilot.create_channel(None, Some(&worker)).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let error = pilot
            .read(chan, "%d", &mut [Slot::I32(&mut 0)])
            .unwrap_err();
        assert!(matches!(error, pilot::PilotError::EndpointReader { .. }));
        pilot.write(chan, "%d", &[Value::I32(9)]).unwrap();
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}
