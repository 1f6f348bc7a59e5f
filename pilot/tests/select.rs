//! Selector bundles: blocking and non-blocking channel selection.

use pilot::communication::{initialize, Config, ThreadTransport};
use pilot::{Pilot, PilotOptions, Slot, Usage, Value};

type Ctx = Pilot<ThreadTransport>;

fn join_ok(guards: pilot::communication::WorkerGuards<()>) {
    for result in guards.join() {
        result.unwrap();
    }
}

fn gated_writer(pilot: &mut Ctx, arg: i64) -> i32 {
    // Wait for the go signal, then write on the selector member.
    let go = pilot.channel(arg as usize + 2).unwrap();
    let out = pilot.channel(arg as usize).unwrap();
    let mut token = 0i32;
    pilot.read(go, "%d", &mut [Slot::I32(&mut token)]).unwrap();
    pilot
        .write(out, "%d", &[Value::I32(arg as i32 * 10)])
        .unwrap();
    0
}

#[test]
fn select_finds_the_ready_channel() {
    let guards = initialize(Config::Process(3), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let w1 = pilot.create_process(gated_writer, 1).unwrap();
        let w2 = pilot.create_process(gated_writer, 2).unwrap();
        let c1 = pilot.create_channel(Some(&w1), None).unwrap();
        let c2 = pilot.create_channel(Some(&w2), None).unwrap();
        let go1 = pilot.create_channel(None, Some(&w1)).unwrap();
        let go2 = pilot.create_channel(None, Some(&w2)).unwrap();
        let selector = pilot.create_bundle(Usage::Select, &[c1, c2]).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }

        // Nobody has written yet, so the non-blocking probe comes up empty.
        assert_eq!(pilot.try_select(selector).unwrap(), None);

        pilot.write(go1, "%d", &[Value::I32(1)]).unwrap();
        pilot.write(go2, "%d", &[Value::I32(1)]).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let index = pilot.select(selector).unwrap();
            // The probed message is still there for the read.
            let chan = pilot.bundle_channel(selector, index).unwrap();
            assert!(pilot.channel_has_data(chan).unwrap());
            let mut value = 0i32;
            pilot.read(chan, "%d", &mut [Slot::I32(&mut value)]).unwrap();
            assert_eq!(value, (index as i32 + 1) * 10);
            seen.push(value);
        }
        seen.sort();
        assert_eq!(seen, vec![10, 20]);
        assert_eq!(pilot.bundle_size(selector).unwrap(), 2);

        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}

fn plain_writer(pilot: &mut Ctx, arg: i64) -> i32 {
    let out = pilot.channel(arg as usize).unwrap();
    pilot.write(out, "%d", &[Value::I32(42)]).unwrap();
    0
}

#[test]
fn selecting_a_non_selector_bundle_is_refused() {
    let guards = initialize(Config::Process(3), |endpoint| {
        let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
        let w1 = pilot.create_process(plain_writer, 1).unwrap();
        let w2 = pilot.create_process(plain_writer, 2).unwrap();
        let c1 = pilot.create_channel(Some(&w1), None).unwrap();
        let c2 = pilot.create_channel(Some(&w2), None).unwrap();
        let gatherer = pilot.create_bundle(Usage::Gather, &[c1, c2]).unwrap();
        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let error = pilot.select(gatherer).unwrap_err();
        assert!(matches!(
            error,
            pilot::PilotError::BundleUsage {
                usage: Usage::Gather,
                ..
            }
        ));
        // Drain the gather so the writers can finish.
        let mut sink = [0i32; 2];
        pilot
            .gather(gatherer, "%d", &mut [Slot::I32s(&mut sink)])
            .unwrap();
        assert_eq!(sink, [42, 42]);
        pilot.stop_main(0).unwrap();
    })
    .unwrap();
    join_ok(guards);
}
