//! Passes a counter around a ring of processes.
//!
//! Run with `cargo run --example ring -- -w 4`.

use pilot::communication::{initialize, Config, ThreadTransport};
use pilot::{pi_call, Pilot, PilotOptions, Slot, Value};

fn hop(pilot: &mut Pilot<ThreadTransport>, arg: i64) -> i32 {
    let inbound = pilot.channel(arg as usize).unwrap();
    let outbound = pilot.channel(arg as usize + 1).unwrap();
    let mut counter = 0i32;
    pi_call!(pilot)
        .read(inbound, "%d", &mut [Slot::I32(&mut counter)])
        .unwrap();
    println!("{} saw {}", pilot.process_name(), counter);
    pi_call!(pilot)
        .write(outbound, "%d", &[Value::I32(counter + 1)])
        .unwrap();
    0
}

fn main() {
    let config = {
        let mut args: Vec<String> = std::env::args().collect();
        // Pilot options are consumed here; the per-rank parse below sees
        // the same argv, so every rank derives the same settings.
        let _ = PilotOptions::from_args(&mut args);
        Config::from_args(args.into_iter().skip(1)).unwrap()
    };
    if config.ranks() < 2 {
        eprintln!("the ring needs at least two ranks; pass -w N");
        return;
    }
    let hops = config.ranks() - 1;

    initialize(config, move |endpoint| {
        let mut args: Vec<String> = std::env::args().collect();
        let options = PilotOptions::from_args(&mut args);
        let mut pilot = Pilot::configure(endpoint, options).unwrap();

        let mut previous = None;
        for index in 0..hops {
            let worker = pilot.create_process(hop, index as i64 + 1).unwrap();
            pilot
                .create_channel(previous.as_ref(), Some(&worker))
                .unwrap();
            previous = Some(worker);
        }
        // Close the ring back to main.
        pilot.create_channel(previous.as_ref(), None).unwrap();

        if pilot.start_all().unwrap() != 0 {
            return;
        }
        let first = pilot.channel(1).unwrap();
        let last = pilot.channel(hops + 1).unwrap();
        pi_call!(pilot).write(first, "%d", &[Value::I32(0)]).unwrap();
        let mut counter = 0i32;
        pi_call!(pilot)
            .read(last, "%d", &mut [Slot::I32(&mut counter)])
            .unwrap();
        println!("main got {} after {} hops", counter, hops);
        pilot.stop_main(0).unwrap();
    })
    .unwrap()
    .join();
}
