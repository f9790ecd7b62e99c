// Demo binary: three weighted classes fed by producer threads, with the
// dispatcher pacing dequeues at the link drain rate. Prints a JSON stats
// snapshot once per second until Ctrl+C.

use qfq_rl::{ClassConfig, EnqueueStatus, Packet, Qfq, SchedulerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CliOptions {
    spin_cpu: i32,
    producers: usize,
    duration_secs: Option<u64>,
}

fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        spin_cpu: 2,
        producers: 2,
        duration_secs: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (arg.clone(), args.next()),
        };
        match (key.as_str(), value) {
            ("--spin-cpu", Some(v)) => {
                if let Ok(cpu) = v.parse() {
                    options.spin_cpu = cpu;
                }
            }
            ("--producers", Some(v)) => {
                if let Ok(n) = v.parse::<usize>() {
                    options.producers = n.clamp(1, 64);
                }
            }
            ("--duration", Some(v)) => {
                options.duration_secs = v.parse().ok();
            }
            _ => {}
        }
    }
    options
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_options();

    let config = SchedulerConfig {
        spin_cpu: options.spin_cpu,
        executors: options.producers,
        ..SchedulerConfig::default()
    };
    let mut sched = Qfq::new(config);

    // Three classes at 1:2:4. Producers address them by packet priority.
    sched.create_class(1, ClassConfig::new(1, 1536))?;
    sched.create_class(2, ClassConfig::new(2, 1536))?;
    sched.create_class(3, ClassConfig::new(4, 1536))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = running.clone();
    ctrlc::set_handler(move || {
        running_ctrlc.store(false, Ordering::Relaxed);
    })?;

    let mut producers = Vec::new();
    for executor in 0..options.producers {
        let producer = sched.producer(executor);
        let running = running.clone();
        let handle = std::thread::Builder::new()
            .name(format!("qfq-producer-{executor}"))
            .spawn(move || {
                let payload = [0u8; 1500];
                let mut seq = 0u64;
                while running.load(Ordering::Relaxed) {
                    let classid = 1 + (seq % 3);
                    seq += 1;
                    match producer.enqueue(Packet::new(classid, &payload)) {
                        EnqueueStatus::Queued => {}
                        // Backlog is ahead of the link; let it drain.
                        _ => std::thread::yield_now(),
                    }
                }
            })?;
        producers.push(handle);
    }

    let started = Instant::now();
    let mut last_report = Instant::now();
    while running.load(Ordering::Relaxed) {
        if let Some(secs) = options.duration_secs {
            if started.elapsed() >= Duration::from_secs(secs) {
                running.store(false, Ordering::Relaxed);
                break;
            }
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            println!("{}", serde_json::to_string(&sched.stats())?);
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    for handle in producers {
        let _ = handle.join();
    }
    let final_stats = sched.stats();
    sched.shutdown();
    println!("{}", serde_json::to_string_pretty(&final_stats)?);

    Ok(())
}
