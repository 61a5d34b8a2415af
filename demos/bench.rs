use clap::{Parser, Subcommand};
use multicast_channel::{
    Quantiles, mono_time_ns,
    multicast::{Channel, Endpoint, channel},
};
use std::time::Duration;

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

const BUFFER_LEN: usize = 4096;
const TRIALS: usize = 100_000;

/// Example payload type carried in each ring slot.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct Payload {
    timestamp: u64,
    seq: u64,
}

#[derive(Parser, Debug)]
#[command(version, about = "Benchmarks for the multicast ring-buffer channel", long_about = None)]
struct Args {
    /// Operation mode, selected via subcommand.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// One timestamping writer broadcasting to multiple reader endpoints.
    Broadcast {
        /// Minimum period between messages in nanoseconds; 0 disables throttling.
        #[arg(short = 'p', long = "period", default_value_t = 0)]
        period: u64,

        /// Maximum number of reader endpoints.
        #[arg(short = 'm', long = "max-readers", default_value_t = 4)]
        max_readers: usize,
    },

    /// Single-producer fast path (no publish timestamps) with one reader.
    Fastpath {
        /// Minimum period between messages in nanoseconds; 0 disables throttling.
        #[arg(short = 'p', long = "period", default_value_t = 0)]
        period: u64,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    log::info!(
        "payload size: {}, buffer length: {}, trials: {}",
        std::mem::size_of::<Payload>(),
        BUFFER_LEN,
        TRIALS,
    );

    match args.command {
        Commands::Broadcast {
            period,
            max_readers,
        } => {
            assert!(max_readers > 0, "at least one reader endpoint is required");
            let ch = channel::<Payload>(BUFFER_LEN, max_readers);

            let cores = core_affinity::get_core_ids().unwrap();
            assert!(
                cores.len() > 1,
                "At least 2 CPU cores are required (found {}).",
                cores.len()
            );
            let n_readers = max_readers.min(cores.len().saturating_sub(2).max(1));
            println!("period: {}, n_readers: {}", period, n_readers);

            let readers: Vec<_> = (0..n_readers)
                .map(|i| {
                    let ep = ch.new_endpoint(0).unwrap();
                    let core_id = cores[(2 + i) % cores.len()];
                    std::thread::spawn(move || {
                        core_affinity::set_for_current(core_id);
                        reader(ep, &format!("reader-{i}"))
                    })
                })
                .collect();

            let core_id = cores[1];
            let tx = ch.clone();
            let writer = std::thread::spawn(move || {
                core_affinity::set_for_current(core_id);
                writer(tx, period)
            });

            writer.join().unwrap();
            for handle in readers {
                handle.join().unwrap();
            }
        }

        Commands::Fastpath { period } => {
            println!("period: {}", period);
            let ch = channel::<Payload>(BUFFER_LEN, 1);
            let ep = ch.new_endpoint(0).unwrap();

            let rx = std::thread::spawn(move || reader(ep, "fast-reader"));

            let mut trials = Quantiles::with_capacity(TRIALS);
            for seq in 0..TRIALS as u64 {
                let ts0 = mono_time_ns();
                // SAFETY: this loop is the only sender on the channel.
                unsafe {
                    ch.fast_send(Payload {
                        timestamp: ts0,
                        seq,
                    })
                };
                trials.record(mono_time_ns() - ts0);
                if period > 0 {
                    delay(ts0 + period);
                }
            }
            ch.close(None);

            trials.sort();
            trials.print_csv("fast_send");
            rx.join().unwrap();
        }
    }
}

#[inline(never)]
fn writer(tx: Channel<Payload>, period: u64) {
    let mut trials = Quantiles::with_capacity(TRIALS);

    for seq in 0..TRIALS as u64 {
        let ts0 = mono_time_ns();
        tx.send(Payload {
            timestamp: ts0,
            seq,
        });
        trials.record(mono_time_ns() - ts0);
        if period > 0 {
            delay(ts0 + period);
        }
    }
    tx.close(None);

    trials.sort();
    trials.print_csv("send");
}

#[inline(never)]
fn reader(ep: Endpoint<Payload>, label: &str) {
    let mut trials = Quantiles::with_capacity(TRIALS);
    let mut prev_seq = None;

    ep.range(
        |payload, _, closed| {
            if closed {
                return true;
            }
            trials.record(mono_time_ns() - payload.timestamp);
            if let Some(prev) = prev_seq {
                assert_eq!(payload.seq, prev + 1, "gap in the delivered stream");
            }
            prev_seq = Some(payload.seq);
            true
        },
        Duration::ZERO,
    );

    trials.sort();
    trials.print_csv(label);
}

/// Busy-waits until the current monotonic time reaches or exceeds `deadline_ns`.
#[inline(always)]
fn delay(deadline_ns: u64) -> u64 {
    loop {
        let ts = mono_time_ns();
        if ts >= deadline_ns {
            break ts;
        }
    }
}
