//! # Multicast bounded ring-buffer channel
//!
//! A fast, concurrent **multicast** channel: one shared circular buffer
//! from which any number of independently-positioned endpoints read the
//! same stream of values, concurrently with one or more producers.
//!
//! This is not an MPMC queue. A queue hands each value to exactly one
//! consumer; this channel hands **every value to every endpoint** that
//! was attached when it was published.
//!
//! # Features
//!
//! * **Lock-free** publish and commit built on atomic 64-bit counters
//! * **Multi-producer** `send` with fetch-and-add slot reservation, plus a
//!   **single-producer** `fast_send` path that skips reservation entirely
//! * **Backpressure**: a full buffer blocks producers until the slowest
//!   endpoint advances, so no attached endpoint ever loses data
//! * **Replay**: new endpoints can start with up to a full buffer of
//!   history (`keep`), even on an already-closed channel
//! * **Age filtering**: endpoints may skip values older than a `max_age`
//! * **Cache-friendly** layout (CachePadded counters and slots)
//! * Zero allocations after construction; endpoint records are recycled
//!
//! # Waiting Behavior
//!
//! Endpoints with nothing to read escalate over wall-clock time: they
//! spin-yield for the first millisecond (absorbing races with producers
//! that are mid-publication), keep yielding while watching for close for
//! up to 250 ms, and only then block on a condition variable that is
//! broadcast on publish, close, and cancel. Producers facing a full
//! buffer spin-yield cooperatively while the window slides.
//!
//! **Implications:**
//!
//! * Latency stays low while traffic flows (no OS blocking on the hot path)
//! * An idle endpoint eventually parks on a condition variable and stops
//!   burning its core
//! * Close is only delivered after an endpoint has drained the buffer,
//!   and is delivered exactly once
//!
//! # Quick Example
//!
//! ```ignore
//! use multicast_channel::multicast::{channel, REPLAY_ALL};
//! use std::time::Duration;
//!
//! let ch = channel::<u64>(512, 8);
//! let ep = ch.new_endpoint(REPLAY_ALL)?;
//!
//! ch.send(42);
//! ch.close(None);
//!
//! ep.range(
//!     |value, err, closed| {
//!         if closed {
//!             assert!(err.is_none());
//!         } else {
//!             println!("got {value}");
//!         }
//!         true
//!     },
//!     Duration::ZERO,
//! );
//! ```
//!
//! # Design Overview
//!
//! Four monotone counters describe the window over the ring:
//!
//! ```text
//! begin ≤ min(endpoint cursors) ≤ commit ≤ write ≤ end,   end − begin = N
//! ```
//!
//! Producers reserve positions from `write`, store the value, and mark
//! the slot published with a timestamped odd marker. A cooperative
//! committer — run opportunistically by whichever reader arrives first —
//! folds contiguous published prefixes into `commit`, the index readers
//! trust. When the ring is full, producers slide `begin`/`end` forward,
//! gated by the slowest endpoint cursor; canceled and drained endpoints
//! park their cursor and stop constraining the window.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

pub mod multicast;
mod utils;

pub use utils::{Quantiles, mono_time_ns};
