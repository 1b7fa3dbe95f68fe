//! Rendezvous benchmarks: telaio vs crossbeam vs std
//!
//! Run with: cargo +nightly bench
//!
//! The [`Pass`](telaio::Pass) is a single-slot rendezvous, so the fair
//! baselines are the zero-capacity channels: `crossbeam_channel::bounded(0)`
//! and `std::sync::mpsc::sync_channel(0)`, where every send meets its
//! receive the same way a call meets its accept.
//!
//! **Note**: the pass carries no buffering at all, and the sync `try_*`
//! path measured here performs a mutex handoff plus an inline forwarder,
//! against the channels' own rendezvous protocols.

#![feature(test)]

extern crate test;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::bounded as crossbeam_bounded;
use telaio::{Pass, sync_wait};
use test::Bencher;

const ROUNDS: usize = 1_000;

/// One thread accepts in a loop, the bench thread calls: telaio pass.
#[bench]
fn pass_rendezvous(b: &mut Bencher) {
    let pass: Arc<Pass<usize>> = Arc::new(Pass::new());
    let stop = Arc::new(AtomicBool::new(false));

    let acceptor = {
        let pass = pass.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let _ = test::black_box(sync_wait(pass.async_accept()));
            }
        })
    };

    b.iter(|| {
        for i in 0..ROUNDS {
            let _ = sync_wait(pass.async_call(i));
        }
    });

    stop.store(true, Ordering::Release);
    // unblock the acceptor, which may not have parked yet
    while !acceptor.is_finished() {
        let _ = pass.try_call(0);
        std::thread::yield_now();
    }
    acceptor.join().unwrap();
}

/// Same shape over a zero-capacity crossbeam channel.
#[bench]
fn crossbeam_rendezvous(b: &mut Bencher) {
    let (tx, rx) = crossbeam_bounded::<usize>(0);
    let stop = Arc::new(AtomicBool::new(false));

    let receiver = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let _ = test::black_box(rx.recv());
            }
        })
    };

    b.iter(|| {
        for i in 0..ROUNDS {
            tx.send(i).unwrap();
        }
    });

    stop.store(true, Ordering::Release);
    let _ = tx.send(0);
    receiver.join().unwrap();
}

/// Same shape over a std rendezvous channel.
#[bench]
fn std_rendezvous(b: &mut Bencher) {
    let (tx, rx) = std::sync::mpsc::sync_channel::<usize>(0);
    let stop = Arc::new(AtomicBool::new(false));

    let receiver = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let _ = test::black_box(rx.recv());
            }
        })
    };

    b.iter(|| {
        for i in 0..ROUNDS {
            tx.send(i).unwrap();
        }
    });

    stop.store(true, Ordering::Release);
    let _ = tx.send(0);
    receiver.join().unwrap();
}

/// Spawn-and-await round trips through a scope.
#[bench]
fn scope_spawn_await(b: &mut Bencher) {
    use telaio::{Scope, just};

    b.iter(|| {
        let scope = Scope::new();
        for i in 0..ROUNDS {
            let future = scope.spawn_future(just(i));
            let _ = test::black_box(sync_wait(future));
        }
        let _ = sync_wait(scope.join());
    });
}
