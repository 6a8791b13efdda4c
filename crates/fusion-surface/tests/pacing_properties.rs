//! Property-based tests for frame pacing and flip/ack bookkeeping.

use fusion_config::FusionConfig;
use fusion_surface::{
    Clock, FlipFlags, FrameTimeConfig, FrameTimer, SurfaceClient, SurfaceConfig, SurfaceStore,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Deterministic clock: time only moves when the pacer sleeps or a test
/// step advances it.
#[derive(Clone)]
struct ScriptClock {
    now: Arc<AtomicI64>,
}

impl ScriptClock {
    fn new() -> Self {
        ScriptClock {
            now: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl Clock for ScriptClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_micros(&self, micros: i64) {
        self.now.fetch_add(micros.max(0), Ordering::SeqCst);
    }
}

proptest! {
    // Returned presentation times never decrease, never run behind the
    // clock, and never lead it by more than max_advance.
    #[test]
    fn frame_times_are_monotonic_with_bounded_lead(
        interval in 1_000i64..50_000,
        max_advance in 1_000i64..100_000,
        calls in 1usize..40,
    ) {
        let clock = ScriptClock::new();
        let timer = FrameTimer::with_clock(clock.clone());
        let cfg = FrameTimeConfig::default();

        let mut last = 0i64;
        for _ in 0..calls {
            let t = timer.next_frame_time(&cfg, &cfg, interval, max_advance);
            let now = clock.now_micros();
            prop_assert!(t >= last, "time went backwards: {t} < {last}");
            prop_assert!(t >= now, "time behind the clock: {t} < {now}");
            prop_assert!(t - now <= max_advance, "lead {} exceeds {max_advance}", t - now);
            last = t;
        }
    }

    // Arbitrary forward clock jumps between calls never push returned
    // times backwards.
    #[test]
    fn clock_jumps_never_run_times_backwards(
        interval in 1_000i64..50_000,
        jumps in proptest::collection::vec(0i64..200_000, 1..30),
    ) {
        let clock = ScriptClock::new();
        let timer = FrameTimer::with_clock(clock.clone());
        let cfg = FrameTimeConfig::default();

        let mut last = 0i64;
        for jump in jumps {
            clock.now.fetch_add(jump, Ordering::SeqCst);
            let t = timer.next_frame_time(&cfg, &cfg, interval, 0);
            prop_assert!(t >= last);
            prop_assert!(t >= clock.now_micros());
            last = t;
        }
    }

    // frame_ack never exceeds local_flip_count, never decreases, and
    // would_block agrees with the back-pressure formula after every step
    // of any flip/ack interleaving.
    #[test]
    fn flip_ack_bookkeeping_invariants(
        buffers in 2usize..=3,
        ops in proptest::collection::vec(any::<bool>(), 1..60),
    ) {
        let store = SurfaceStore::new();
        let surface = store.create(SurfaceConfig::new(64, 64, buffers)).unwrap();
        let client = SurfaceClient::new(surface.clone(), &FusionConfig::default());

        let mut released = 0u32;
        let mut last_ack = 0u32;
        for flip in ops {
            if flip {
                client.flip(None, FlipFlags::NOWAIT).unwrap();
            } else if released < client.local_flip_count() {
                // The consumer releases the oldest unacked frame.
                released += 1;
                surface.frame_ack(released);
            }

            let local = client.local_flip_count();
            let ack = client.frame_ack();
            prop_assert!(ack <= local, "ack {ack} ran past flips {local}");
            prop_assert!(ack >= last_ack, "ack went backwards: {ack} < {last_ack}");
            prop_assert_eq!(
                client.would_block(),
                local.wrapping_sub(ack) as usize >= buffers - 1
            );
            last_ack = ack;
        }
    }

    // Acks delivered in arbitrary order (skips, stales, repeats) keep the
    // acked counter monotonic and the local flip count caught up.
    #[test]
    fn out_of_order_acks_stay_monotonic(
        acks in proptest::collection::vec(0u32..50, 1..40),
    ) {
        let store = SurfaceStore::new();
        let surface = store.create(SurfaceConfig::new(64, 64, 3)).unwrap();
        let client = SurfaceClient::new(surface.clone(), &FusionConfig::default());

        let mut prev = 0u32;
        for k in acks {
            surface.frame_ack(k);
            prop_assert!(surface.flips_acked() >= prev);
            prop_assert!(client.frame_ack() <= client.local_flip_count());
            prev = surface.flips_acked();
        }
    }
}
