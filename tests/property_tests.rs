//! Property-based tests for invariants using proptest
//!
//! - Threshold evaluation only reports flips, never the first sample
//! - Counter deltas and rates stay within their arithmetic bounds
//! - Top-N rankings are ordered and purged with their device
//! - The failure rate follows the trailing window

use fleetmon::actors::poll::FailureWindow;
use fleetmon::monitors::derivation::{bits_per_second, counter_delta};
use fleetmon::monitors::{CriticalDetector, Resource, TopCategory, TopTable, TopValue};
use proptest::prelude::*;

const COUNTER32: u64 = 1 << 32;

fn samples() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..2000, 1u64..1000), 1..40)
}

// Property: transitions alternate and match the rate at the time of the flip
proptest! {
    #[test]
    fn prop_transitions_alternate(limit in 0u8..=100, samples in samples()) {
        let mut detector = CriticalDetector::new();
        detector.set(Resource::Storage, "1", limit, None, false);

        let mut previous: Option<bool> = None;
        for (current, max) in samples {
            if let Some(transition) = detector.evaluate(Resource::Storage, "1", current, max) {
                let rate = current * 100 / max;
                prop_assert_eq!(transition.critical, rate >= u64::from(limit));
                prop_assert_eq!(transition.rate, rate);
                prop_assert_ne!(Some(transition.critical), previous);
                previous = Some(transition.critical);
            }
        }
    }
}

// Property: the number of transitions equals the number of state flips
proptest! {
    #[test]
    fn prop_transition_count_matches_flips(limit in 1u8..=100, samples in samples()) {
        let mut detector = CriticalDetector::new();
        detector.set(Resource::Memory, "1", limit, None, false);

        let states: Vec<bool> = samples
            .iter()
            .map(|(current, max)| current * 100 / max >= u64::from(limit))
            .collect();
        let expected = states.windows(2).filter(|pair| pair[0] != pair[1]).count();

        let emitted = samples
            .iter()
            .filter_map(|(current, max)| detector.evaluate(Resource::Memory, "1", *current, *max))
            .count();

        prop_assert_eq!(emitted, expected);
    }
}

// Property: the first sample only initializes the state
proptest! {
    #[test]
    fn prop_first_sample_never_emits(limit in 0u8..=100, current in 0u64..2000, max in 1u64..1000) {
        let mut detector = CriticalDetector::new();
        detector.set(Resource::Processor, "0", limit, None, false);

        prop_assert_eq!(detector.evaluate(Resource::Processor, "0", current, max), None);
        // a CPU inheriting the "0" threshold starts fresh as well
        prop_assert_eq!(detector.evaluate(Resource::Processor, "7", current, max), None);
    }
}

// Property: a decreasing 32-bit counter wraps once, a 64-bit one resets
proptest! {
    #[test]
    fn prop_counter_delta(previous in 0u64..COUNTER32, current in 0u64..COUNTER32) {
        let narrow = counter_delta(current, previous, false).unwrap();
        prop_assert!(narrow < COUNTER32);
        prop_assert_eq!((previous + narrow) % COUNTER32, current);

        let wide = counter_delta(current, previous, true);
        if current >= previous {
            prop_assert_eq!(wide, Some(current - previous));
        } else {
            prop_assert_eq!(wide, None);
        }
    }
}

// Property: rates need a positive duration and grow with the byte count
proptest! {
    #[test]
    fn prop_bits_per_second(bytes in 0u64..1_000_000_000, extra in 0u64..1_000_000, duration in -1000i64..100_000) {
        let rate = bits_per_second(bytes, duration);
        if duration <= 0 {
            prop_assert_eq!(rate, None);
        } else {
            let rate = rate.unwrap();
            prop_assert!(rate <= bits_per_second(bytes + extra, duration).unwrap());
            prop_assert_eq!(rate, bytes * 8000 / duration as u64);
        }
    }
}

// Property: rankings are ordered, capped and purged with their device
proptest! {
    #[test]
    fn prop_top_ordered_and_purged(
        values in prop::collection::vec((0i64..1000, 0i64..100), 1..30),
        capacity in 1usize..10,
    ) {
        let top = TopTable::new(capacity);
        for (n, (value, rate)) in values.iter().enumerate() {
            let device = format!("10.0.0.{n}");
            top.admit(&device);
            top.submit(TopCategory::Processor, &device, TopValue::new(*value, *rate, None));
        }

        let ranked = top.top(TopCategory::Processor, usize::MAX);
        prop_assert_eq!(ranked.len(), values.len().min(capacity));
        for pair in ranked.windows(2) {
            prop_assert!((pair[0].value, pair[0].rate) >= (pair[1].value, pair[1].rate));
        }

        let best = ranked[0].device.clone();
        top.remove(&best);
        prop_assert!(top.get_top(usize::MAX).values().flatten().all(|entry| entry.device != best));
        prop_assert!(!top.submit(TopCategory::Processor, &best, TopValue::new(1, 1, None)));
    }
}

// Property: the failure rate covers exactly the trailing window
proptest! {
    #[test]
    fn prop_failure_rate_window(
        attempts in prop::collection::vec(any::<bool>(), 0..200),
        capacity in 1usize..50,
    ) {
        let mut window = FailureWindow::new(capacity);
        for success in &attempts {
            window.record(*success);
        }

        let recent = &attempts[attempts.len().saturating_sub(capacity)..];
        let expected = if recent.is_empty() {
            0
        } else {
            (recent.iter().filter(|success| !**success).count() * 100 / recent.len()) as u32
        };
        prop_assert_eq!(window.rate(), expected);
        prop_assert!(window.rate() <= 100);
    }
}
