use proptest::prelude::*;
use radcore::speed::normalize;

proptest! {
    #[test]
    fn bare_integer_round_trips_as_kilobits(n in 0u64..10_000_000u64) {
        let once = normalize(&n.to_string()).unwrap();
        prop_assert_eq!(once, format!("{}k", n));
    }

    #[test]
    fn kilo_suffixed_never_gets_rescaled(n in 0u64..10_000_000u64) {
        // Regression target for the historical bug: re-normalizing an
        // already-kilobit value must never multiply it by 1000 again.
        let input = format!("{}k", n);
        let once = normalize(&input).unwrap();
        let twice = normalize(&once).unwrap();
        prop_assert_eq!(&once, &format!("{}k", n));
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn mega_suffixed_scales_by_exactly_1000(n in 0u64..10_000u64) {
        let input = format!("{}M", n);
        let normalized = normalize(&input).unwrap();
        prop_assert_eq!(normalized, format!("{}k", n * 1000));
    }

    #[test]
    fn normalize_is_involutive(n in 0u64..10_000_000u64) {
        for input in [n.to_string(), format!("{}k", n)] {
            let once = normalize(&input).unwrap();
            let twice = normalize(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
