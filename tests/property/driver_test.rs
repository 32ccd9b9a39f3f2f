// tests/property/driver_test.rs

//! Property-based tests for template materialization

use pgcluster::core::Driver;
use pgcluster::core::driver::quote_literal;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_quoted_literal_round_trips(value in ".{0,100}") {
        let quoted = quote_literal(&value);
        prop_assert!(quoted.starts_with('\'') && quoted.ends_with('\''));
        let inner = &quoted[1..quoted.len() - 1];
        // Every quote inside the literal is doubled.
        prop_assert!(!inner.replace("''", "").contains('\''));
        prop_assert_eq!(inner.replace("''", "'"), value);
    }

    #[test]
    fn test_arguments_are_always_quoted(args in prop::collection::vec(".{0,40}", 1..5)) {
        let mut driver = Driver::new();
        let template: Vec<String> = (1..=args.len()).map(|i| format!("${i}")).collect();
        driver.register("t", &template.join(","));

        let sql = driver.materialize("t", &args).unwrap();
        let expected: Vec<String> = args.iter().map(|a| quote_literal(a)).collect();
        prop_assert_eq!(sql, expected.join(","));
    }

    #[test]
    fn test_missing_argument_is_reported(supplied in 0usize..4, extra in 1usize..4) {
        let mut driver = Driver::new();
        let wanted = supplied + extra;
        driver.register("t", &format!("SELECT ${wanted}"));
        let args: Vec<String> = (0..supplied).map(|i| i.to_string()).collect();
        prop_assert!(driver.materialize("t", &args).is_err());
    }
}
