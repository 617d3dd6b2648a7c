//! Property-based tests for fingerprint stability and sensitivity.
//!
//! These tests verify the behavioral contracts of the fingerprint engine:
//! - Determinism: Same parameters always produce the same fingerprint
//! - Order invariance: Argument insertion order doesn't affect the fingerprint
//! - Sensitivity: Different identity arguments produce different fingerprints
//! - Opacity: `_`-prefixed arguments never affect the fingerprint

use benchdb_store::{FINGERPRINT_HEX_LEN, Fingerprint, Parameters, Value, fingerprint};
use proptest::prelude::*;
use std::collections::BTreeMap;

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate function names
fn func_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}".prop_map(String::from)
}

/// Generate identity argument names (never opaque)
fn arg_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,10}".prop_map(String::from)
}

/// Generate leaf values of every JSON kind
fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        (-1.0e9f64..1.0e9).prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

/// Generate nested values
fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::from),
        ]
    })
}

/// Generate an argument list (possibly with repeated names, last one wins)
fn args_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec((arg_name_strategy(), value_strategy()), 0..6)
}

fn build(func: &str, args: &[(String, Value)]) -> Parameters {
    args.iter()
        .fold(Parameters::new(func), |p, (k, v)| p.arg(k.clone(), v.clone()))
}

// =============================================================================
// Property Tests: Determinism and order invariance
// =============================================================================

proptest! {
    /// Contract: Same parameters always produce the same fingerprint
    #[test]
    fn fingerprint_is_deterministic(func in func_strategy(), args in args_strategy()) {
        let params = build(&func, &args);
        let fp1 = params.fingerprint().expect("fingerprint should succeed");
        let fp2 = params.clone().fingerprint().expect("fingerprint should succeed twice");
        prop_assert_eq!(&fp1, &fp2);
        prop_assert_eq!(fp1.as_hex().len(), FINGERPRINT_HEX_LEN);
    }

    /// Contract: Insertion order of distinct arguments doesn't matter
    #[test]
    fn fingerprint_ignores_insertion_order(
        func in func_strategy(),
        args in prop::collection::btree_map(arg_name_strategy(), value_strategy(), 0..6),
    ) {
        let forward: Vec<_> = args.clone().into_iter().collect();
        let mut backward = forward.clone();
        backward.reverse();

        let fp1 = build(&func, &forward).fingerprint().expect("forward");
        let fp2 = build(&func, &backward).fingerprint().expect("backward");
        prop_assert_eq!(fp1, fp2, "argument order must not change the fingerprint");
    }

    /// Contract: The free function and the builder agree
    #[test]
    fn builder_matches_free_function(
        func in func_strategy(),
        args in prop::collection::btree_map(arg_name_strategy(), value_strategy(), 0..6),
    ) {
        let params = build(&func, &args.clone().into_iter().collect::<Vec<_>>());
        let direct = fingerprint(&func, &args).expect("direct");
        prop_assert_eq!(params.fingerprint().expect("builder"), direct);
    }

    /// Contract: Rendered fingerprints parse back to themselves
    #[test]
    fn fingerprint_hex_round_trips(func in func_strategy(), args in args_strategy()) {
        let fp = build(&func, &args).fingerprint().expect("fingerprint");
        let parsed: Fingerprint = fp.to_string().parse().expect("parse");
        prop_assert_eq!(parsed, fp);
    }
}

// =============================================================================
// Property Tests: Sensitivity
// =============================================================================

proptest! {
    /// Contract: Changing the function name changes the fingerprint
    #[test]
    fn different_func_produces_different_fingerprint(
        a in func_strategy(),
        b in func_strategy(),
        args in prop::collection::btree_map(arg_name_strategy(), value_strategy(), 0..4),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            fingerprint(&a, &args).expect("a"),
            fingerprint(&b, &args).expect("b")
        );
    }

    /// Contract: Changing one argument value changes the fingerprint
    #[test]
    fn different_value_produces_different_fingerprint(
        func in func_strategy(),
        base in prop::collection::btree_map(arg_name_strategy(), value_strategy(), 0..4),
        name in arg_name_strategy(),
        value in value_strategy(),
    ) {
        prop_assume!(base.get(&name) != Some(&value));
        let mut modified = base.clone();
        modified.insert(name, value);
        prop_assert_ne!(
            fingerprint(&func, &base).expect("base"),
            fingerprint(&func, &modified).expect("modified")
        );
    }

    /// Contract: Opaque arguments never influence identity
    #[test]
    fn opaque_arguments_are_ignored(
        func in func_strategy(),
        args in args_strategy(),
        opaque_name in "_[a-z0-9_]{0,10}",
        opaque_value in value_strategy(),
    ) {
        let plain = build(&func, &args);
        let with_opaque = plain.clone().arg(opaque_name, opaque_value);
        prop_assert_eq!(&plain, &with_opaque);
        prop_assert_eq!(
            plain.fingerprint().expect("plain"),
            with_opaque.fingerprint().expect("opaque")
        );
    }
}

#[test]
fn fingerprint_of_empty_arguments_is_stable() {
    let fp = fingerprint("f", &BTreeMap::new()).unwrap();
    assert_eq!(fp, Parameters::new("f").fingerprint().unwrap());
    assert_ne!(fp, Parameters::new("g").fingerprint().unwrap());
}
