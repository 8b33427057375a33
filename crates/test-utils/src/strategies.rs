//! Proptest strategies for store keys, records and operations.
//!
//! # Usage
//!
//! ```no_run
//! use sealdb_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_operation_sequence()) {
//!         // apply ops to a store and a model, compare
//!     }
//! }
//! ```

use proptest::prelude::*;
use sealdb_store::{Record, Value};

/// Generates an arbitrary key of 1-24 bytes drawn from a small alphabet, so
/// sequences revisit keys often.
pub fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(prop::sample::select(b"abcdefgh".to_vec()), 1..24)
}

/// Generates an arbitrary blob of 0-255 random bytes.
pub fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

/// Generates an arbitrary [`Value`] of any type. Floats are finite so
/// records compare equal after a round trip.
pub fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,64}".prop_map(Value::Text),
        arb_bytes().prop_map(Value::Blob),
    ]
}

/// Generates an arbitrary [`Record`] of 0-8 values.
pub fn arb_record() -> impl Strategy<Value = Record> {
    proptest::collection::vec(arb_value(), 0..8).prop_map(Record::new)
}

/// Generates a record holding one blob large enough to spill into
/// overflow pages.
pub fn arb_large_record() -> impl Strategy<Value = Record> {
    proptest::collection::vec(any::<u8>(), 600..6000).prop_map(|blob| Record::new(vec![Value::Blob(blob)]))
}

/// One step applied to a store and to a model map.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert or replace.
    Put(Vec<u8>, Record),
    /// Remove if present.
    Delete(Vec<u8>),
    /// Commit the current transaction and begin a new one.
    Commit,
    /// Roll back the current transaction and begin a new one.
    Rollback,
}

/// Generates an arbitrary [`Operation`], weighted towards writes.
pub fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        6 => (arb_key(), arb_record()).prop_map(|(key, record)| Operation::Put(key, record)),
        1 => (arb_key(), arb_large_record()).prop_map(|(key, record)| Operation::Put(key, record)),
        3 => arb_key().prop_map(Operation::Delete),
        1 => Just(Operation::Commit),
        1 => Just(Operation::Rollback),
    ]
}

/// Generates a vector of 1-200 arbitrary operations.
pub fn arb_operation_sequence() -> impl Strategy<Value = Vec<Operation>> {
    proptest::collection::vec(arb_operation(), 1..200)
}
