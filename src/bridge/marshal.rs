//! Value marshalling across the host/script boundary.
//!
//! The boundary value model is `serde_json::Value`: null, boolean, number,
//! string, array, object. Values are tree-shaped, never cyclic at the
//! boundary. Typed conversion rides
//! on serde, so object fields map to host members by exact name, missing
//! fields take the host type's defaults (`#[serde(default)]`), extra
//! fields are ignored, and enumerations declare their numeric ordinal
//! mapping with `#[serde(try_from = "u64")]` or equivalent.
//!
//! One deliberate leniency applies to result position only: a script
//! `null` requested as a sequence marshals to an empty sequence, so
//! callers never null-check collection results. Argument position stays
//! faithful: `null` is delivered as null, including inside sequences.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{BridgeError, Result};

/// Convert a script value into the requested host type.
///
/// Shape mismatches produce [`BridgeError::Marshal`], which callers can
/// tell apart from script runtime errors.
pub fn from_script<T: DeserializeOwned>(value: Value) -> Result<T> {
    let was_null = value.is_null();
    match serde_json::from_value(value) {
        Ok(converted) => Ok(converted),
        // Null requested as a sequence becomes an empty sequence; for any
        // other requested shape the original mismatch stands.
        Err(original) if was_null => serde_json::from_value(Value::Array(Vec::new()))
            .map_err(|_| BridgeError::Marshal(original.to_string())),
        Err(e) => Err(BridgeError::Marshal(e.to_string())),
    }
}

/// Convert a host value into a script value.
///
/// Primitives map directly, sequences become arrays, structs become
/// objects with one field per serializable member, and `None`/null is
/// preserved as script null.
pub fn to_script<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BridgeError::Marshal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    #[serde(try_from = "u64")]
    enum Kind {
        A,
        B,
        C,
    }

    impl TryFrom<u64> for Kind {
        type Error = String;

        fn try_from(ordinal: u64) -> std::result::Result<Self, String> {
            match ordinal {
                0 => Ok(Kind::A),
                1 => Ok(Kind::B),
                2 => Ok(Kind::C),
                other => Err(format!("no Kind with ordinal {}", other)),
            }
        }
    }

    impl Default for Kind {
        fn default() -> Self {
            Kind::A
        }
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct Person {
        name: String,
        age: i32,
        parent: Option<Box<Person>>,
        kind: Kind,
    }

    #[test]
    fn test_scalar_round_trip() {
        let n: i64 = from_script(json!(3)).unwrap();
        assert_eq!(n, 3);

        let s: String = from_script(json!("hello")).unwrap();
        assert_eq!(s, "hello");

        let b: bool = from_script(json!(true)).unwrap();
        assert!(b);
    }

    #[test]
    fn test_null_as_sequence_is_empty() {
        let items: Vec<i64> = from_script(Value::Null).unwrap();
        assert!(items.is_empty());

        let strings: Vec<String> = from_script(Value::Null).unwrap();
        assert!(strings.is_empty());
    }

    #[test]
    fn test_null_as_option_is_none() {
        let value: Option<i64> = from_script(Value::Null).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_null_as_scalar_is_marshal_error() {
        let result: Result<i64> = from_script(Value::Null);
        assert!(matches!(result, Err(BridgeError::Marshal(_))));
    }

    #[test]
    fn test_shape_mismatch_is_marshal_error() {
        let result: Result<i64> = from_script(json!("not a number"));
        assert!(matches!(result, Err(BridgeError::Marshal(_))));
    }

    #[test]
    fn test_object_fields_map_by_name() {
        let person: Person = from_script(json!({
            "name": "Snows",
            "age": 32,
            "parent": { "name": "Snows Parent", "age": 60 },
            "kind": 2,
        }))
        .unwrap();

        assert_eq!(person.name, "Snows");
        assert_eq!(person.age, 32);
        let parent = person.parent.unwrap();
        assert_eq!(parent.name, "Snows Parent");
        assert_eq!(parent.age, 60);
        assert_eq!(person.kind, Kind::C);
    }

    #[test]
    fn test_missing_fields_take_defaults_extra_ignored() {
        let person: Person = from_script(json!({
            "name": "Snows",
            "unknown_field": 99,
        }))
        .unwrap();

        assert_eq!(person.name, "Snows");
        assert_eq!(person.age, 0);
        assert!(person.parent.is_none());
        assert_eq!(person.kind, Kind::A);
    }

    #[test]
    fn test_enum_out_of_range_ordinal_fails() {
        let result: Result<Kind> = from_script(json!(7));
        assert!(matches!(result, Err(BridgeError::Marshal(_))));
    }

    #[test]
    fn test_to_script_preserves_null_in_sequence() {
        let args = vec![Some("hello".to_string()), None, Some("world".to_string())];
        let value = to_script(&args).unwrap();
        assert_eq!(value, json!(["hello", null, "world"]));
    }

    #[test]
    fn test_to_script_null_argument_stays_null() {
        let arg: Option<String> = None;
        assert_eq!(to_script(&arg).unwrap(), Value::Null);
    }

    #[test]
    fn test_element_order_round_trips() {
        let value = json!(["a", null, "b"]);
        let back: Vec<Option<String>> = from_script(value).unwrap();
        assert_eq!(
            back,
            vec![Some("a".to_string()), None, Some("b".to_string())]
        );
    }
}
