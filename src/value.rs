//! Record field values.
//!
//! [`Value`] has one variant per supported field shape. The dynamic variant
//! carries a [`serde_json::Value`], which already models the full recursive
//! space the `a` tag needs (null, bool, int, float, string, array, map with
//! string keys).

use serde::{Serialize, Serializer};

/// A single field value inside a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Str(String),
    IntArray(Vec<i64>),
    UIntArray(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    /// Self-describing dynamic payload. `serde_json::Value::Null` is the
    /// explicit null marker and is also the tag's default.
    Dyn(serde_json::Value),
}

impl Value {
    /// Short shape name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_)         => "int",
            Value::UInt(_)        => "uint",
            Value::Float(_)       => "float",
            Value::Double(_)      => "double",
            Value::Str(_)         => "string",
            Value::IntArray(_)    => "int array",
            Value::UIntArray(_)   => "uint array",
            Value::FloatArray(_)  => "float array",
            Value::DoubleArray(_) => "double array",
            Value::StrArray(_)    => "string array",
            Value::Dyn(_)         => "dynamic",
        }
    }

    /// The key string(s) this value contributes when used as an index key.
    ///
    /// Scalars yield one key, array values yield one key per element
    /// (multi-valued indexing), and null or empty-string keys are dropped.
    /// A dynamic array expands element-wise; a dynamic map keys on its
    /// compact JSON form.
    pub fn index_keys(&self) -> Vec<String> {
        fn keep(s: String) -> Option<String> {
            if s.is_empty() { None } else { Some(s) }
        }
        match self {
            Value::Int(v)    => keep(v.to_string()).into_iter().collect(),
            Value::UInt(v)   => keep(v.to_string()).into_iter().collect(),
            Value::Float(v)  => keep(v.to_string()).into_iter().collect(),
            Value::Double(v) => keep(v.to_string()).into_iter().collect(),
            Value::Str(v)    => keep(v.clone()).into_iter().collect(),
            Value::IntArray(vs)    => vs.iter().map(|v| v.to_string()).collect(),
            Value::UIntArray(vs)   => vs.iter().map(|v| v.to_string()).collect(),
            Value::FloatArray(vs)  => vs.iter().map(|v| v.to_string()).collect(),
            Value::DoubleArray(vs) => vs.iter().map(|v| v.to_string()).collect(),
            Value::StrArray(vs)    => vs.iter().filter(|v| !v.is_empty()).cloned().collect(),
            Value::Dyn(v) => match v {
                serde_json::Value::Array(items) => {
                    items.iter().filter_map(json_key).collect()
                }
                other => json_key(other).into_iter().collect(),
            },
        }
    }
}

/// String form of one JSON value for index keying. Null and `""` yield
/// nothing; strings key on their raw contents, everything else on its
/// compact JSON form.
fn json_key(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Serializes as the natural JSON form of the value (no enum tagging), so
/// entries can be dumped as JSON lines for inspection.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(v)          => serializer.serialize_i64(*v),
            Value::UInt(v)         => serializer.serialize_u64(*v),
            Value::Float(v)        => serializer.serialize_f32(*v),
            Value::Double(v)       => serializer.serialize_f64(*v),
            Value::Str(v)          => serializer.serialize_str(v),
            Value::IntArray(vs)    => vs.serialize(serializer),
            Value::UIntArray(vs)   => vs.serialize(serializer),
            Value::FloatArray(vs)  => vs.serialize(serializer),
            Value::DoubleArray(vs) => vs.serialize(serializer),
            Value::StrArray(vs)    => vs.serialize(serializer),
            Value::Dyn(v)          => v.serialize(serializer),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::UInt(v) }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self { Value::Float(v) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Double(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self { Value::Dyn(v) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_index_keys() {
        assert_eq!(Value::Int(-3).index_keys(), vec!["-3"]);
        assert_eq!(Value::Str("abc".into()).index_keys(), vec!["abc"]);
        assert!(Value::Str(String::new()).index_keys().is_empty());
    }

    #[test]
    fn array_values_expand_to_multiple_keys() {
        assert_eq!(
            Value::UIntArray(vec![1, 2, 3]).index_keys(),
            vec!["1", "2", "3"]
        );
        assert_eq!(
            Value::StrArray(vec!["a".into(), String::new(), "b".into()]).index_keys(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn dynamic_null_yields_no_key() {
        assert!(Value::Dyn(serde_json::Value::Null).index_keys().is_empty());
        assert_eq!(
            Value::Dyn(json!(["x", null, 7])).index_keys(),
            vec!["x", "7"]
        );
    }

    #[test]
    fn serializes_as_plain_json() {
        let v = Value::IntArray(vec![1, 2]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1,2]");
        let d = Value::Dyn(json!({"k": true}));
        assert_eq!(serde_json::to_string(&d).unwrap(), r#"{"k":true}"#);
    }
}
