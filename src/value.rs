//! Typed values carried over the wire, bound to parameters, and hashed for
//! partition routing.

use std::cmp::Ordering;
use std::fmt;

use uuid::Uuid;

/// Wire type ids. Stable; written as a single int ahead of each value.
pub mod type_ids {
    pub const NULL: i32 = 0;
    pub const BOOLEAN: i32 = 1;
    pub const INT: i32 = 2;
    pub const LONG: i32 = 3;
    pub const DOUBLE: i32 = 4;
    pub const TEXT: i32 = 5;
    pub const BYTES: i32 = 6;
    pub const UUID: i32 = 7;
    /// Placeholder for parameters whose type is not yet known.
    pub const UNKNOWN: i32 = -1;
}

/// A single SQL value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
}

impl Value {
    pub fn type_id(&self) -> i32 {
        match self {
            Value::Null => type_ids::NULL,
            Value::Boolean(_) => type_ids::BOOLEAN,
            Value::Int(_) => type_ids::INT,
            Value::Long(_) => type_ids::LONG,
            Value::Double(_) => type_ids::DOUBLE,
            Value::Text(_) => type_ids::TEXT,
            Value::Bytes(_) => type_ids::BYTES,
            Value::Uuid(_) => type_ids::UUID,
        }
    }

    /// Freshly generated random UUID value, used when a routed row has no
    /// partition key.
    pub fn new_random_uuid() -> Value {
        Value::Uuid(Uuid::new_v4())
    }

    /// Stable byte form fed to the partitioner.
    pub fn bytes_for_hash(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Boolean(b) => vec![u8::from(*b)],
            Value::Int(i) => i.to_be_bytes().to_vec(),
            Value::Long(l) => l.to_be_bytes().to_vec(),
            Value::Double(d) => d.to_be_bytes().to_vec(),
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Uuid(u) => u.as_bytes().to_vec(),
        }
    }

    /// Reported precision when this value backs a bound parameter.
    pub fn precision(&self) -> i64 {
        match self {
            Value::Text(s) => s.len() as i64,
            Value::Bytes(b) => b.len() as i64,
            _ => 0,
        }
    }

    /// Reported scale when this value backs a bound parameter.
    pub fn scale(&self) -> i32 {
        0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "X'{}'", b.iter().fold(String::new(), |mut s, b| {
                s.push_str(&format!("{b:02x}"));
                s
            })),
            Value::Uuid(u) => write!(f, "'{u}'"),
        }
    }
}

/// Total order over values used by sorted merges. Nulls sort first, numeric
/// kinds compare by magnitude, everything else within its own kind; mixed
/// kinds fall back to type-id order.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (Text(x), Text(y)) => x.cmp(y),
        (Bytes(x), Bytes(y)) => x.cmp(y),
        (Uuid(x), Uuid(y)) => x.cmp(y),
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.type_id().cmp(&b.type_id()),
        },
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Long(l) => Some(*l as f64),
        Value::Double(d) => Some(*d),
        _ => None,
    }
}
