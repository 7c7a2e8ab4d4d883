//! Message envelopes exchanged between peers.
//!
//! An [`Envelope`] carries an identifier that selects the handler on the receiving side and an
//! ordered payload of [`Value`]s. The identifier is fixed at construction; the payload can grow
//! through [`Envelope::append`] and [`Envelope::insert_at`] and is read positionally through
//! [`Envelope::get`].
//!
//! # Example
//! ```rust
//! use courier::{Envelope, Value};
//!
//! let mut envelope = Envelope::new("READ_STRING", ["hello"]).unwrap();
//! envelope.append([42]);
//! assert_eq!(envelope.get(0).unwrap(), &Value::from("hello"));
//! assert_eq!(envelope.len(), 2);
//! ```
use std::{collections::BTreeMap, fmt};

use bincode::{Decode, Encode};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope id must not be empty or blank")]
    InvalidId,

    #[error("index {index} out of range for payload of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

macro_rules! int_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::Int(i64::from(value))
                }
            }
        )*
    };
}

int_value!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Tagged message container.
///
/// The `id` never changes after construction and is never blank. Each side of a connection
/// owns an independent copy: the receiver decodes a fresh envelope from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: String,
    values: Vec<Value>,
}

/// On-wire form of an [`Envelope`]; converted through [`TryFrom`] so decoding re-checks the id.
#[derive(Debug, Encode, Decode)]
pub(crate) struct WireEnvelope {
    id: String,
    values: Vec<Value>,
}

impl Envelope {
    /// Create an envelope with the given id and initial payload.
    pub fn new<I, V>(id: impl Into<String>, values: I) -> Result<Self, EnvelopeError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EnvelopeError::InvalidId);
        }

        Ok(Self {
            id,
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// Create an envelope with an empty payload.
    pub fn empty(id: impl Into<String>) -> Result<Self, EnvelopeError> {
        Self::new(id, Vec::<Value>::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Append values in iteration order. An empty iterator leaves the payload untouched.
    pub fn append<I, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.values.extend(values.into_iter().map(Into::into));
    }

    /// Insert a value at `index`, shifting every later value one position to the right.
    ///
    /// `index == len()` appends.
    pub fn insert_at(
        &mut self,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), EnvelopeError> {
        if index > self.values.len() {
            return Err(EnvelopeError::IndexOutOfRange {
                index,
                len: self.values.len(),
            });
        }
        self.values.insert(index, value.into());
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&Value, EnvelopeError> {
        self.values.get(index).ok_or(EnvelopeError::IndexOutOfRange {
            index,
            len: self.values.len(),
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, Value::List(self.values.clone()))
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(value: &Envelope) -> Self {
        Self {
            id: value.id.clone(),
            values: value.values.clone(),
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: WireEnvelope) -> Result<Self, Self::Error> {
        Envelope::new(value.id, value.values)
    }
}
