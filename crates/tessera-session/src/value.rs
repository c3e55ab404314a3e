//! Typed session values and the codec that turns them into storable bytes.
//!
//! Session state is an untyped bag keyed by string, but every value carries
//! its variant tag so reads can be checked against the requested type.
//! Scalars map onto [`Value`] variants directly; application structs opt in
//! through [`StructuredValue`] and must be registered with the
//! [`ValueCodec`] a provider uses before they can be stored or read back.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single typed session value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// A user-registered struct, stored as JSON under its type name.
    Structured {
        type_name: String,
        data: serde_json::Value,
    },
}

impl Value {
    /// Encode a registered struct as a [`Value::Structured`].
    pub fn structured<T: StructuredValue>(value: &T) -> Result<Self> {
        Ok(Value::Structured {
            type_name: T::TYPE_NAME.to_string(),
            data: serde_json::to_value(value)?,
        })
    }

    /// Whether the value survives an encode/decode round trip.
    ///
    /// NaN and the infinities have no JSON form and would be written as
    /// `null`, leaving the whole session map undecodable.
    pub fn ensure_storable(&self) -> Result<()> {
        match self {
            Value::Float(v) if !v.is_finite() => Err(Error::NonFiniteFloat(*v)),
            _ => Ok(()),
        }
    }

    /// Name of the variant, or the registered type name for structs.
    pub fn kind(&self) -> &str {
        match self {
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Timestamp(_) => "timestamp",
            Value::Structured { type_name, .. } => type_name,
        }
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// Conversion between a Rust type and a [`Value`].
///
/// `from_value` fails with [`Error::TypeMismatch`] when the stored variant
/// does not match `Self`.
pub trait SessionValue: Sized {
    /// Name used in mismatch errors.
    fn type_name() -> &'static str;

    fn into_value(self) -> Result<Value>;

    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! scalar_session_value {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl SessionValue for $ty {
            fn type_name() -> &'static str {
                $name
            }

            fn into_value(self) -> Result<Value> {
                Ok(Value::$variant(self))
            }

            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(Error::mismatch($name, other.kind())),
                }
            }
        }
    };
}

scalar_session_value!(String, String, "string");
scalar_session_value!(i64, Int, "int");
scalar_session_value!(f64, Float, "float");
scalar_session_value!(bool, Bool, "bool");
scalar_session_value!(DateTime<Utc>, Timestamp, "timestamp");

impl SessionValue for Value {
    fn type_name() -> &'static str {
        "value"
    }

    fn into_value(self) -> Result<Value> {
        Ok(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

/// An application struct that can be stored in a session.
///
/// `TYPE_NAME` is the stable identifier written next to the data; changing
/// it orphans values already stored under the old name.
pub trait StructuredValue: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}

/// Carrier for [`StructuredValue`] types through the typed session API.
///
/// ```rust,ignore
/// session.set_as("cart", Structured(cart))?;
/// let Structured(cart) = session.get::<Structured<Cart>>("cart")?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Structured<T>(pub T);

impl<T: StructuredValue> SessionValue for Structured<T> {
    fn type_name() -> &'static str {
        T::TYPE_NAME
    }

    fn into_value(self) -> Result<Value> {
        Value::structured(&self.0)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Structured { type_name, data } if type_name == T::TYPE_NAME => {
                serde_json::from_value(data)
                    .map(Structured)
                    .map_err(|_| Error::mismatch(T::TYPE_NAME, type_name))
            }
            other => Err(Error::mismatch(T::TYPE_NAME, other.kind())),
        }
    }
}

/// Serializes values to the byte form stored by providers.
///
/// Also the registry of structured types: a struct whose `TYPE_NAME` has
/// not been registered is rejected on both encode and decode.
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    registered: HashSet<String>,
}

impl ValueCodec {
    /// Create a codec that only knows the scalar types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a structured type.
    pub fn register<T: StructuredValue>(&mut self) {
        self.registered.insert(T::TYPE_NAME.to_string());
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_type<T: StructuredValue>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.registered.contains(type_name)
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        self.check(value)?;
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes)?;
        self.check(&value)?;
        Ok(value)
    }

    /// Decode straight into the requested type.
    pub fn decode_as<T: SessionValue>(&self, bytes: &[u8]) -> Result<T> {
        T::from_value(self.decode(bytes)?)
    }

    /// Encode a whole session map as one blob.
    pub fn encode_map(&self, values: &HashMap<String, Value>) -> Result<Vec<u8>> {
        for value in values.values() {
            self.check(value)?;
        }
        Ok(serde_json::to_vec(values)?)
    }

    /// Decode a session map. An empty blob is an empty session.
    pub fn decode_map(&self, bytes: &[u8]) -> Result<HashMap<String, Value>> {
        if bytes.is_empty() {
            return Ok(HashMap::new());
        }
        let values: HashMap<String, Value> = serde_json::from_slice(bytes)?;
        for value in values.values() {
            self.check(value)?;
        }
        Ok(values)
    }

    fn check(&self, value: &Value) -> Result<()> {
        value.ensure_storable()?;
        match value {
            Value::Structured { type_name, .. } if !self.is_registered(type_name) => Err(
                Error::mismatch("registered structured type", type_name.as_str()),
            ),
            _ => Ok(()),
        }
    }
}
