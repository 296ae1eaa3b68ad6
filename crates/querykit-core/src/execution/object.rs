//! Materialized query results.

use std::fmt;
use std::sync::Arc;

use querykit_proto::Value;

use crate::error::{Error, Result};
use crate::expr::Bindings;

use super::plan::QueryPlan;

/// A value built by a projector.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Value(Value),
    Record(Record),
    List(Vec<Object>),
    Grouping(Grouping),
    /// Relationship loaded on first access through the provider.
    Deferred(Deferred),
}

impl Object {
    pub fn null() -> Self {
        Object::Value(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Object::Value(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Object::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Object::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Object]> {
        match self {
            Object::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convert into a typed value.
    pub fn into_typed<T: FromObject>(self) -> Result<T> {
        T::from_object(self)
    }

    fn kind(&self) -> &'static str {
        match self {
            Object::Value(_) => "value",
            Object::Record(_) => "record",
            Object::List(_) => "list",
            Object::Grouping(_) => "grouping",
            Object::Deferred(_) => "deferred",
        }
    }
}

impl From<Value> for Object {
    fn from(value: Value) -> Self {
        Object::Value(value)
    }
}

impl From<Record> for Object {
    fn from(record: Record) -> Self {
        Object::Record(record)
    }
}

/// An entity instance or anonymous record, fields in projector order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entity: Option<String>,
    fields: Vec<(String, Object)>,
}

impl Record {
    /// Create an empty instance of a mapped entity.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            fields: Vec::new(),
        }
    }

    /// Create an empty anonymous record.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub(crate) fn from_fields(entity: Option<String>, fields: Vec<(String, Object)>) -> Self {
        Self { entity, fields }
    }

    /// Set a field, returning the updated record.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, Object::Value(value.into()));
        self
    }

    /// Set a field, replacing an existing one of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: Object) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// The mapped entity this record is an instance of.
    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Object)> {
        self.fields.iter().map(|(n, o)| (n.as_str(), o))
    }

    pub fn field(&self, name: &str) -> Option<&Object> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    /// Scalar value of a field; null when the field is absent.
    pub fn value(&self, name: &str) -> Value {
        match self.field(name) {
            Some(Object::Value(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    /// Typed value of a field.
    pub fn get<T: FromObject>(&self, name: &str) -> Result<T> {
        let object = self
            .field(name)
            .cloned()
            .ok_or_else(|| Error::Materialize(format!("record has no field '{}'", name)))?;
        T::from_object(object)
            .map_err(|e| Error::Materialize(format!("field '{}': {}", name, e)))
    }
}

/// A group key with the elements sharing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub key: Box<Object>,
    pub elements: Vec<Object>,
}

/// A captured relationship query, run by
/// [`EntityProvider::load`](crate::provider::EntityProvider::load).
#[derive(Clone)]
pub struct Deferred {
    pub(crate) plan: Arc<QueryPlan>,
    pub(crate) row: Vec<Value>,
    pub(crate) bindings: Bindings,
}

impl Deferred {
    pub(crate) fn new(plan: Arc<QueryPlan>, row: Vec<Value>, bindings: Bindings) -> Self {
        Self { plan, row, bindings }
    }

    /// The command the relationship is loaded with.
    pub fn command_text(&self) -> &str {
        &self.plan.command.text
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("command", &self.plan.command.text)
            .field("row", &self.row)
            .finish()
    }
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.plan, &other.plan) && self.row == other.row
    }
}

/// Conversion from a materialized [`Object`].
pub trait FromObject: Sized {
    fn from_object(object: Object) -> Result<Self>;
}

/// Conversion of an instance into the record written by insert, update and
/// delete commands.
pub trait ToRecord {
    fn to_record(&self) -> Record;
}

impl ToRecord for Record {
    fn to_record(&self) -> Record {
        self.clone()
    }
}

impl<T: ToRecord + ?Sized> ToRecord for &T {
    fn to_record(&self) -> Record {
        (**self).to_record()
    }
}

fn mismatch(expected: &str, object: &Object) -> Error {
    Error::Materialize(format!("expected {}, found {}", expected, object.kind()))
}

impl FromObject for Object {
    fn from_object(object: Object) -> Result<Self> {
        Ok(object)
    }
}

impl FromObject for Value {
    fn from_object(object: Object) -> Result<Self> {
        match object {
            Object::Value(v) => Ok(v),
            other => Err(mismatch("a scalar", &other)),
        }
    }
}

impl FromObject for Record {
    fn from_object(object: Object) -> Result<Self> {
        match object {
            Object::Record(r) => Ok(r),
            other => Err(mismatch("a record", &other)),
        }
    }
}

impl FromObject for Grouping {
    fn from_object(object: Object) -> Result<Self> {
        match object {
            Object::Grouping(g) => Ok(g),
            other => Err(mismatch("a grouping", &other)),
        }
    }
}

impl<T: FromObject> FromObject for Option<T> {
    fn from_object(object: Object) -> Result<Self> {
        if object.is_null() {
            return Ok(None);
        }
        T::from_object(object).map(Some)
    }
}

impl<T: FromObject> FromObject for Vec<T> {
    fn from_object(object: Object) -> Result<Self> {
        match object {
            Object::List(items) => items.into_iter().map(T::from_object).collect(),
            Object::Grouping(g) => g.elements.into_iter().map(T::from_object).collect(),
            other => Err(mismatch("a list", &other)),
        }
    }
}

macro_rules! scalar_from_object {
    ($ty:ty, $name:literal, $convert:expr) => {
        impl FromObject for $ty {
            fn from_object(object: Object) -> Result<Self> {
                let convert: fn(&Value) -> Option<$ty> = $convert;
                match &object {
                    Object::Value(v) => convert(v).ok_or_else(|| {
                        Error::Materialize(format!("expected {}, found {:?}", $name, v))
                    }),
                    other => Err(mismatch($name, other)),
                }
            }
        }
    };
}

scalar_from_object!(bool, "a boolean", |v| v.as_bool());
scalar_from_object!(i32, "a 32-bit integer", |v| v.as_i32());
scalar_from_object!(i64, "an integer", |v| v.as_i64());
scalar_from_object!(f64, "a number", |v| v.as_f64());
scalar_from_object!(String, "a string", |v| v.as_str().map(str::to_string));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fields() {
        let mut record = Record::new("Customer").with("CustomerID", "ALFKI").with("City", "Berlin");
        record.set("City", Object::Value("London".into()));
        assert_eq!(record.entity(), Some("Customer"));
        assert_eq!(record.value("City"), Value::from("London"));
        assert_eq!(record.value("Region"), Value::Null);
        assert_eq!(record.fields().count(), 2);
        assert_eq!(record.get::<String>("CustomerID").unwrap(), "ALFKI");
        assert!(record.get::<String>("Region").is_err());
        assert!(record.get::<i32>("City").is_err());
    }

    #[test]
    fn test_typed_conversions() {
        let list = Object::List(vec![Object::Value(Value::Int32(1)), Object::null()]);
        let values: Vec<Option<i32>> = list.into_typed().unwrap();
        assert_eq!(values, vec![Some(1), None]);

        assert_eq!(Object::Value(Value::Int32(7)).into_typed::<i64>().unwrap(), 7);
        assert!(Object::Value("x".into()).into_typed::<f64>().is_err());
        assert!(Object::List(Vec::new()).into_typed::<Record>().is_err());
    }
}
