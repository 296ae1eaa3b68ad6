//! SQL column types and the mapping between runtime values and column types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::{Value, ValueKind};

/// Default length given to character and binary types declared without one.
pub const DEFAULT_VARIABLE_LENGTH: u32 = 80;

/// Default precision for DECIMAL, FLOAT and REAL declared without one.
pub const DEFAULT_PRECISION: u16 = 29;

/// Length used for `max` and for unbounded string/binary column types.
pub const MAX_LENGTH: u32 = i32::MAX as u32;

/// SQL storage types understood by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    BigInt,
    Binary,
    Bit,
    Char,
    Date,
    DateTime,
    Decimal,
    Float,
    Int,
    NChar,
    NText,
    NVarChar,
    Real,
    SmallInt,
    Text,
    TinyInt,
    VarBinary,
    VarChar,
}

impl SqlType {
    /// Resolve a declared type name, accepting the SQLite affinity names.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        let upper = name.trim().to_ascii_uppercase();
        let ty = match upper.as_str() {
            "TEXT" | "CHAR" | "CLOB" | "VARYINGCHARACTER" | "NATIONALVARYINGCHARACTER" => {
                SqlType::VarChar
            }
            "INT" | "INTEGER" | "BIGINT" => SqlType::BigInt,
            "BLOB" | "BINARY" => SqlType::Binary,
            "BOOLEAN" | "BIT" => SqlType::Bit,
            "NUMERIC" | "DECIMAL" | "MONEY" => SqlType::Decimal,
            "DATE" => SqlType::Date,
            "DATETIME" | "SMALLDATETIME" | "DATETIME2" | "TIMESTAMP" => SqlType::DateTime,
            "FLOAT" | "DOUBLE" => SqlType::Float,
            "REAL" => SqlType::Real,
            "NCHAR" => SqlType::NChar,
            "NTEXT" => SqlType::NText,
            "NVARCHAR" => SqlType::NVarChar,
            "SMALLINT" => SqlType::SmallInt,
            "TINYINT" => SqlType::TinyInt,
            "VARBINARY" | "IMAGE" => SqlType::VarBinary,
            "VARCHAR" => SqlType::VarChar,
            _ => return Err(Error::InvalidType(name.to_string())),
        };
        Ok(ty)
    }

    /// Check if this is an integer, decimal or floating point type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::BigInt
                | SqlType::Decimal
                | SqlType::Float
                | SqlType::Int
                | SqlType::Real
                | SqlType::SmallInt
                | SqlType::TinyInt
        )
    }

    /// Check if this is a character type.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            SqlType::Char
                | SqlType::NChar
                | SqlType::NText
                | SqlType::NVarChar
                | SqlType::Text
                | SqlType::VarChar
        )
    }

    fn has_length(&self) -> bool {
        matches!(
            self,
            SqlType::Binary
                | SqlType::Char
                | SqlType::NChar
                | SqlType::NVarChar
                | SqlType::VarBinary
                | SqlType::VarChar
        )
    }

    fn name(&self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Binary => "BINARY",
            SqlType::Bit => "BIT",
            SqlType::Char => "CHAR",
            SqlType::Date => "DATE",
            SqlType::DateTime => "DATETIME",
            SqlType::Decimal => "DECIMAL",
            SqlType::Float => "FLOAT",
            SqlType::Int => "INT",
            SqlType::NChar => "NCHAR",
            SqlType::NText => "NTEXT",
            SqlType::NVarChar => "NVARCHAR",
            SqlType::Real => "REAL",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Text => "TEXT",
            SqlType::TinyInt => "TINYINT",
            SqlType::VarBinary => "VARBINARY",
            SqlType::VarChar => "VARCHAR",
        }
    }
}

/// A fully described column or parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbQueryType {
    pub sql_type: SqlType,
    pub not_null: bool,
    pub length: u32,
    pub precision: u16,
    pub scale: u16,
}

impl DbQueryType {
    /// Create a nullable type with no size information.
    pub fn new(sql_type: SqlType) -> Self {
        Self {
            sql_type,
            not_null: false,
            length: 0,
            precision: 0,
            scale: 0,
        }
    }

    /// Mark the type NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Set the declared length.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    /// Set precision and scale.
    pub fn with_precision(mut self, precision: u16, scale: u16) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Parse a declaration such as `NVARCHAR(40) NOT NULL` or `DECIMAL(10,2)`.
    pub fn parse(declaration: &str) -> Result<Self, Error> {
        let declaration = declaration.trim();
        let (type_name, args, remainder) = match declaration.find('(') {
            Some(open) => {
                let close = declaration[open..]
                    .find(')')
                    .map(|i| open + i)
                    .unwrap_or(declaration.len());
                let args: Vec<&str> = declaration[open + 1..close]
                    .split(',')
                    .map(str::trim)
                    .collect();
                let remainder = declaration.get(close + 1..).unwrap_or("");
                (&declaration[..open], Some(args), remainder)
            }
            None => match declaration.find(' ') {
                Some(space) => (&declaration[..space], None, &declaration[space + 1..]),
                None => (declaration, None, ""),
            },
        };
        let not_null = remainder.to_ascii_uppercase().contains("NOT NULL");
        let sql_type = SqlType::from_name(type_name)?;
        Self::from_parts(sql_type, args.as_deref(), not_null, declaration)
    }

    fn from_parts(
        sql_type: SqlType,
        args: Option<&[&str]>,
        not_null: bool,
        declaration: &str,
    ) -> Result<Self, Error> {
        let arg = |i: usize| args.and_then(|a| a.get(i).copied()).filter(|s| !s.is_empty());
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| Error::InvalidType(declaration.to_string()))
        };

        let mut ty = DbQueryType::new(sql_type);
        ty.not_null = not_null;
        if sql_type.has_length() {
            ty.length = match arg(0) {
                None => DEFAULT_VARIABLE_LENGTH,
                Some(a) if a.eq_ignore_ascii_case("max") => MAX_LENGTH,
                Some(a) => number(a)?,
            };
        }
        match sql_type {
            SqlType::Decimal => {
                ty.precision = arg(0).map(number).transpose()?.unwrap_or(DEFAULT_PRECISION as u32) as u16;
                ty.scale = arg(1).map(number).transpose()?.unwrap_or(0) as u16;
            }
            SqlType::Float | SqlType::Real => {
                ty.precision = arg(0).map(number).transpose()?.unwrap_or(DEFAULT_PRECISION as u32) as u16;
            }
            _ => {}
        }
        Ok(ty)
    }
}

impl fmt::Display for DbQueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_type.name())?;
        if self.sql_type.has_length() && self.length > 0 {
            if self.length == MAX_LENGTH {
                write!(f, "(MAX)")?;
            } else {
                write!(f, "({})", self.length)?;
            }
        } else if self.sql_type == SqlType::Decimal && self.precision > 0 {
            write!(f, "({},{})", self.precision, self.scale)?;
        }
        if self.not_null {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// Maps runtime values onto column types and renders storage declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbTypeSystem;

impl DbTypeSystem {
    /// The column type a runtime value of the given kind is stored as.
    pub fn column_type(&self, kind: ValueKind) -> DbQueryType {
        match kind {
            ValueKind::Bool => DbQueryType::new(SqlType::Bit).not_null(),
            ValueKind::Int32 => DbQueryType::new(SqlType::Int).not_null(),
            ValueKind::Int64 => DbQueryType::new(SqlType::BigInt).not_null(),
            ValueKind::Float64 => DbQueryType::new(SqlType::Float).not_null(),
            ValueKind::String => DbQueryType::new(SqlType::NVarChar).with_length(MAX_LENGTH),
            ValueKind::Bytes => DbQueryType::new(SqlType::VarBinary).with_length(MAX_LENGTH),
            ValueKind::Null => DbQueryType::new(SqlType::NVarChar).with_length(MAX_LENGTH),
        }
    }

    /// Render the storage declaration used in DDL and casts.
    pub fn declaration(&self, ty: &DbQueryType, suppress_size: bool) -> String {
        let (name, size) = match ty.sql_type {
            SqlType::BigInt | SqlType::SmallInt | SqlType::Int | SqlType::TinyInt => {
                ("INTEGER", None)
            }
            SqlType::Bit => ("BOOLEAN", None),
            SqlType::Date => ("DATE", None),
            SqlType::DateTime => ("DATETIME", None),
            SqlType::Char | SqlType::NChar => ("CHAR", Some(ty.length)),
            SqlType::Binary => ("BLOB", Some(ty.length)),
            SqlType::NText
            | SqlType::NVarChar
            | SqlType::Text
            | SqlType::VarBinary
            | SqlType::VarChar => ("TEXT", Some(ty.length)),
            SqlType::Decimal => ("NUMERIC", Some(ty.precision as u32)),
            SqlType::Float | SqlType::Real => ("FLOAT", Some(ty.precision as u32)),
        };
        match size {
            Some(n) if n > 0 && n != MAX_LENGTH && !suppress_size => format!("{}({})", name, n),
            _ => name.to_string(),
        }
    }

    /// Coerce a value read from (or bound to) the store into the declared type.
    pub fn convert(&self, value: Value, ty: &DbQueryType) -> Result<Value, Error> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |v: &Value| Error::Conversion {
            value: v.to_string(),
            target: ty.sql_type,
        };
        let converted = match ty.sql_type {
            SqlType::Bit => match &value {
                Value::Bool(_) => value,
                Value::Int32(i) => Value::Bool(*i != 0),
                Value::Int64(i) => Value::Bool(*i != 0),
                _ => return Err(mismatch(&value)),
            },
            SqlType::Int | SqlType::SmallInt | SqlType::TinyInt => match value.as_i64() {
                Some(i) => Value::Int32(i32::try_from(i).map_err(|_| mismatch(&value))?),
                None => match &value {
                    Value::Bool(b) => Value::Int32(*b as i32),
                    _ => return Err(mismatch(&value)),
                },
            },
            SqlType::BigInt => match value.as_i64() {
                Some(i) => Value::Int64(i),
                None => match &value {
                    Value::Bool(b) => Value::Int64(*b as i64),
                    _ => return Err(mismatch(&value)),
                },
            },
            SqlType::Decimal | SqlType::Float | SqlType::Real => match value.as_f64() {
                Some(f) => Value::Float64(f),
                None => return Err(mismatch(&value)),
            },
            SqlType::Binary | SqlType::VarBinary => match value {
                Value::Bytes(_) => value,
                Value::String(s) => Value::Bytes(s.into_bytes()),
                other => return Err(mismatch(&other)),
            },
            SqlType::Char
            | SqlType::NChar
            | SqlType::NText
            | SqlType::NVarChar
            | SqlType::Text
            | SqlType::VarChar
            | SqlType::Date
            | SqlType::DateTime => match value {
                Value::String(_) => value,
                Value::Bytes(b) => Value::String(
                    String::from_utf8(b).map_err(|e| Error::Conversion {
                        value: e.to_string(),
                        target: ty.sql_type,
                    })?,
                ),
                other => Value::String(other.to_string()),
            },
        };
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declarations() {
        let ty = DbQueryType::parse("NVARCHAR(40) NOT NULL").unwrap();
        assert_eq!(ty.sql_type, SqlType::NVarChar);
        assert_eq!(ty.length, 40);
        assert!(ty.not_null);

        let ty = DbQueryType::parse("Decimal(10, 2)").unwrap();
        assert_eq!(ty.sql_type, SqlType::Decimal);
        assert_eq!((ty.precision, ty.scale), (10, 2));
        assert!(!ty.not_null);

        let ty = DbQueryType::parse("VarChar(max)").unwrap();
        assert_eq!(ty.length, MAX_LENGTH);

        let ty = DbQueryType::parse("Int NOT NULL").unwrap();
        assert_eq!(ty.sql_type, SqlType::BigInt);
        assert!(ty.not_null);
    }

    #[test]
    fn test_parse_sqlite_affinities() {
        assert_eq!(SqlType::from_name("TEXT").unwrap(), SqlType::VarChar);
        assert_eq!(SqlType::from_name("clob").unwrap(), SqlType::VarChar);
        assert_eq!(SqlType::from_name("INTEGER").unwrap(), SqlType::BigInt);
        assert_eq!(SqlType::from_name("BLOB").unwrap(), SqlType::Binary);
        assert_eq!(SqlType::from_name("BOOLEAN").unwrap(), SqlType::Bit);
        assert_eq!(SqlType::from_name("NUMERIC").unwrap(), SqlType::Decimal);
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = DbQueryType::parse("GEOGRAPHY").unwrap_err();
        assert!(err.to_string().contains("GEOGRAPHY"));
    }

    #[test]
    fn test_defaults_applied() {
        let ty = DbQueryType::parse("VARCHAR").unwrap();
        assert_eq!(ty.length, DEFAULT_VARIABLE_LENGTH);

        let ty = DbQueryType::parse("DECIMAL").unwrap();
        assert_eq!((ty.precision, ty.scale), (DEFAULT_PRECISION, 0));
    }

    #[test]
    fn test_declarations() {
        let types = DbTypeSystem;
        let int = DbQueryType::new(SqlType::Int);
        assert_eq!(types.declaration(&int, false), "INTEGER");

        let name = DbQueryType::new(SqlType::NVarChar).with_length(40);
        assert_eq!(types.declaration(&name, false), "TEXT(40)");
        assert_eq!(types.declaration(&name, true), "TEXT");

        let money = DbQueryType::new(SqlType::Decimal).with_precision(19, 4);
        assert_eq!(types.declaration(&money, false), "NUMERIC(19)");

        let flag = DbQueryType::new(SqlType::Bit);
        assert_eq!(types.declaration(&flag, false), "BOOLEAN");
    }

    #[test]
    fn test_column_type_for_values() {
        let types = DbTypeSystem;
        assert_eq!(types.column_type(ValueKind::Bool).sql_type, SqlType::Bit);
        assert_eq!(types.column_type(ValueKind::Int32).sql_type, SqlType::Int);
        assert_eq!(types.column_type(ValueKind::Int64).sql_type, SqlType::BigInt);
        assert_eq!(types.column_type(ValueKind::Float64).sql_type, SqlType::Float);
        assert_eq!(types.column_type(ValueKind::String).sql_type, SqlType::NVarChar);
        assert!(!types.column_type(ValueKind::String).not_null);
    }

    #[test]
    fn test_convert_driver_values() {
        let types = DbTypeSystem;
        let int = DbQueryType::new(SqlType::Int);
        assert_eq!(types.convert(Value::Int64(7), &int).unwrap(), Value::Int32(7));

        let bit = DbQueryType::new(SqlType::Bit);
        assert_eq!(types.convert(Value::Int64(1), &bit).unwrap(), Value::Bool(true));

        let money = DbQueryType::new(SqlType::Decimal);
        assert_eq!(types.convert(Value::Int64(3), &money).unwrap(), Value::Float64(3.0));

        assert_eq!(types.convert(Value::Null, &int).unwrap(), Value::Null);
        assert!(types.convert(Value::String("x".into()), &int).is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let ty = DbQueryType::parse("NVARCHAR(15) NOT NULL").unwrap();
        assert_eq!(ty.to_string(), "NVARCHAR(15) NOT NULL");
        assert_eq!(DbQueryType::parse(&ty.to_string()).unwrap(), ty);
    }
}
