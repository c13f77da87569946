use super::{DbError, Result, Value};
use std::fmt;

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Checks `value` against the column and returns it in stored form.
    ///
    /// Integers widen into FLOAT columns; everything else must match exactly.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        match (self.data_type, value) {
            (_, Value::Null) if self.nullable => Ok(Value::Null),
            (_, Value::Null) => Err(DbError::NotNullViolation(self.name.clone())),
            (DataType::Integer, v @ Value::Integer(_))
            | (DataType::Float, v @ Value::Float(_))
            | (DataType::Text, v @ Value::Text(_))
            | (DataType::Boolean, v @ Value::Boolean(_))
            | (DataType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (DataType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (expected, other) => Err(DbError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                expected,
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|col| col.name.clone()).collect()
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_widens_integer_into_float() {
        let col = Column::new("duration_ms", DataType::Float);
        assert_eq!(col.coerce(Value::Integer(7)).unwrap(), Value::Float(7.0));
    }

    #[test]
    fn test_coerce_rejects_null_in_not_null_column() {
        let col = Column::new("remote", DataType::Text).not_null();
        assert_eq!(
            col.coerce(Value::Null),
            Err(DbError::NotNullViolation("remote".into()))
        );
    }

    #[test]
    fn test_coerce_rejects_wrong_type() {
        let col = Column::new("line_number", DataType::Integer);
        assert!(matches!(
            col.coerce(Value::Text("12".into())),
            Err(DbError::TypeMismatch(_))
        ));
    }
}
