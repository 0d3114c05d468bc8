//! BSON type names accepted by `$type`
//!
//! Documents are stored as JSON, so only the BSON types with a JSON
//! representation are accepted.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BsonType {
    Double,
    String,
    Object,
    Array,
    Bool,
    Null,
    Int,
    Long,
    Decimal,
    /// `"number"` alias: any numeric type
    Number,
}

impl BsonType {
    /// Resolve a string alias (`"string"`, `"int"`, ...)
    pub fn from_alias(alias: &str) -> Option<Self> {
        Some(match alias {
            "double" => BsonType::Double,
            "string" => BsonType::String,
            "object" => BsonType::Object,
            "array" => BsonType::Array,
            "bool" => BsonType::Bool,
            "null" => BsonType::Null,
            "int" => BsonType::Int,
            "long" => BsonType::Long,
            "decimal" => BsonType::Decimal,
            "number" => BsonType::Number,
            _ => return None,
        })
    }

    /// Resolve a numeric BSON type code
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => BsonType::Double,
            2 => BsonType::String,
            3 => BsonType::Object,
            4 => BsonType::Array,
            8 => BsonType::Bool,
            10 => BsonType::Null,
            16 => BsonType::Int,
            18 => BsonType::Long,
            19 => BsonType::Decimal,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            BsonType::Double | BsonType::Int | BsonType::Long | BsonType::Decimal | BsonType::Number
        )
    }
}
