//! Device value types and decoded notification payloads.

use bytes::Bytes;

/// Largest string capacity (in characters) a device string variable can declare.
pub const MAX_STRING_CAPACITY: usize = 255;

/// The type vocabulary shared with the transport.
///
/// Every type a transport can decode is listed here. The core accepts a subset
/// (see `plcrx::value::validate`); the 64-bit integers are transport-only.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ValueType {
    /// BOOL
    Bool,
    /// SINT
    SInt,
    /// USINT / BYTE
    USInt,
    /// INT
    Int,
    /// UINT / WORD
    UInt,
    /// DINT
    DInt,
    /// UDINT / DWORD
    UDInt,
    /// REAL
    Real,
    /// LREAL
    LReal,
    /// STRING(capacity)
    String {
        /// Declared character capacity, excluding the terminator
        capacity: usize,
    },
    /// A fixed-layout composite; the transport marshals the raw bytes
    Struct {
        /// Size in bytes
        size: usize,
    },
    /// LINT
    LInt,
    /// ULINT / LWORD
    ULInt,
}

impl ValueType {
    /// IEC 61131-3 name of the type.
    pub fn iec_name(&self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::SInt => "SINT",
            ValueType::USInt => "USINT",
            ValueType::Int => "INT",
            ValueType::UInt => "UINT",
            ValueType::DInt => "DINT",
            ValueType::UDInt => "UDINT",
            ValueType::Real => "REAL",
            ValueType::LReal => "LREAL",
            ValueType::String { .. } => "STRING",
            ValueType::Struct { .. } => "STRUCT",
            ValueType::LInt => "LINT",
            ValueType::ULInt => "ULINT",
        }
    }

    /// Size of the value on the wire, in bytes.
    ///
    /// Strings include the trailing NUL.
    pub fn byte_size(&self) -> usize {
        match self {
            ValueType::Bool | ValueType::SInt | ValueType::USInt => 1,
            ValueType::Int | ValueType::UInt => 2,
            ValueType::DInt | ValueType::UDInt | ValueType::Real => 4,
            ValueType::LReal | ValueType::LInt | ValueType::ULInt => 8,
            ValueType::String { capacity } => capacity + 1,
            ValueType::Struct { size } => *size,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::String { capacity } => write!(f, "STRING({})", capacity),
            ValueType::Struct { size } => write!(f, "STRUCT[{} bytes]", size),
            other => f.write_str(other.iec_name()),
        }
    }
}

/// A value decoded by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    SInt(i8),
    USInt(u8),
    Int(i16),
    UInt(u16),
    DInt(i32),
    UDInt(u32),
    Real(f32),
    LReal(f64),
    String(String),
    /// Raw bytes of a fixed-layout composite
    Struct(Bytes),
    LInt(i64),
    ULInt(u64),
}

impl Value {
    /// IEC name of the variant, for error messages.
    pub fn iec_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::SInt(_) => "SINT",
            Value::USInt(_) => "USINT",
            Value::Int(_) => "INT",
            Value::UInt(_) => "UINT",
            Value::DInt(_) => "DINT",
            Value::UDInt(_) => "UDINT",
            Value::Real(_) => "REAL",
            Value::LReal(_) => "LREAL",
            Value::String(_) => "STRING",
            Value::Struct(_) => "STRUCT",
            Value::LInt(_) => "LINT",
            Value::ULInt(_) => "ULINT",
        }
    }

    /// Whether this value can be stored in a variable of `value_type`.
    pub fn fits(&self, value_type: &ValueType) -> bool {
        match (self, value_type) {
            (Value::String(s), ValueType::String { capacity }) => s.chars().count() <= *capacity,
            (Value::Struct(bytes), ValueType::Struct { size }) => bytes.len() == *size,
            (Value::Bool(_), ValueType::Bool)
            | (Value::SInt(_), ValueType::SInt)
            | (Value::USInt(_), ValueType::USInt)
            | (Value::Int(_), ValueType::Int)
            | (Value::UInt(_), ValueType::UInt)
            | (Value::DInt(_), ValueType::DInt)
            | (Value::UDInt(_), ValueType::UDInt)
            | (Value::Real(_), ValueType::Real)
            | (Value::LReal(_), ValueType::LReal)
            | (Value::LInt(_), ValueType::LInt)
            | (Value::ULInt(_), ValueType::ULInt) => true,
            _ => false,
        }
    }
}
