//! Typed views over transport values
//!
//! [`PlcValue`] converts between Rust types and decoded transport [`Value`]s.
//! [`PlcType`] additionally knows which [`ValueType`] to request when
//! registering a notification, which is what lets `observe::<T>` work without
//! naming the device type.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use plcrx_transport::{Value, ValueType, MAX_STRING_CAPACITY};

use crate::config::ClientConfig;
use crate::error::{DecodeError, RxError};

/// A Rust type that can be built from, and turned into, a transport value
pub trait PlcValue: Clone + Send + Sync + 'static {
    /// Convert a decoded notification payload
    fn from_value(value: Value) -> Result<Self, DecodeError>;

    /// Convert for writing
    fn into_value(self) -> Value;
}

/// A [`PlcValue`] with a fixed device type
///
/// Implement this for your own fixed-layout structs, returning
/// `ValueType::Struct { size }` and decoding `Value::Struct` bytes.
pub trait PlcType: PlcValue {
    /// Device type to request when registering a notification
    fn value_type(config: &ClientConfig) -> ValueType;
}

impl PlcValue for Value {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        Ok(value)
    }

    fn into_value(self) -> Value {
        self
    }
}

macro_rules! impl_plc_scalar {
    ($ty:ty, $variant:ident) => {
        impl PlcValue for $ty {
            fn from_value(value: Value) -> Result<Self, DecodeError> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(DecodeError::UnexpectedVariant {
                        expected: ValueType::$variant.iec_name(),
                        actual: other.iec_name(),
                    }),
                }
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl PlcType for $ty {
            fn value_type(_config: &ClientConfig) -> ValueType {
                ValueType::$variant
            }
        }
    };
}

impl_plc_scalar!(bool, Bool);
impl_plc_scalar!(i8, SInt);
impl_plc_scalar!(u8, USInt);
impl_plc_scalar!(i16, Int);
impl_plc_scalar!(u16, UInt);
impl_plc_scalar!(i32, DInt);
impl_plc_scalar!(u32, UDInt);
impl_plc_scalar!(f32, Real);
impl_plc_scalar!(f64, LReal);

impl PlcValue for String {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(DecodeError::UnexpectedVariant {
                expected: "STRING",
                actual: other.iec_name(),
            }),
        }
    }

    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl PlcType for String {
    fn value_type(config: &ClientConfig) -> ValueType {
        ValueType::String {
            capacity: config.string_capacity,
        }
    }
}

/// Check that a value type is in the supported set
///
/// Runs before any registration; a failure never reaches the transport.
pub fn validate(value_type: &ValueType) -> Result<(), RxError> {
    let reason = match value_type {
        ValueType::LInt | ValueType::ULInt => Some("64-bit integers are transport-only"),
        ValueType::String { capacity } if *capacity == 0 => Some("string capacity must be non-zero"),
        ValueType::String { capacity } if *capacity > MAX_STRING_CAPACITY => {
            Some("string capacity exceeds the device maximum")
        }
        ValueType::Struct { size: 0 } => Some("structs must have a non-zero size"),
        _ => None,
    };

    match reason {
        Some(reason) => Err(RxError::UnsupportedType {
            value_type: *value_type,
            reason,
        }),
        None => Ok(()),
    }
}

/// Check that a value can be written
///
/// Rejects the transport-only integers, empty structs and strings longer than
/// `string_capacity` characters, before any write handle is created.
pub fn validate_value(value: &Value, string_capacity: usize) -> Result<(), RxError> {
    match value {
        Value::LInt(_) => validate(&ValueType::LInt),
        Value::ULInt(_) => validate(&ValueType::ULInt),
        Value::Struct(bytes) => validate(&ValueType::Struct { size: bytes.len() }),
        Value::String(s) => {
            let capacity = string_capacity.min(MAX_STRING_CAPACITY);
            if s.chars().count() > capacity {
                Err(RxError::UnsupportedType {
                    value_type: ValueType::String { capacity },
                    reason: "string is longer than the variable's capacity",
                })
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

fn four_bytes(value: Value) -> Result<u32, DecodeError> {
    match value {
        Value::Struct(bytes) => {
            let raw: [u8; 4] = bytes.as_ref().try_into().map_err(|_| DecodeError::Size {
                expected: 4,
                actual: bytes.len(),
            })?;
            Ok(u32::from_le_bytes(raw))
        }
        Value::UDInt(raw) => Ok(raw),
        other => Err(DecodeError::UnexpectedVariant {
            expected: "STRUCT",
            actual: other.iec_name(),
        }),
    }
}

/// IEC `TIME`: a duration stored as 32-bit milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PlcTime(Duration);

impl PlcTime {
    /// Wrap a duration; anything past `u32::MAX` milliseconds is clamped
    pub fn new(duration: Duration) -> Self {
        Self(duration.min(Duration::from_millis(u32::MAX as u64)))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl PlcValue for PlcTime {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        four_bytes(value).map(|ms| PlcTime(Duration::from_millis(ms as u64)))
    }

    fn into_value(self) -> Value {
        let ms = self.0.as_millis() as u32;
        Value::Struct(Bytes::copy_from_slice(&ms.to_le_bytes()))
    }
}

impl PlcType for PlcTime {
    fn value_type(_config: &ClientConfig) -> ValueType {
        ValueType::Struct { size: 4 }
    }
}

/// IEC `DATE` / `DT`: 32-bit seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlcDate(DateTime<Utc>);

impl PlcDate {
    /// Wrap a timestamp; times outside the 32-bit range are clamped
    pub fn new(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp().clamp(0, u32::MAX as i64);
        Self(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for PlcDate {
    fn default() -> Self {
        Self(DateTime::<Utc>::default())
    }
}

impl PlcValue for PlcDate {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let secs = four_bytes(value)?;
        DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .map(PlcDate)
            .ok_or_else(|| DecodeError::OutOfRange(format!("{} seconds", secs)))
    }

    fn into_value(self) -> Value {
        let secs = self.0.timestamp() as u32;
        Value::Struct(Bytes::copy_from_slice(&secs.to_le_bytes()))
    }
}

impl PlcType for PlcDate {
    fn value_type(_config: &ClientConfig) -> ValueType {
        ValueType::Struct { size: 4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ValueType::Bool)]
    #[case(ValueType::SInt)]
    #[case(ValueType::USInt)]
    #[case(ValueType::Int)]
    #[case(ValueType::UInt)]
    #[case(ValueType::DInt)]
    #[case(ValueType::UDInt)]
    #[case(ValueType::Real)]
    #[case(ValueType::LReal)]
    #[case(ValueType::String { capacity: 80 })]
    #[case(ValueType::Struct { size: 3 })]
    fn test_supported_types(#[case] value_type: ValueType) {
        assert!(validate(&value_type).is_ok());
    }

    #[rstest]
    #[case(ValueType::LInt)]
    #[case(ValueType::ULInt)]
    #[case(ValueType::String { capacity: 0 })]
    #[case(ValueType::String { capacity: MAX_STRING_CAPACITY + 1 })]
    #[case(ValueType::Struct { size: 0 })]
    fn test_unsupported_types(#[case] value_type: ValueType) {
        assert!(matches!(
            validate(&value_type),
            Err(RxError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_write_values_checked_like_registrations() {
        assert!(validate_value(&Value::Int(1), 80).is_ok());
        assert!(validate_value(&Value::String("x".repeat(80)), 80).is_ok());
        assert!(validate_value(&Value::String("x".repeat(81)), 80).is_err());
        assert!(validate_value(&Value::LInt(1), 80).is_err());
        assert!(validate_value(&Value::ULInt(1), 80).is_err());
        assert!(validate_value(&Value::Struct(Bytes::new()), 80).is_err());
        assert!(validate_value(&PlcTime::default().into_value(), 80).is_ok());
    }

    #[test]
    fn test_scalar_decode_mismatch() {
        let err = i16::from_value(Value::String("x".into())).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedVariant {
                expected: "INT",
                actual: "STRING"
            }
        );
        assert_eq!(i16::from_value(Value::Int(-3)), Ok(-3));
    }

    #[test]
    fn test_string_uses_configured_capacity() {
        let config = ClientConfig::new().with_string_capacity(255);
        assert_eq!(
            String::value_type(&config),
            ValueType::String { capacity: 255 }
        );
    }

    #[test]
    fn test_plc_time_decodes_milliseconds() {
        let value = Value::Struct(Bytes::from_static(&[0xE8, 0x03, 0x00, 0x00]));
        let time = PlcTime::from_value(value).unwrap();
        assert_eq!(time.as_duration(), Duration::from_secs(1));

        let err = PlcTime::from_value(Value::Struct(Bytes::from_static(&[1, 2]))).unwrap_err();
        assert_eq!(err, DecodeError::Size { expected: 4, actual: 2 });
    }

    #[test]
    fn test_plc_time_clamps() {
        let time = PlcTime::new(Duration::from_secs(u64::MAX / 2));
        assert_eq!(time.as_duration(), Duration::from_millis(u32::MAX as u64));
    }

    #[test]
    fn test_plc_date_decodes_seconds() {
        let date = PlcDate::from_value(Value::UDInt(86_400)).unwrap();
        assert_eq!(date.as_datetime().to_rfc3339(), "1970-01-02T00:00:00+00:00");
        assert_eq!(
            date.into_value(),
            Value::Struct(Bytes::copy_from_slice(&86_400u32.to_le_bytes()))
        );
    }
}
