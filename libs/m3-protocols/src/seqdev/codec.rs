//! Value codec
//!
//! Converts raw response words into record values and record values into the
//! words a write carries.

use serde::{Deserialize, Serialize};
use tracing::warn;

use m3_comlink::{DeviceKind, M3Error, RawData, Result};

use super::types::ValueOption;

/// Value committed to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    Integer(i64),
    Bit(bool),
    Text(String),
}

impl RecordValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RecordValue::Integer(v) => Some(*v),
            RecordValue::Bit(b) => Some(i64::from(*b)),
            RecordValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for RecordValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordValue::Integer(v) => write!(f, "{}", v),
            RecordValue::Bit(b) => write!(f, "{}", u8::from(*b)),
            RecordValue::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Fail-soft data quality flag; raised as a high alarm of invalid severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alarm {
    /// A packed decimal nibble above 9 was clamped to 9
    InvalidBcd { raw: u16 },
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alarm::InvalidBcd { raw } => write!(f, "HIGH/INVALID: bad BCD digit in 0x{:04X}", raw),
        }
    }
}

/// Decoded value plus an optional alarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub value: RecordValue,
    pub alarm: Option<Alarm>,
}

impl Decoded {
    pub fn clean(value: RecordValue) -> Self {
        Self { value, alarm: None }
    }
}

// ============================================================================
// BCD
// ============================================================================

/// Decode four packed decimal digits, least significant nibble first.
///
/// Returns the value and whether any nibble was above 9; such a digit counts
/// as 9.
pub fn bcd_to_int(word: u16) -> (u32, bool) {
    let mut value = 0u32;
    let mut invalid = false;
    let mut scale = 1u32;
    let mut rest = word;
    for _ in 0..4 {
        let mut digit = u32::from(rest & 0x000F);
        if digit > 9 {
            digit = 9;
            invalid = true;
        }
        value += digit * scale;
        scale *= 10;
        rest >>= 4;
    }
    (value, invalid)
}

/// Encode 0..=9999 as four packed decimal digits
pub fn int_to_bcd(value: i64) -> Result<u16> {
    if !(0..=9999).contains(&value) {
        return Err(M3Error::invalid_data(format!(
            "BCD value {} out of range 0..=9999",
            value
        )));
    }
    let mut rest = value as u16;
    let mut word = 0u16;
    for shift in [0, 4, 8, 12] {
        word |= (rest % 10) << shift;
        rest /= 10;
    }
    Ok(word)
}

// ============================================================================
// Decode / Encode
// ============================================================================

/// Decode raw response data according to the record's option
pub fn decode(raw: &RawData, option: ValueOption, kind: DeviceKind) -> Result<Decoded> {
    let words = match raw {
        RawData::Long(value) if option == ValueOption::Long && kind.has_native_long() => {
            return Ok(Decoded::clean(RecordValue::Integer(
                i64::from(*value as i32),
            )));
        },
        RawData::Words(words) if !words.is_empty() => words,
        other => {
            return Err(M3Error::invalid_data(format!(
                "no {:?} data for {} in {:?}",
                option, kind, other
            )))
        },
    };

    let first = words[0];
    let decoded = match option {
        ValueOption::Word => Decoded::clean(RecordValue::Integer(i64::from(first as i16))),
        ValueOption::Unsigned => Decoded::clean(RecordValue::Integer(i64::from(first))),
        ValueOption::Long => {
            let high = *words.get(1).ok_or_else(|| {
                M3Error::invalid_data(format!("long value needs 2 words, got {}", words.len()))
            })?;
            let value = (u32::from(high) << 16) | u32::from(first);
            Decoded::clean(RecordValue::Integer(i64::from(value as i32)))
        },
        ValueOption::Bcd => {
            let (value, invalid) = bcd_to_int(first);
            let alarm = if invalid {
                warn!("Invalid BCD digit in 0x{:04X}, clamped to {}", first, value);
                Some(Alarm::InvalidBcd { raw: first })
            } else {
                None
            };
            Decoded {
                value: RecordValue::Integer(i64::from(value)),
                alarm,
            }
        },
    };
    Ok(decoded)
}

/// Encode a record value into the words a write carries
pub fn encode(value: i64, option: ValueOption) -> Result<Vec<u16>> {
    let out_of_range = || {
        M3Error::invalid_data(format!(
            "value {} out of range for option {:?}",
            value, option
        ))
    };

    let words = match option {
        ValueOption::Word => {
            let v = i16::try_from(value).map_err(|_| out_of_range())?;
            vec![v as u16]
        },
        ValueOption::Unsigned => {
            let v = u16::try_from(value).map_err(|_| out_of_range())?;
            vec![v]
        },
        ValueOption::Long => {
            let v = i32::try_from(value).map_err(|_| out_of_range())? as u32;
            vec![(v & 0xFFFF) as u16, (v >> 16) as u16]
        },
        ValueOption::Bcd => vec![int_to_bcd(value)?],
    };
    Ok(words)
}

/// Relay point writes take 0 or 1
pub fn encode_point(value: i64) -> Result<Vec<u16>> {
    match value {
        0 | 1 => Ok(vec![value as u16]),
        _ => Err(M3Error::invalid_data(format!(
            "relay point value {} is not 0 or 1",
            value
        ))),
    }
}

/// Register block to text: high byte first, stops at the first NUL
pub fn decode_string(raw: &RawData) -> Result<String> {
    let words = raw.words();
    if words.is_empty() {
        return Err(M3Error::invalid_data("empty string block"));
    }
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .take_while(|b| *b != 0)
        .collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn words(w: &[u16]) -> RawData {
        RawData::Words(w.to_vec())
    }

    fn int(decoded: Decoded) -> i64 {
        decoded.value.as_i64().unwrap()
    }

    // ========================================================================
    // Word / Unsigned / Long
    // ========================================================================

    #[test]
    fn test_word_sign_extends() {
        let d = decode(&words(&[0x8000]), ValueOption::Word, DeviceKind::SharedRegister).unwrap();
        assert_eq!(int(d), -32768);
        let d = decode(&words(&[0xFFFF]), ValueOption::Word, DeviceKind::SharedRegister).unwrap();
        assert_eq!(int(d), -1);
    }

    #[test]
    fn test_unsigned_zero_extends() {
        let d = decode(
            &words(&[0x8000]),
            ValueOption::Unsigned,
            DeviceKind::SharedRegister,
        )
        .unwrap();
        assert_eq!(int(d), 32768);
    }

    #[test]
    fn test_long_low_word_first() {
        let d = decode(
            &words(&[0x0001, 0x0002]),
            ValueOption::Long,
            DeviceKind::SharedRegister,
        )
        .unwrap();
        assert_eq!(int(d), 0x0002_0001);

        let d = decode(
            &words(&[0xFFFF, 0xFFFF]),
            ValueOption::Long,
            DeviceKind::LinkRegister,
        )
        .unwrap();
        assert_eq!(int(d), -1);
    }

    #[test]
    fn test_long_needs_two_words() {
        assert!(decode(&words(&[1]), ValueOption::Long, DeviceKind::SharedRegister).is_err());
    }

    #[test]
    fn test_native_long_used_as_is() {
        let d = decode(
            &RawData::Long(0x0002_0001),
            ValueOption::Long,
            DeviceKind::SpecialRegister,
        )
        .unwrap();
        assert_eq!(int(d), 0x0002_0001);
    }

    #[test]
    fn test_empty_data_is_error() {
        assert!(decode(&RawData::Empty, ValueOption::Word, DeviceKind::SharedRegister).is_err());
        assert!(decode(&words(&[]), ValueOption::Word, DeviceKind::SharedRegister).is_err());
    }

    // ========================================================================
    // BCD
    // ========================================================================

    #[test]
    fn test_bcd_decode() {
        let d = decode(&words(&[0x1234]), ValueOption::Bcd, DeviceKind::DataRegister).unwrap();
        assert_eq!(int(d.clone()), 1234);
        assert_eq!(d.alarm, None);
    }

    #[test]
    fn test_bcd_invalid_digits_clamp_and_alarm() {
        let d = decode(&words(&[0xFFFF]), ValueOption::Bcd, DeviceKind::DataRegister).unwrap();
        assert_eq!(d.value, RecordValue::Integer(9999));
        assert_eq!(d.alarm, Some(Alarm::InvalidBcd { raw: 0xFFFF }));
    }

    #[test]
    fn test_bcd_single_bad_digit() {
        // Tens digit 0xA clamps to 9: 1 + 90 + 300 + 0
        assert_eq!(bcd_to_int(0x03A1), (391, true));
        assert_eq!(bcd_to_int(0x0000), (0, false));
    }

    #[test]
    fn test_int_to_bcd_range() {
        assert_eq!(int_to_bcd(1234).unwrap(), 0x1234);
        assert_eq!(int_to_bcd(9999).unwrap(), 0x9999);
        assert!(int_to_bcd(10000).is_err());
        assert!(int_to_bcd(-1).is_err());
    }

    // ========================================================================
    // Encode
    // ========================================================================

    #[test]
    fn test_encode_ranges() {
        assert_eq!(encode(-32768, ValueOption::Word).unwrap(), vec![0x8000]);
        assert!(encode(32768, ValueOption::Word).is_err());
        assert_eq!(encode(32768, ValueOption::Unsigned).unwrap(), vec![0x8000]);
        assert!(encode(-1, ValueOption::Unsigned).is_err());
        assert_eq!(
            encode(0x0002_0001, ValueOption::Long).unwrap(),
            vec![0x0001, 0x0002]
        );
        assert_eq!(encode(-1, ValueOption::Long).unwrap(), vec![0xFFFF, 0xFFFF]);
    }

    #[test]
    fn test_encode_point() {
        assert_eq!(encode_point(1).unwrap(), vec![1]);
        assert!(encode_point(2).is_err());
    }

    // ========================================================================
    // String block
    // ========================================================================

    #[test]
    fn test_decode_string_stops_at_nul() {
        let raw = words(&[0x4D33, 0x494F, 0x0000, 0x4142]);
        assert_eq!(decode_string(&raw).unwrap(), "M3IO");
    }

    #[test]
    fn test_decode_string_odd_length() {
        let raw = words(&[0x4142, 0x4300]);
        assert_eq!(decode_string(&raw).unwrap(), "ABC");
    }
}
