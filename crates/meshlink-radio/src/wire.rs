//! Protobuf wire-format scanning
//!
//! A few fields the engine needs are absent from the minimal schema in
//! [`crate::proto`] (for example the routing error reason). These helpers
//! walk a serialized message field by field without a schema.

use crate::error::{MeshlinkError, Result};

/// Wire type of a protobuf field key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_key(key: u64) -> Result<Self> {
        match key & 0x07 {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(MeshlinkError::MalformedField(format!(
                "unsupported wire type {}",
                other
            ))),
        }
    }
}

/// Read a base-128 varint starting at `*pos`, advancing `pos` past it
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| MeshlinkError::MalformedField("truncated varint".to_string()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(MeshlinkError::MalformedField("varint longer than 10 bytes".to_string()))
}

/// Skip over the value of a field with the given wire type
pub fn skip_field(buf: &[u8], pos: &mut usize, wire_type: WireType) -> Result<()> {
    let len = match wire_type {
        WireType::Varint => {
            read_varint(buf, pos)?;
            return Ok(());
        }
        WireType::Fixed64 => 8,
        WireType::Fixed32 => 4,
        WireType::LengthDelimited => read_varint(buf, pos)? as usize,
    };
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| MeshlinkError::MalformedField(format!("field of {} bytes overruns buffer", len)))?;
    *pos = end;
    Ok(())
}

/// Find the first varint value stored under `field_number`
///
/// Returns `Ok(None)` when the field is absent. A field with the right
/// number but a non-varint wire type is skipped.
pub fn find_varint_field(buf: &[u8], field_number: u32) -> Result<Option<u64>> {
    let mut pos = 0;
    while pos < buf.len() {
        let key = read_varint(buf, &mut pos)?;
        let wire_type = WireType::from_key(key)?;
        let number = (key >> 3) as u32;
        if number == field_number && wire_type == WireType::Varint {
            return read_varint(buf, &mut pos).map(Some);
        }
        skip_field(buf, &mut pos, wire_type)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_varint() {
        let mut pos = 0;
        assert_eq!(read_varint(&[0x96, 0x01], &mut pos).unwrap(), 150);
        assert_eq!(pos, 2);

        let mut pos = 0;
        assert!(read_varint(&[0x80, 0x80], &mut pos).is_err());
    }

    #[test]
    fn test_find_field_after_other_fields() {
        // field 1: length-delimited "ab", field 2: fixed32, field 3: varint 5
        let buf = [0x0A, 0x02, b'a', b'b', 0x15, 1, 2, 3, 4, 0x18, 0x05];
        assert_eq!(find_varint_field(&buf, 3).unwrap(), Some(5));
        assert_eq!(find_varint_field(&buf, 4).unwrap(), None);
    }

    #[test]
    fn test_empty_buffer_has_no_field() {
        assert_eq!(find_varint_field(&[], 3).unwrap(), None);
    }

    #[test]
    fn test_overrunning_length_is_malformed() {
        let buf = [0x0A, 0x09, b'a'];
        assert!(matches!(
            find_varint_field(&buf, 3),
            Err(MeshlinkError::MalformedField(_))
        ));
    }

    #[test]
    fn test_group_wire_type_rejected() {
        // field 1, wire type 3 (start group)
        assert!(find_varint_field(&[0x0B], 3).is_err());
    }
}
