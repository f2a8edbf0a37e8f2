//! Order-preserving byte encoding for keys, and the persistence key layout
//! from the external interfaces: a tag byte, length-prefixed schema/table
//! name, then encoded PK (or index-key + PK) columns.
//!
//! Byte-ordering of encoded NULLs across collations is left to the backend
//! by the distilled spec; here NULL always sorts first (tag 0x00), which is
//! the one choice consistent with every collation this crate implements.

use crate::value::{Collation, Value};

const TAG_NULL: u8 = 0x00;
const TAG_NUMERIC: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TAG_BLOB: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;

/// Encodes one value so that unsigned byte-comparison of the encoded form
/// matches SQL ordering (NULL first, then numerics compared by value, then
/// text under `collation`, then blobs by raw bytes).
pub fn encode_value(value: &Value, collation: Collation) -> Vec<u8> {
    match value {
        Value::Null => vec![TAG_NULL],
        Value::Integer(i) => encode_numeric(TAG_NUMERIC, *i as f64),
        Value::BigInt(i) => encode_numeric(TAG_NUMERIC, *i as f64),
        Value::Real(r) => encode_numeric(TAG_NUMERIC, *r),
        Value::Boolean(b) => vec![TAG_BOOL, if *b { 1 } else { 0 }],
        Value::Text(s) => {
            let folded = match collation {
                Collation::Binary => s.clone(),
                Collation::NoCase => s.to_ascii_lowercase(),
            };
            let mut out = Vec::with_capacity(1 + folded.len());
            out.push(TAG_TEXT);
            out.extend_from_slice(folded.as_bytes());
            out
        }
        Value::Blob(b) => {
            let mut out = Vec::with_capacity(1 + b.len());
            out.push(TAG_BLOB);
            out.extend_from_slice(b);
            out
        }
    }
}

/// Maps an f64 onto a big-endian byte sequence that preserves numeric
/// ordering under unsigned byte-compare: flip the sign bit for positive
/// numbers and invert all bits for negative ones.
fn encode_numeric(tag: u8, value: f64) -> Vec<u8> {
    let bits = value.to_bits();
    let mapped = if value.is_sign_negative() { !bits } else { bits | (1u64 << 63) };
    let mut out = Vec::with_capacity(9);
    out.push(tag);
    out.extend_from_slice(&mapped.to_be_bytes());
    out
}

fn length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Byte-key for a data row: tag `b'R'`, schema name, table name, PK columns.
pub fn encode_row_key(schema: &str, table: &str, pk: &[(Value, Collation)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'R');
    length_prefixed(&mut out, schema.as_bytes());
    length_prefixed(&mut out, table.as_bytes());
    for (value, collation) in pk {
        out.extend_from_slice(&encode_value(value, *collation));
        out.push(0); // component separator, safe because tags are never 0 mid-stream
    }
    out
}

/// Byte-key prefix for every row of `table` (used for full-table scans).
pub fn row_prefix(schema: &str, table: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'R');
    length_prefixed(&mut out, schema.as_bytes());
    length_prefixed(&mut out, table.as_bytes());
    out
}

/// Byte-key for a secondary-index entry: tag `b'I'`, schema, table, index
/// name, index-key columns, then PK columns (so duplicates on the index key
/// are ordered by PK).
pub fn encode_index_key(
    schema: &str,
    table: &str,
    index: &str,
    index_key: &[(Value, Collation)],
    pk: &[(Value, Collation)],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'I');
    length_prefixed(&mut out, schema.as_bytes());
    length_prefixed(&mut out, table.as_bytes());
    length_prefixed(&mut out, index.as_bytes());
    for (value, collation) in index_key {
        out.extend_from_slice(&encode_value(value, *collation));
        out.push(0);
    }
    for (value, collation) in pk {
        out.extend_from_slice(&encode_value(value, *collation));
        out.push(0);
    }
    out
}

/// Byte-key prefix covering every entry that shares `index_key`, regardless
/// of PK — used to check secondary-index uniqueness without the trailing
/// PK making every key distinct.
pub fn encode_index_key_prefix(schema: &str, table: &str, index: &str, index_key: &[(Value, Collation)]) -> Vec<u8> {
    let mut out = index_prefix(schema, table, index);
    for (value, collation) in index_key {
        out.extend_from_slice(&encode_value(value, *collation));
        out.push(0);
    }
    out
}

pub fn index_prefix(schema: &str, table: &str, index: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'I');
    length_prefixed(&mut out, schema.as_bytes());
    length_prefixed(&mut out, table.as_bytes());
    length_prefixed(&mut out, index.as_bytes());
    out
}

/// Appends a trailing, exactly-decodable copy of `pk` to an already-built
/// index key so a secondary-index scan can recover the primary key without
/// a second lookup. The order-preserving prefix built by `encode_index_key`
/// is lossy by design (it folds `Integer`/`Real` onto one numeric scale);
/// this suffix is not part of the sort key, only of the stored bytes, so it
/// is appended after `encode_index_key` returns rather than folded into it.
pub fn append_recoverable_pk(mut key: Vec<u8>, pk_values: &[Value]) -> Vec<u8> {
    let blob = encode_row_blob(pk_values);
    key.extend_from_slice(&blob);
    key.extend_from_slice(&(blob.len() as u32).to_be_bytes());
    key
}

/// Recovers the primary key values appended by `append_recoverable_pk`.
pub fn decode_trailing_pk(key: &[u8]) -> crate::error::Result<Vec<Value>> {
    if key.len() < 4 {
        return Err(crate::error::Error::corrupted("index key too short for trailing PK"));
    }
    let (head, len_bytes) = key.split_at(key.len() - 4);
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    if head.len() < len {
        return Err(crate::error::Error::corrupted("index key trailing PK length out of range"));
    }
    decode_row_blob(&head[head.len() - len..])
}

/// Exact, reversible encoding of one value, distinguishing every tag
/// (unlike `encode_value`, which deliberately collapses `Integer`/`BigInt`/
/// `Real` onto a shared ordering scale). Used for row/PK storage bytes,
/// never for sort keys.
fn encode_value_exact(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(0x00),
        Value::Integer(i) => {
            out.push(0x01);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::BigInt(i) => {
            out.push(0x02);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Real(r) => {
            out.push(0x03);
            out.extend_from_slice(&r.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            out.push(0x04);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Boolean(b) => {
            out.push(0x05);
            out.push(if *b { 1 } else { 0 });
        }
        Value::Blob(b) => {
            out.push(0x06);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
    }
}

fn decode_value_exact(bytes: &[u8], pos: &mut usize) -> crate::error::Result<Value> {
    let tag = *bytes.get(*pos).ok_or_else(|| crate::error::Error::corrupted("short value tag"))?;
    *pos += 1;
    match tag {
        0x00 => Ok(Value::Null),
        0x01 => {
            let slice = bytes.get(*pos..*pos + 8).ok_or_else(|| crate::error::Error::corrupted("short integer"))?;
            *pos += 8;
            Ok(Value::Integer(i64::from_be_bytes(slice.try_into().unwrap())))
        }
        0x02 => {
            let slice = bytes.get(*pos..*pos + 16).ok_or_else(|| crate::error::Error::corrupted("short bigint"))?;
            *pos += 16;
            Ok(Value::BigInt(i128::from_be_bytes(slice.try_into().unwrap())))
        }
        0x03 => {
            let slice = bytes.get(*pos..*pos + 8).ok_or_else(|| crate::error::Error::corrupted("short real"))?;
            *pos += 8;
            Ok(Value::Real(f64::from_bits(u64::from_be_bytes(slice.try_into().unwrap()))))
        }
        0x04 => {
            let len = read_u32_at(bytes, pos)? as usize;
            let slice = bytes.get(*pos..*pos + len).ok_or_else(|| crate::error::Error::corrupted("short text"))?;
            *pos += len;
            Ok(Value::Text(String::from_utf8_lossy(slice).into_owned()))
        }
        0x05 => {
            let b = *bytes.get(*pos).ok_or_else(|| crate::error::Error::corrupted("short bool"))?;
            *pos += 1;
            Ok(Value::Boolean(b == 1))
        }
        0x06 => {
            let len = read_u32_at(bytes, pos)? as usize;
            let slice = bytes.get(*pos..*pos + len).ok_or_else(|| crate::error::Error::corrupted("short blob"))?;
            *pos += len;
            Ok(Value::Blob(slice.to_vec()))
        }
        _ => Err(crate::error::Error::corrupted("unknown value tag")),
    }
}

fn read_u32_at(bytes: &[u8], pos: &mut usize) -> crate::error::Result<u32> {
    let slice = bytes.get(*pos..*pos + 4).ok_or_else(|| crate::error::Error::corrupted("short length"))?;
    *pos += 4;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

/// Encodes a full row (or any value tuple) as an exactly-decodable blob:
/// a count followed by each tagged value. This is the format `MemTable`
/// stores row bytes in; distinct from the order-preserving key encoding
/// above.
pub fn encode_row_blob(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for value in values {
        encode_value_exact(value, &mut out);
    }
    out
}

pub fn decode_row_blob(bytes: &[u8]) -> crate::error::Result<Vec<Value>> {
    let mut pos = 0;
    let count = read_u32_at(bytes, &mut pos)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value_exact(bytes, &mut pos)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ordering_preserved() {
        let values = [-100.0, -1.0, 0.0, 1.0, 100.0];
        let mut encoded: Vec<Vec<u8>> =
            values.iter().map(|v| encode_numeric(TAG_NUMERIC, *v)).collect();
        let sorted_by_value = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted_by_value);
    }

    #[test]
    fn null_sorts_before_everything() {
        let null = encode_value(&Value::Null, Collation::Binary);
        let int = encode_value(&Value::Integer(-5), Collation::Binary);
        let text = encode_value(&Value::Text("a".into()), Collation::Binary);
        assert!(null < int);
        assert!(null < text);
    }

    #[test]
    fn nocase_folds_before_encoding() {
        let a = encode_value(&Value::Text("ABC".into()), Collation::NoCase);
        let b = encode_value(&Value::Text("abc".into()), Collation::NoCase);
        assert_eq!(a, b);
    }

    #[test]
    fn row_blob_round_trips_distinct_numeric_tags() {
        let values = vec![Value::Integer(5), Value::BigInt(5), Value::Real(5.0)];
        let blob = encode_row_blob(&values);
        assert_eq!(decode_row_blob(&blob).unwrap(), values);
    }

    #[test]
    fn trailing_pk_round_trips_through_index_key() {
        let pk = vec![Value::Integer(42)];
        let key = encode_index_key(
            "main",
            "t",
            "by_name",
            &[(Value::Text("Bo".into()), Collation::Binary)],
            &[(Value::Integer(42), Collation::Binary)],
        );
        let key = append_recoverable_pk(key, &pk);
        assert_eq!(decode_trailing_pk(&key).unwrap(), pk);
    }

    #[test]
    fn row_key_prefix_matches() {
        let key = encode_row_key("main", "t", &[(Value::Integer(1), Collation::Binary)]);
        let prefix = row_prefix("main", "t");
        assert!(key.starts_with(&prefix));
    }
}
