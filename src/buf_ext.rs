use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::safe_converter::{PrecheckedCast, SafeCast};

pub fn try_get_varint(buf: &mut impl Buf) -> anyhow::Result<u64> {
    Ok(buf.try_get_u64_varint()?)
}

pub fn try_get_varint_usize(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let raw = buf.try_get_u64_varint()?;
    if raw > buf.remaining().safe_cast() {
        bail!("length {} exceeds the remaining {} bytes", raw, buf.remaining());
    }
    Ok(raw.prechecked_cast())
}

pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

/// This is zero-copy if the underlying buffer is a [Bytes]
pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = try_get_varint_usize(buf)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

pub fn put_optional_bytes(buf: &mut impl BufMut, data: Option<&[u8]>) {
    match data {
        None => buf.put_u8(0),
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data);
        }
    }
}

pub fn try_get_optional_bytes(buf: &mut impl Buf) -> anyhow::Result<Option<Bytes>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_bytes(buf)?)),
        other => bail!("invalid option marker {}", other),
    }
}

pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
