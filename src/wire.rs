//! Primitives for the wire protocol: big-endian encoding over [`bytes`]
//! buffers and [`nom`] parsers over [`nombytes::NomBytes`] input.
//!
//! All integers are big-endian. Strings are length-prefixed with an i16
//! (-1 = null). Byte blocks are length-prefixed with an i32 (-1 = null).
//! Arrays are an i32 count followed by that many elements.

use bytes::{BufMut, Bytes};
use nom::{
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_i16, be_i32},
    IResult,
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;
use crate::error::Result;

// =============================================================================
// Encoding
// =============================================================================

/// Serialize a value into a wire protocol buffer.
pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for i8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self);
        Ok(())
    }
}

impl ToByte for i16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(self.len() as i16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl ToByte for Option<String> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(s) => s.encode(buffer),
            None => (-1i16).encode(buffer),
        }
    }
}

impl ToByte for Bytes {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        buffer.put_i32(self.len() as i32);
        buffer.put_slice(self);
        Ok(())
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(b) => b.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

/// Encode a slice as a protocol array: i32 count, then each element.
pub fn encode_array<T: ToByte, W: BufMut>(buffer: &mut W, items: &[T]) -> Result<()> {
    buffer.put_i32(items.len() as i32);
    for item in items {
        item.encode(buffer)?;
    }
    Ok(())
}

/// Encode a slice of i32 as a protocol array. Replica lists are common
/// enough on the metadata paths to warrant the shortcut.
pub fn encode_i32_array<W: BufMut>(buffer: &mut W, items: &[i32]) -> Result<()> {
    buffer.put_i32(items.len() as i32);
    for item in items {
        buffer.put_i32(*item);
    }
    Ok(())
}

// =============================================================================
// Parsing
// =============================================================================

/// Convert bytes to a validated UTF-8 string.
pub fn bytes_to_string(bytes: &Bytes) -> std::result::Result<String, NomErr> {
    std::str::from_utf8(bytes).map(|s| s.to_string()).map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(
            NomBytes::from(bytes.as_ref()),
            nom::error::ErrorKind::Verify,
        ))
    })
}

/// Convert optional bytes to a validated UTF-8 string.
pub fn bytes_to_string_opt(bytes: Option<Bytes>) -> std::result::Result<Option<String>, NomErr> {
    match bytes {
        Some(b) => bytes_to_string(&b).map(Some),
        None => Ok(None),
    }
}

/// The nom error type shared by all wire parsers.
pub type NomErr = nom::Err<nom::error::Error<NomBytes>>;

/// Parse a non-nullable length-prefixed string.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i16(s)?;
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (s, string) = take(length as u16)(s)?;
    Ok((s, string.into_bytes()))
}

/// Parse a nullable length-prefixed string (-1 = null).
pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (s, string) = take(length as u16)(s)?;
    Ok((s, Some(string.into_bytes())))
}

/// Parse an i32-length-prefixed byte block (-1 = null, mapped to empty).
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i32(s)?;
    if length <= 0 {
        return Ok((s, Bytes::new()));
    }
    let (s, block) = take(length as u32)(s)?;
    Ok((s, block.into_bytes()))
}

/// Parse a protocol array with a bounded element count. A null array (-1)
/// parses as empty.
pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;
        if length == -1 {
            return Ok((i, vec![]));
        }
        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }
        many_m_n(length as usize, length as usize, f)(i)
    }
}

/// Parse a protocol array of i32 (broker-id lists).
pub fn parse_i32_array(s: NomBytes) -> IResult<NomBytes, Vec<i32>> {
    parse_array(be_i32)(s)
}
