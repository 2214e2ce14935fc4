//! Unsigned LEB128 varints, as used by CAR section framing and multicodec
//! prefixes

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `buf`
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from `buf` starting at `*pos`, advancing `*pos` past it
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> io::Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = buf.get(*pos) else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "varint: unexpected end of buffer",
            ));
        };
        *pos += 1;
        result = accumulate(result, byte, shift)?;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Read one varint from an async reader
///
/// Returns the value and the number of bytes it took up. `None` means the
/// reader was already at EOF; running out of bytes *inside* a varint is an
/// `UnexpectedEof` error.
pub async fn read_varint<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<(u64, usize)>> {
    let mut result = 0u64;
    let mut shift = 0u32;
    let mut len = 0;
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if len == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "varint: stream ended mid-varint",
            ));
        }
        len += 1;
        result = accumulate(result, byte[0], shift)?;
        if byte[0] & 0x80 == 0 {
            return Ok(Some((result, len)));
        }
        shift += 7;
    }
}

fn accumulate(result: u64, byte: u8, shift: u32) -> io::Result<u64> {
    let payload = (byte & 0x7f) as u64;
    if shift > 63 || (shift == 63 && payload > 1) {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
    }
    Ok(result | (payload << shift))
}
