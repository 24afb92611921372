//! Minimal little-endian, var-int length-prefixed binary codec (spec §6:
//! "bit-exact formats ... little-endian, length-prefixed (var-int)").
//!
//! This is deliberately small and hand-rolled rather than reusing
//! `bitcoin::consensus::encode`: the wire shapes here (tagged payload
//! variants, a 21-byte program hash per output) do not match Bitcoin's own
//! transaction format, only its *style* of var-int framing.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{WalletError, WalletResult};

pub fn write_var_int(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.write_u16::<LittleEndian>(n as u16).unwrap();
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.write_u32::<LittleEndian>(n as u32).unwrap();
    } else {
        buf.push(0xff);
        buf.write_u64::<LittleEndian>(n).unwrap();
    }
}

pub fn read_var_int(bytes: &[u8], pos: &mut usize) -> WalletResult<u64> {
    let tag = read_u8(bytes, pos)?;
    Ok(match tag {
        0xfd => read_u16(bytes, pos)? as u64,
        0xfe => read_u32(bytes, pos)? as u64,
        0xff => read_u64(bytes, pos)?,
        n => n as u64,
    })
}

pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_int(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn read_var_bytes(bytes: &[u8], pos: &mut usize) -> WalletResult<Vec<u8>> {
    let len = read_var_int(bytes, pos)? as usize;
    read_exact(bytes, pos, len).map(|s| s.to_vec())
}

fn truncated() -> WalletError {
    WalletError::InvalidArgument("truncated transaction bytes".into())
}

pub fn read_exact<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> WalletResult<&'a [u8]> {
    let end = pos.checked_add(len).ok_or_else(truncated)?;
    if end > bytes.len() {
        return Err(truncated());
    }
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

pub fn read_u8(bytes: &[u8], pos: &mut usize) -> WalletResult<u8> {
    Ok(read_exact(bytes, pos, 1)?[0])
}

pub fn read_u16(bytes: &[u8], pos: &mut usize) -> WalletResult<u16> {
    let s = read_exact(bytes, pos, 2)?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

pub fn read_u32(bytes: &[u8], pos: &mut usize) -> WalletResult<u32> {
    let s = read_exact(bytes, pos, 4)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

pub fn read_u64(bytes: &[u8], pos: &mut usize) -> WalletResult<u64> {
    let s = read_exact(bytes, pos, 8)?;
    Ok(u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
}

pub fn read_u128(bytes: &[u8], pos: &mut usize) -> WalletResult<u128> {
    let s = read_exact(bytes, pos, 16)?;
    let mut arr = [0u8; 16];
    arr.copy_from_slice(s);
    Ok(u128::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_round_trips_at_boundaries() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000, u64::MAX] {
            let mut buf = Vec::new();
            write_var_int(&mut buf, n);
            let mut pos = 0;
            assert_eq!(read_var_int(&buf, &mut pos).unwrap(), n);
            assert_eq!(pos, buf.len());
        }
    }
}
