//! Infallible encoding and length-checked decoding of wire primitives.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::shared::ConnectionId;
use crate::CONNECTION_ID_MAX_SIZE;

/// Error indicating that the provided buffer was too small
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Fixed-width big-endian encoding and decoding
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn get_var(&mut self) -> Result<u64>;
    fn get_cid(&mut self) -> Result<ConnectionId>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        varint::read(self).ok_or(UnexpectedEnd)
    }

    /// One length byte, then that many bytes of connection ID
    fn get_cid(&mut self) -> Result<ConnectionId> {
        let len = self.get::<u8>()? as usize;
        if len > CONNECTION_ID_MAX_SIZE || self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let cid = ConnectionId::new(&self.chunk()[..len]);
        self.advance(len);
        Ok(cid)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_var(&mut self, x: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        varint::write(x, self).unwrap();
    }
}

pub mod varint {
    use bytes::{Buf, BufMut};
    use thiserror::Error;

    //  +------+--------+-------------+-----------------------+
    //  | 2Bit | Length | Usable Bits | Range                 |
    //  +------+--------+-------------+-----------------------+
    //  | 00   | 1      | 6           | 0-63                  |
    //  | 01   | 2      | 14          | 0-16383               |
    //  | 10   | 4      | 30          | 0-1073741823          |
    //  | 11   | 8      | 62          | 0-4611686018427387903 |
    //  +------+--------+-------------+-----------------------+

    /// Largest encodable value
    pub const MAX_VALUE: u64 = (1 << 62) - 1;

    pub fn size(x: u64) -> Option<usize> {
        if x < 1 << 6 {
            Some(1)
        } else if x < 1 << 14 {
            Some(2)
        } else if x < 1 << 30 {
            Some(4)
        } else if x < 1 << 62 {
            Some(8)
        } else {
            None
        }
    }

    pub fn read<B: Buf>(r: &mut B) -> Option<u64> {
        if !r.has_remaining() {
            return None;
        }
        let tag = r.chunk()[0] >> 6;
        match tag {
            0b00 => Some(u64::from(r.get_u8())),
            0b01 if r.remaining() >= 2 => Some(u64::from(r.get_u16()) & 0x3fff),
            0b10 if r.remaining() >= 4 => Some(u64::from(r.get_u32()) & 0x3fff_ffff),
            0b11 if r.remaining() >= 8 => Some(r.get_u64() & MAX_VALUE),
            _ => None,
        }
    }

    #[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
    pub enum WriteError {
        #[error("insufficient space to encode value")]
        InsufficientSpace,
        #[error("value too large for varint encoding")]
        OversizedValue,
    }

    pub fn write<B: BufMut>(x: u64, w: &mut B) -> Result<(), WriteError> {
        if x < 1 << 6 {
            if w.remaining_mut() < 1 {
                return Err(WriteError::InsufficientSpace);
            }
            w.put_u8(x as u8);
        } else if x < 1 << 14 {
            if w.remaining_mut() < 2 {
                return Err(WriteError::InsufficientSpace);
            }
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < 1 << 30 {
            if w.remaining_mut() < 4 {
                return Err(WriteError::InsufficientSpace);
            }
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < 1 << 62 {
            if w.remaining_mut() < 8 {
                return Err(WriteError::InsufficientSpace);
            }
            w.put_u64(0b11 << 62 | x);
        } else {
            return Err(WriteError::OversizedValue);
        }
        Ok(())
    }
}
