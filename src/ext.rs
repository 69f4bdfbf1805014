//! Small helper traits used while encoding/decoding postgres wire messages.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::ByteStr;

/// Integer size conversions that panic instead of silently wrapping.
pub trait UsizeExt {
    fn to_u32(self) -> u32;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for the postgres wire protocol")
    }
}

/// Nul-terminated string length, as postgres counts it.
pub trait StrExt {
    fn nul_string_len(&self) -> u32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1
    }
}

/// Write a nul-terminated string.
pub trait BufMutExt {
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

/// Read a nul-terminated string out of a backend message body.
pub trait BytesExt {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, std::str::Utf8Error>;
}

impl BytesExt for Bytes {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, std::str::Utf8Error> {
        let end = self
            .iter()
            .position(|&b| b == b'\0')
            .expect("postgres string was not nul terminated");
        let me = self.split_to(end);
        Buf::advance(self, 1);
        ByteStr::from_utf8(me)
    }
}

impl BytesExt for BytesMut {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, std::str::Utf8Error> {
        let end = self
            .iter()
            .position(|&b| b == b'\0')
            .expect("postgres string was not nul terminated");
        let me = self.split_to(end);
        Buf::advance(self, 1);
        ByteStr::from_utf8(me.freeze())
    }
}
