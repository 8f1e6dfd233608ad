//! Payload serializer. Primitives are written in little-endian byte order,
//! aligned to their own size within the payload buffer. The backing buffer
//! grows in powers of two.

use byteorder::{LittleEndian, WriteBytesExt};

/// Serializer writing into a payload buffer owned by a request writer.
/// Serialization does not fail short of allocation exhaustion.
pub struct OStream<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> OStream<'a> {
    #[inline]
    pub fn new(buf: &'a mut Vec<u8>) -> OStream<'a> {
        OStream { buf }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Pad with zero bytes so the next write lands on an offset divisible
    /// by `align`.
    #[inline]
    fn align(&mut self, align: usize) {
        let pad = self.buf.len().wrapping_neg() & (align - 1);
        self.grow(pad + align);

        for _ in 0..pad {
            self.buf.push(0);
        }
    }

    #[inline]
    fn grow(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;

        if needed > self.buf.capacity() {
            let target = needed.next_power_of_two();
            let len = self.buf.len();
            self.buf.reserve_exact(target - len);
        }
    }

    /// Append raw bytes without alignment or length prefix.
    #[inline]
    pub fn write_raw(&mut self, data: &[u8]) {
        self.grow(data.len());
        self.buf.extend_from_slice(data);
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.align(1);
        self.buf.write_u8(value).expect("payload write");
    }

    #[inline]
    pub fn write_i8(&mut self, value: i8) {
        self.align(1);
        self.buf.write_i8(value).expect("payload write");
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.align(2);
        self.buf.write_u16::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_i16(&mut self, value: i16) {
        self.align(2);
        self.buf.write_i16::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.align(4);
        self.buf.write_u32::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.align(4);
        self.buf.write_i32::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.align(8);
        self.buf.write_u64::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.align(8);
        self.buf.write_i64::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.align(4);
        self.buf.write_f32::<LittleEndian>(value).expect("payload write");
    }

    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        self.align(8);
        self.buf.write_f64::<LittleEndian>(value).expect("payload write");
    }

    /// Booleans travel as a 32 bit integer, zero or one.
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(if value { 1 } else { 0 });
    }

    /// Text encoding: byte length including one trailing zero, then the
    /// UTF-8 bytes and the zero. The empty string encodes as a single
    /// zero length.
    pub fn write_str(&mut self, value: &str) {
        if value.is_empty() {
            self.write_u32(0);
            return;
        }

        self.write_u32(value.len() as u32 + 1);
        self.write_raw(value.as_bytes());
        self.buf.push(0);
    }

    /// Byte string encoding: length then the raw bytes, no terminator.
    pub fn write_buffer(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.write_raw(value);
    }
}

/// Objects that can be written onto a payload stream.
pub trait Serialize {
    fn serialize(&self, os: &mut OStream);
}

macro_rules! impl_primitive_serialize {
    ($($ty:ty => $write:ident),+) => {
        $(
            impl Serialize for $ty {
                #[inline]
                fn serialize(&self, os: &mut OStream) {
                    os.$write(*self);
                }
            }
        )+
    };
}

impl_primitive_serialize!(
    u8 => write_u8,
    i8 => write_i8,
    u16 => write_u16,
    i16 => write_i16,
    u32 => write_u32,
    i32 => write_i32,
    u64 => write_u64,
    i64 => write_i64,
    f32 => write_f32,
    f64 => write_f64,
    bool => write_bool
);

impl Serialize for String {
    #[inline]
    fn serialize(&self, os: &mut OStream) {
        os.write_str(self);
    }
}

impl<'s> Serialize for &'s str {
    #[inline]
    fn serialize(&self, os: &mut OStream) {
        os.write_str(self);
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize(&self, os: &mut OStream) {
        os.write_i32(self.len() as i32);

        for item in self {
            item.serialize(os);
        }
    }
}

impl<K, V, S> Serialize for hashbrown::HashMap<K, V, S>
where
    K: Serialize,
    V: Serialize,
    S: std::hash::BuildHasher,
{
    fn serialize(&self, os: &mut OStream) {
        os.write_i32(self.len() as i32);

        for (key, value) in self {
            key.serialize(os);
            value.serialize(os);
        }
    }
}
