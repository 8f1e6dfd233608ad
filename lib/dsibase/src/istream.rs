//! Payload deserializer. The stream holds a latched error indicator: any
//! failed read (insufficient bytes, malformed text) sets it and turns all
//! subsequent reads into no-ops returning default values.

use byteorder::{ByteOrder, LittleEndian};

/// Deserializer over a received payload slice.
pub struct IStream<'a> {
    data: &'a [u8],
    offset: usize,
    error: bool,
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $size:expr, $read:expr) => {
        #[inline]
        pub fn $name(&mut self) -> $ty {
            match self.aligned_slot($size) {
                Some(offset) => $read(&self.data[offset..]),
                None => Default::default(),
            }
        }
    };
}

impl<'a> IStream<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> IStream<'a> {
        IStream {
            data,
            offset: 0,
            error: false,
        }
    }

    /// True once any read has failed. Mirrors the range-error indicator of
    /// the wire protocol: reads after a failure are no-ops.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Latch the error indicator from the outside, e.g. when decoded
    /// content is structurally unusable.
    #[inline]
    pub fn set_error(&mut self) {
        self.error = true;
        self.offset = self.data.len();
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Advance the read offset without interpreting the bytes.
    #[inline]
    pub fn skip(&mut self, len: usize) {
        if len <= self.remaining() {
            self.offset += len;
        } else {
            self.set_error();
        }
    }

    /// Align the offset and reserve `size` bytes, returning the read
    /// position or latching the error.
    #[inline]
    fn aligned_slot(&mut self, size: usize) -> Option<usize> {
        if self.error {
            return None;
        }

        let offset = self.offset + (self.offset.wrapping_neg() & (size - 1));

        if offset + size <= self.data.len() {
            self.offset = offset + size;
            Some(offset)
        } else {
            self.set_error();
            None
        }
    }

    read_primitive!(read_u8, u8, 1, |d: &[u8]| d[0]);
    read_primitive!(read_i8, i8, 1, |d: &[u8]| d[0] as i8);
    read_primitive!(read_u16, u16, 2, LittleEndian::read_u16);
    read_primitive!(read_i16, i16, 2, LittleEndian::read_i16);
    read_primitive!(read_u32, u32, 4, LittleEndian::read_u32);
    read_primitive!(read_i32, i32, 4, LittleEndian::read_i32);
    read_primitive!(read_u64, u64, 8, LittleEndian::read_u64);
    read_primitive!(read_i64, i64, 8, LittleEndian::read_i64);
    read_primitive!(read_f32, f32, 4, LittleEndian::read_f32);
    read_primitive!(read_f64, f64, 8, LittleEndian::read_f64);

    #[inline]
    pub fn read_bool(&mut self) -> bool {
        self.read_i32() != 0
    }

    /// Counterpart of `OStream::write_str`. Invalid UTF-8 content latches
    /// the error indicator.
    pub fn read_str(&mut self) -> String {
        let len = self.read_u32() as usize;

        if self.error || len == 0 {
            return String::new();
        }

        if len > self.remaining() {
            self.set_error();
            return String::new();
        }

        let bytes = &self.data[self.offset..self.offset + len - 1];
        self.offset += len;

        match std::str::from_utf8(bytes) {
            Ok(text) => text.to_owned(),
            Err(_) => {
                self.set_error();
                String::new()
            }
        }
    }

    /// Counterpart of `OStream::write_buffer`.
    pub fn read_buffer(&mut self) -> Vec<u8> {
        let len = self.read_u32() as usize;

        if self.error || len == 0 {
            return Vec::new();
        }

        if len > self.remaining() {
            self.set_error();
            return Vec::new();
        }

        let bytes = self.data[self.offset..self.offset + len].to_vec();
        self.offset += len;
        bytes
    }
}

/// Objects that can be read back from a payload stream. Implementations
/// return a default value once the stream error indicator is latched.
pub trait Deserialize: Sized {
    fn deserialize(is: &mut IStream) -> Self;
}

macro_rules! impl_primitive_deserialize {
    ($($ty:ty => $read:ident),+) => {
        $(
            impl Deserialize for $ty {
                #[inline]
                fn deserialize(is: &mut IStream) -> Self {
                    is.$read()
                }
            }
        )+
    };
}

impl_primitive_deserialize!(
    u8 => read_u8,
    i8 => read_i8,
    u16 => read_u16,
    i16 => read_i16,
    u32 => read_u32,
    i32 => read_i32,
    u64 => read_u64,
    i64 => read_i64,
    f32 => read_f32,
    f64 => read_f64,
    bool => read_bool
);

impl Deserialize for String {
    #[inline]
    fn deserialize(is: &mut IStream) -> Self {
        is.read_str()
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize(is: &mut IStream) -> Self {
        let count = is.read_i32();

        if count < 0 {
            is.set_error();
            return Vec::new();
        }

        let mut items = Vec::new();

        for _ in 0..count {
            if is.has_error() {
                break;
            }

            items.push(T::deserialize(is));
        }

        items
    }
}

impl<K, V> Deserialize for hashbrown::HashMap<K, V>
where
    K: Deserialize + Eq + std::hash::Hash,
    V: Deserialize,
{
    fn deserialize(is: &mut IStream) -> Self {
        let count = is.read_i32();

        if count < 0 {
            is.set_error();
            return hashbrown::HashMap::new();
        }

        let mut map = hashbrown::HashMap::new();

        for _ in 0..count {
            if is.has_error() {
                break;
            }

            let key = K::deserialize(is);
            let value = V::deserialize(is);
            map.insert(key, value);
        }

        map
    }
}
