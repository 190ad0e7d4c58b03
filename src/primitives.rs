use byteorder::ByteOrder;

use std::mem::size_of;

/// Fixed-width scalars as they are laid out on the wire.
pub(crate) trait Primitive: Sized + Copy {
    const CODE: u8;
    const ALIGNMENT: usize;
    const SIZE: usize;

    fn put<B: ByteOrder>(self, out: &mut [u8]);
    fn get<B: ByteOrder>(buf: &[u8]) -> Self;
}

macro_rules! basic_primitive {
    ($type:ident, $sig:expr, $write:ident, $read:ident) => {
        impl Primitive for $type {
            const CODE: u8 = $sig as u8;
            const ALIGNMENT: usize = size_of::<$type>();
            const SIZE: usize = size_of::<$type>();

            fn put<B: ByteOrder>(self, out: &mut [u8]) {
                B::$write(out, self);
            }

            fn get<B: ByteOrder>(buf: &[u8]) -> Self {
                B::$read(buf)
            }
        }
    };
}

basic_primitive!(f64, 'd', write_f64, read_f64);
basic_primitive!(i16, 'n', write_i16, read_i16);
basic_primitive!(u16, 'q', write_u16, read_u16);
basic_primitive!(i32, 'i', write_i32, read_i32);
basic_primitive!(u32, 'u', write_u32, read_u32);
basic_primitive!(i64, 'x', write_i64, read_i64);
basic_primitive!(u64, 't', write_u64, read_u64);

impl Primitive for u8 {
    const CODE: u8 = b'y';
    const ALIGNMENT: usize = 1;
    const SIZE: usize = 1;

    fn put<B: ByteOrder>(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn get<B: ByteOrder>(buf: &[u8]) -> Self {
        buf[0]
    }
}
