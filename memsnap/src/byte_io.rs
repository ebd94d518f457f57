use std::io::{self, Read, Seek, Write};


pub trait ByteRead {
    fn read_u8(&mut self) -> Result<u8, io::Error>;
    fn read_u32(&mut self) -> Result<u32, io::Error>;
    fn read_u64(&mut self) -> Result<u64, io::Error>;
    fn read_i64(&mut self) -> Result<i64, io::Error>;
}

pub trait ByteWrite {
    fn write_u8(&mut self, value: u8) -> Result<(), io::Error>;
    fn write_u32(&mut self, value: u32) -> Result<(), io::Error>;
    fn write_u64(&mut self, value: u64) -> Result<(), io::Error>;
    fn write_i64(&mut self, value: i64) -> Result<(), io::Error>;
}


pub trait ReadFromBytes {
    type Error;
    fn read_from_bytes<R: ByteRead>(reader: &mut R) -> Result<Self, Self::Error> where Self: Sized;
}


pub trait WriteToBytes {
    type Error;
    fn write_to_bytes<W: ByteWrite>(&self, writer: &mut W) -> Result<(), Self::Error>;
}

macro_rules! impl_read_write_primitive {
    ($type:ty, $read_func:ident, $write_func:ident) => {
        impl ReadFromBytes for $type {
            type Error = std::io::Error;
            fn read_from_bytes<R: ByteRead>(reader: &mut R) -> Result<Self, Self::Error> {
                let value = reader.$read_func()?;
                Ok(value)
            }
        }

        impl WriteToBytes for $type {
            type Error = std::io::Error;
            fn write_to_bytes<W: ByteWrite>(&self, writer: &mut W) -> Result<(), Self::Error> {
                writer.$write_func(*self)
            }
        }
    };
}
impl_read_write_primitive!(u8, read_u8, write_u8);
impl_read_write_primitive!(u32, read_u32, write_u32);
impl_read_write_primitive!(u64, read_u64, write_u64);
impl_read_write_primitive!(i64, read_i64, write_i64);


impl<T: ReadFromBytes, const N: usize> ReadFromBytes for [T; N] {
    type Error = <T as ReadFromBytes>::Error;
    fn read_from_bytes<R: ByteRead>(reader: &mut R) -> Result<Self, Self::Error> where Self: Sized {
        let mut vector: Vec<T> = Vec::with_capacity(N);
        for _ in 0..N {
            let value = ReadFromBytes::read_from_bytes(reader)?;
            vector.push(value);
        }
        match vector.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!(),
        }
    }
}

impl<T: WriteToBytes, const N: usize> WriteToBytes for [T; N] {
    type Error = <T as WriteToBytes>::Error;
    fn write_to_bytes<W: ByteWrite>(&self, writer: &mut W) -> Result<(), Self::Error> {
        for value in self {
            WriteToBytes::write_to_bytes(value, writer)?;
        }
        Ok(())
    }
}

macro_rules! endian_read {
    ($wrapper:ident, $conv:ident) => {
        pub struct $wrapper<R: Read> {
            reader: R,
        }
        impl<R: Read> $wrapper<R> {
            pub fn new(reader: R) -> Self {
                Self {
                    reader,
                }
            }
        }
        impl<R: Read> Read for $wrapper<R> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.reader.read(buf)
            }

            fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
                self.reader.read_exact(buf)
            }
        }
        impl<R: Read> ByteRead for $wrapper<R> {
            endian_read!(@func $conv, read_u8, u8);
            endian_read!(@func $conv, read_u32, u32);
            endian_read!(@func $conv, read_u64, u64);
            endian_read!(@func $conv, read_i64, i64);
        }
        impl<R: Read + Seek> Seek for $wrapper<R> {
            fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
                self.reader.seek(pos)
            }
        }
    };
    (@func $conv:ident, $func:ident, $type:ty) => {
        fn $func(&mut self) -> Result<$type, io::Error> {
            let mut buf = [0u8; (<$type>::BITS / 8) as usize];
            self.reader.read_exact(&mut buf)?;
            Ok(<$type>::$conv(buf))
        }
    };
}

// The QEMU migration stream, the .meta sidecar and the overlay file are
// big-endian; the libvirt wrapper header is little-endian.
endian_read!(BigEndianRead, from_be_bytes);
endian_read!(LittleEndianRead, from_le_bytes);

macro_rules! endian_write {
    ($wrapper:ident, $conv:ident) => {
        pub struct $wrapper<W: Write> {
            writer: W,
        }
        impl<W: Write> $wrapper<W> {
            pub fn new(writer: W) -> Self {
                Self {
                    writer,
                }
            }
        }
        impl<W: Write> Write for $wrapper<W> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.writer.write(buf)
            }

            fn flush(&mut self) -> io::Result<()> {
                self.writer.flush()
            }
        }
        impl<W: Write> ByteWrite for $wrapper<W> {
            endian_write!(@func $conv, write_u8, u8);
            endian_write!(@func $conv, write_u32, u32);
            endian_write!(@func $conv, write_u64, u64);
            endian_write!(@func $conv, write_i64, i64);
        }
    };
    (@func $conv:ident, $func:ident, $type:ty) => {
        fn $func(&mut self, value: $type) -> Result<(), io::Error> {
            let buf = value.$conv();
            self.writer.write_all(&buf)
        }
    };
}

endian_write!(BigEndianWrite, to_be_bytes);
endian_write!(LittleEndianWrite, to_le_bytes);
