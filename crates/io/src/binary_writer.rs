//! Binary writer for producing the on-disk bytecode stream.

use crate::error::IoResult;

/// A writer that appends binary data to a growable buffer.
///
/// Integers are written little-endian, mirroring [`crate::MemoryReader`].
#[derive(Default)]
pub struct BinaryWriter {
    buffer: Vec<u8>,
}

impl BinaryWriter {
    /// Creates a new binary writer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Creates a new binary writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Returns the length of the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes a single byte.
    pub fn write_byte(&mut self, value: u8) -> IoResult<()> {
        self.buffer.push(value);
        Ok(())
    }

    /// Writes a 32-bit signed integer, little-endian.
    pub fn write_i32(&mut self, value: i32) -> IoResult<()> {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes a 32-bit unsigned integer, little-endian.
    pub fn write_u32(&mut self, value: u32) -> IoResult<()> {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes a 64-bit IEEE-754 double, little-endian.
    pub fn write_f64(&mut self, value: f64) -> IoResult<()> {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> IoResult<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Consumes the writer and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Returns the written bytes without consuming the writer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryReader;

    #[test]
    fn test_round_trip() {
        let mut writer = BinaryWriter::new();
        writer.write_byte(9).unwrap();
        writer.write_i32(-40).unwrap();
        writer.write_f64(2.25).unwrap();
        writer.write_bytes(b"lox").unwrap();

        let mut reader = MemoryReader::new(writer.as_bytes());
        assert_eq!(reader.read_byte().unwrap(), 9);
        assert_eq!(reader.read_i32().unwrap(), -40);
        assert_eq!(reader.read_f64().unwrap(), 2.25);
        assert_eq!(reader.read_bytes(3).unwrap(), b"lox");
    }
}
