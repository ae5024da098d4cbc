//! Bounds-checked reader over an in-memory byte buffer.

use crate::error::{IoError, IoResult};

/// A reader for consuming binary data from memory.
///
/// All reads are bounds-checked; integers are little-endian.
pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryReader {
    /// Creates a new reader over the given data.
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            pos: 0,
        }
    }

    /// Gets the current position in the reader.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Gets the length of the underlying data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the underlying data is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true if every byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Sets the position in the reader.
    pub fn set_position(&mut self, position: usize) -> IoResult<()> {
        if position > self.data.len() {
            return Err(IoError::StreamPosition {
                position,
                size: self.data.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn ensure(&self, amount: usize, context: &str) -> IoResult<()> {
        if self.pos + amount > self.data.len() {
            return Err(IoError::end_of_stream(
                self.pos + amount - self.data.len(),
                context,
            ));
        }
        Ok(())
    }

    /// Peeks at the next byte without advancing the position.
    pub fn peek(&self) -> IoResult<u8> {
        self.ensure(1, "peek")?;
        Ok(self.data[self.pos])
    }

    /// Reads a single byte.
    pub fn read_byte(&mut self) -> IoResult<u8> {
        self.ensure(1, "byte")?;
        let result = self.data[self.pos];
        self.pos += 1;
        Ok(result)
    }

    /// Reads a 32-bit signed integer, little-endian.
    pub fn read_i32(&mut self) -> IoResult<i32> {
        self.ensure(4, "i32")?;
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .expect("slice length checked");
        self.pos += 4;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Reads a 32-bit unsigned integer, little-endian.
    pub fn read_u32(&mut self) -> IoResult<u32> {
        self.ensure(4, "u32")?;
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .expect("slice length checked");
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Reads a 64-bit IEEE-754 double, little-endian.
    pub fn read_f64(&mut self) -> IoResult<f64> {
        self.ensure(8, "f64")?;
        let bytes: [u8; 8] = self.data[self.pos..self.pos + 8]
            .try_into()
            .expect("slice length checked");
        self.pos += 8;
        Ok(f64::from_le_bytes(bytes))
    }

    /// Reads exactly `count` bytes.
    pub fn read_bytes(&mut self, count: usize) -> IoResult<Vec<u8>> {
        self.ensure(count, "bytes")?;
        let result = self.data[self.pos..self.pos + count].to_vec();
        self.pos += count;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_scalars() {
        let mut data = Vec::new();
        data.push(0x2a);
        data.extend_from_slice(&7i32.to_le_bytes());
        data.extend_from_slice(&1.5f64.to_le_bytes());

        let mut reader = MemoryReader::new(&data);
        assert_eq!(reader.read_byte().unwrap(), 0x2a);
        assert_eq!(reader.read_i32().unwrap(), 7);
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert!(reader.at_end());
    }

    #[test]
    fn test_read_past_end() {
        let mut reader = MemoryReader::new(&[1, 2]);
        assert!(reader.read_i32().is_err());
        // Position is unchanged after a failed read.
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_set_position() {
        let mut reader = MemoryReader::new(&[1, 2, 3]);
        reader.set_position(2).unwrap();
        assert_eq!(reader.read_byte().unwrap(), 3);
        assert!(reader.set_position(9).is_err());
    }
}
