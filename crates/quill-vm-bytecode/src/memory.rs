//! Story memory image
//!
//! A single flat, big-endian byte buffer holding code, strings, objects,
//! globals and dynamic data. Every access is bounds-checked and every write
//! is reported to subscribed observers once it has fully completed.

use crate::error::{BytecodeError, Result};

/// Description of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChange {
    /// First byte written
    pub address: usize,
    /// Bytes before the write
    pub old: Vec<u8>,
    /// Bytes after the write
    pub new: Vec<u8>,
}

impl MemoryChange {
    /// Number of bytes covered by the change.
    pub fn len(&self) -> usize {
        self.new.len()
    }

    /// Whether the change covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
    }
}

/// Receives write notifications from a [`Memory`].
///
/// Observers only see the change record, never the memory itself, so they
/// cannot write back while a notification is being delivered.
pub trait MemoryObserver {
    /// Called after every write.
    fn memory_changed(&mut self, change: &MemoryChange);
}

impl<F> MemoryObserver for F
where
    F: FnMut(&MemoryChange),
{
    fn memory_changed(&mut self, change: &MemoryChange) {
        self(change)
    }
}

/// Handle returned by [`Memory::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u32);

/// Mutable memory image.
pub struct Memory {
    bytes: Vec<u8>,
    observers: Vec<(ObserverId, Box<dyn MemoryObserver>)>,
    next_observer: u32,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.bytes.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Clone for Memory {
    /// Clones the bytes only; observers stay with the original.
    fn clone(&self) -> Self {
        Self::new(self.bytes.clone())
    }
}

impl Memory {
    /// Wrap an image.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Size of the image in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw view of the whole image.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    fn check(&self, address: usize, len: usize) -> Result<()> {
        if address
            .checked_add(len)
            .is_none_or(|end| end > self.bytes.len())
        {
            return Err(BytecodeError::OutOfRange {
                address,
                len,
                size: self.bytes.len(),
            });
        }
        Ok(())
    }

    /// Read one byte.
    #[inline]
    pub fn read_byte(&self, address: usize) -> Result<u8> {
        self.check(address, 1)?;
        Ok(self.bytes[address])
    }

    /// Borrow `len` bytes.
    pub fn read_bytes(&self, address: usize, len: usize) -> Result<&[u8]> {
        self.check(address, len)?;
        Ok(&self.bytes[address..address + len])
    }

    /// Read a big-endian word.
    #[inline]
    pub fn read_word(&self, address: usize) -> Result<u16> {
        self.check(address, 2)?;
        Ok(u16::from_be_bytes([self.bytes[address], self.bytes[address + 1]]))
    }

    /// Read `count` consecutive words.
    pub fn read_words(&self, address: usize, count: usize) -> Result<Vec<u16>> {
        self.check(address, count.saturating_mul(2))?;
        Ok(self.bytes[address..address + count * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Read a big-endian double word.
    pub fn read_dword(&self, address: usize) -> Result<u32> {
        self.check(address, 4)?;
        let b = &self.bytes[address..address + 4];
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Write one byte.
    pub fn write_byte(&mut self, address: usize, value: u8) -> Result<()> {
        self.write_bytes(address, &[value])
    }

    /// Write a run of bytes.
    pub fn write_bytes(&mut self, address: usize, values: &[u8]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.check(address, values.len())?;
        let old = self.bytes[address..address + values.len()].to_vec();
        self.bytes[address..address + values.len()].copy_from_slice(values);
        self.notify(address, old, values.to_vec());
        Ok(())
    }

    /// Write a big-endian word.
    pub fn write_word(&mut self, address: usize, value: u16) -> Result<()> {
        self.write_bytes(address, &value.to_be_bytes())
    }

    /// Write consecutive words as one change.
    pub fn write_words(&mut self, address: usize, values: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.write_bytes(address, &bytes)
    }

    /// Write a big-endian double word.
    pub fn write_dword(&mut self, address: usize, value: u32) -> Result<()> {
        self.write_bytes(address, &value.to_be_bytes())
    }

    /// Replace the first `bytes.len()` bytes without notifying observers.
    ///
    /// Used when a story is restarted and the dynamic area is reloaded.
    pub fn reload(&mut self, bytes: &[u8]) -> Result<()> {
        self.check(0, bytes.len())?;
        self.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Create a reading cursor at `address`.
    pub fn reader(&self, address: usize) -> MemoryReader<'_> {
        MemoryReader {
            memory: self,
            address,
        }
    }

    /// Register a write observer.
    pub fn subscribe(&mut self, observer: Box<dyn MemoryObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer = self.next_observer.wrapping_add(1);
        self.observers.push((id, observer));
        id
    }

    /// Remove a previously registered observer.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        before != self.observers.len()
    }

    fn notify(&mut self, address: usize, old: Vec<u8>, new: Vec<u8>) {
        if self.observers.is_empty() {
            return;
        }
        let change = MemoryChange { address, old, new };
        for (_, observer) in &mut self.observers {
            observer.memory_changed(&change);
        }
    }
}

/// Sequential reader over a [`Memory`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryReader<'a> {
    memory: &'a Memory,
    address: usize,
}

impl<'a> MemoryReader<'a> {
    /// Current position.
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Move to an absolute position.
    #[inline]
    pub fn set_address(&mut self, address: usize) {
        self.address = address;
    }

    /// Underlying memory.
    pub fn memory(&self) -> &'a Memory {
        self.memory
    }

    /// Read a byte and advance.
    pub fn next_byte(&mut self) -> Result<u8> {
        let value = self.memory.read_byte(self.address)?;
        self.address += 1;
        Ok(value)
    }

    /// Read a word and advance.
    pub fn next_word(&mut self) -> Result<u16> {
        let value = self.memory.read_word(self.address)?;
        self.address += 2;
        Ok(value)
    }

    /// Read a double word and advance.
    pub fn next_dword(&mut self) -> Result<u32> {
        let value = self.memory.read_dword(self.address)?;
        self.address += 4;
        Ok(value)
    }

    /// Borrow `len` bytes and advance.
    pub fn next_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let value = self.memory.read_bytes(self.address, len)?;
        self.address += len;
        Ok(value)
    }

    /// Read `count` words and advance.
    pub fn next_words(&mut self, count: usize) -> Result<Vec<u16>> {
        let value = self.memory.read_words(self.address, count)?;
        self.address += count * 2;
        Ok(value)
    }

    /// Skip `len` bytes.
    #[inline]
    pub fn skip(&mut self, len: usize) {
        self.address += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn word_access_is_big_endian() {
        let mut memory = Memory::new(vec![0; 8]);
        memory.write_word(2, 0x1234).unwrap();
        assert_eq!(memory.read_byte(2).unwrap(), 0x12);
        assert_eq!(memory.read_byte(3).unwrap(), 0x34);
        assert_eq!(memory.read_word(2).unwrap(), 0x1234);
        memory.write_dword(4, 0xdead_beef).unwrap();
        assert_eq!(memory.read_dword(4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn reads_past_the_end_are_errors() {
        let memory = Memory::new(vec![0; 4]);
        assert!(memory.read_byte(3).is_ok());
        assert!(matches!(
            memory.read_byte(4),
            Err(BytecodeError::OutOfRange { address: 4, len: 1, .. })
        ));
        assert!(memory.read_word(3).is_err());
        assert!(memory.read_dword(1).is_err());
        assert!(memory.read_words(2, 2).is_err());
        assert!(memory.read_bytes(usize::MAX, 2).is_err());
    }

    #[test]
    fn writes_past_the_end_leave_memory_untouched() {
        let mut memory = Memory::new(vec![1, 2, 3]);
        assert!(memory.write_word(2, 0xffff).is_err());
        assert_eq!(memory.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn observers_see_old_and_new_bytes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut memory = Memory::new(vec![0xaa, 0xbb, 0xcc, 0xdd]);
        let id = memory.subscribe(Box::new(move |change: &MemoryChange| {
            sink.borrow_mut().push(change.clone());
        }));

        memory.write_word(1, 0x0102).unwrap();
        assert_eq!(
            seen.borrow()[0],
            MemoryChange {
                address: 1,
                old: vec![0xbb, 0xcc],
                new: vec![0x01, 0x02],
            }
        );

        assert!(memory.unsubscribe(id));
        memory.write_byte(0, 0).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn reader_advances() {
        let memory = Memory::new(vec![0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut reader = memory.reader(0);
        assert_eq!(reader.next_byte().unwrap(), 0x01);
        assert_eq!(reader.next_word().unwrap(), 0x0203);
        reader.skip(1);
        assert_eq!(reader.address(), 4);
        assert_eq!(reader.next_byte().unwrap(), 0x05);
        assert!(reader.next_byte().is_err());
    }
}
