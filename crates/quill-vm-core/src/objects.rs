//! Object tree and property tables
//!
//! Objects live inside the memory image; "object N" is always a fixed
//! offset from the table base. Nothing here caches object state, so every
//! accessor sees writes made through any other path.

use quill_vm_bytecode::{Header, Memory};

use crate::error::{VmError, VmResult};

/// One property record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    /// Property number
    pub number: u8,
    /// Address of the first size byte
    pub header_address: u32,
    /// Address of the payload
    pub data_address: u32,
    /// Payload length in bytes
    pub len: u16,
}

impl Property {
    /// Address of the record after this one.
    #[inline]
    pub fn next_address(&self) -> u32 {
        self.data_address + self.len as u32
    }
}

/// View over the object table of a story
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTable {
    version: u8,
    defaults: u32,
    entries: u32,
    entry_size: u32,
    count: u16,
}

impl ObjectTable {
    /// Locate the object table described by `header`.
    pub fn new(memory: &Memory, header: &Header) -> Self {
        let version = header.version;
        let (default_count, entry_size) = if version <= 3 { (31, 9) } else { (63, 14) };
        let defaults = header.object_table as u32;
        let entries = defaults + default_count * 2;
        let mut table = Self {
            version,
            defaults,
            entries,
            entry_size,
            count: 0,
        };
        if defaults != 0 {
            table.count = table.scan_count(memory);
        }
        table
    }

    /// Entries run until the lowest property table seen so far.
    fn scan_count(&self, memory: &Memory) -> u16 {
        let max = if self.version <= 3 { 255 } else { u16::MAX as u32 };
        let mut lowest = memory.len() as u32;
        let mut count = 0u32;
        while count < max {
            let entry = self.entries + count * self.entry_size;
            if entry + self.entry_size > lowest {
                break;
            }
            let Ok(properties) = memory.read_word(entry as usize + self.property_offset()) else {
                break;
            };
            if properties != 0 {
                lowest = lowest.min(properties as u32);
            }
            count += 1;
        }
        count as u16
    }

    #[inline]
    fn property_offset(&self) -> usize {
        if self.version <= 3 { 7 } else { 12 }
    }

    /// Number of objects in the table.
    #[inline]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Number of attributes per object.
    #[inline]
    pub fn attribute_count(&self) -> u16 {
        if self.version <= 3 { 32 } else { 48 }
    }

    /// Address of object `object`'s entry.
    pub fn entry_address(&self, object: u16) -> VmResult<u32> {
        if object == 0 || object > self.count {
            return Err(VmError::InvalidObject(object));
        }
        Ok(self.entries + (object as u32 - 1) * self.entry_size)
    }

    fn link(&self, memory: &Memory, object: u16, slot: u32) -> VmResult<u16> {
        let entry = self.entry_address(object)?;
        if self.version <= 3 {
            Ok(memory.read_byte((entry + 4 + slot) as usize)? as u16)
        } else {
            Ok(memory.read_word((entry + 6 + slot * 2) as usize)?)
        }
    }

    fn set_link(&self, memory: &mut Memory, object: u16, slot: u32, value: u16) -> VmResult<()> {
        let entry = self.entry_address(object)?;
        if self.version <= 3 {
            memory.write_byte((entry + 4 + slot) as usize, value as u8)?;
        } else {
            memory.write_word((entry + 6 + slot * 2) as usize, value)?;
        }
        Ok(())
    }

    /// Parent object number.
    pub fn parent(&self, memory: &Memory, object: u16) -> VmResult<u16> {
        self.link(memory, object, 0)
    }

    /// Next sibling object number.
    pub fn sibling(&self, memory: &Memory, object: u16) -> VmResult<u16> {
        self.link(memory, object, 1)
    }

    /// First child object number.
    pub fn child(&self, memory: &Memory, object: u16) -> VmResult<u16> {
        self.link(memory, object, 2)
    }

    /// Set the parent link.
    pub fn set_parent(&self, memory: &mut Memory, object: u16, value: u16) -> VmResult<()> {
        self.set_link(memory, object, 0, value)
    }

    /// Set the sibling link.
    pub fn set_sibling(&self, memory: &mut Memory, object: u16, value: u16) -> VmResult<()> {
        self.set_link(memory, object, 1, value)
    }

    /// Set the child link.
    pub fn set_child(&self, memory: &mut Memory, object: u16, value: u16) -> VmResult<()> {
        self.set_link(memory, object, 2, value)
    }

    fn attribute_location(&self, object: u16, attribute: u16) -> VmResult<(usize, u8)> {
        if attribute >= self.attribute_count() {
            return Err(VmError::InvalidAttribute(attribute));
        }
        let entry = self.entry_address(object)?;
        let byte = entry as usize + attribute as usize / 8;
        let mask = 0x80u8 >> (attribute % 8);
        Ok((byte, mask))
    }

    /// Whether `attribute` is set on `object`.
    pub fn attribute(&self, memory: &Memory, object: u16, attribute: u16) -> VmResult<bool> {
        let (byte, mask) = self.attribute_location(object, attribute)?;
        Ok(memory.read_byte(byte)? & mask != 0)
    }

    /// Set or clear `attribute` on `object`.
    pub fn set_attribute(
        &self,
        memory: &mut Memory,
        object: u16,
        attribute: u16,
        value: bool,
    ) -> VmResult<()> {
        let (byte, mask) = self.attribute_location(object, attribute)?;
        let current = memory.read_byte(byte)?;
        let updated = if value { current | mask } else { current & !mask };
        if updated != current {
            memory.write_byte(byte, updated)?;
        }
        Ok(())
    }

    /// Detach `object` from its parent, relinking the parent's child list.
    pub fn remove(&self, memory: &mut Memory, object: u16) -> VmResult<()> {
        let parent = self.parent(memory, object)?;
        if parent == 0 {
            return Ok(());
        }
        let next = self.sibling(memory, object)?;
        let first = self.child(memory, parent)?;
        if first == object {
            self.set_child(memory, parent, next)?;
        } else {
            let mut current = first;
            let mut steps = 0u32;
            while current != 0 {
                let following = self.sibling(memory, current)?;
                if following == object {
                    self.set_sibling(memory, current, next)?;
                    break;
                }
                current = following;
                steps += 1;
                if steps > self.count as u32 {
                    return Err(VmError::InvalidObject(current));
                }
            }
        }
        self.set_parent(memory, object, 0)?;
        self.set_sibling(memory, object, 0)?;
        Ok(())
    }

    /// Move `object` to be the first child of `destination`.
    ///
    /// Fails without touching the tree when `destination` is `object` or one
    /// of its descendants.
    pub fn insert(&self, memory: &mut Memory, object: u16, destination: u16) -> VmResult<()> {
        self.entry_address(object)?;
        self.entry_address(destination)?;
        let mut ancestor = destination;
        let mut steps = 0u32;
        while ancestor != 0 {
            if ancestor == object {
                return Err(VmError::InvalidObject(object));
            }
            ancestor = self.parent(memory, ancestor)?;
            steps += 1;
            if steps > self.count as u32 {
                return Err(VmError::InvalidObject(destination));
            }
        }
        self.remove(memory, object)?;
        let first = self.child(memory, destination)?;
        self.set_sibling(memory, object, first)?;
        self.set_child(memory, destination, object)?;
        self.set_parent(memory, object, destination)?;
        Ok(())
    }

    /// Address of `object`'s property table header.
    pub fn property_table(&self, memory: &Memory, object: u16) -> VmResult<u32> {
        let entry = self.entry_address(object)?;
        Ok(memory.read_word(entry as usize + self.property_offset())? as u32)
    }

    /// Address and word length of `object`'s encoded short name.
    pub fn short_name(&self, memory: &Memory, object: u16) -> VmResult<(u32, u8)> {
        let table = self.property_table(memory, object)?;
        let words = memory.read_byte(table as usize)?;
        Ok((table + 1, words))
    }

    /// Decode the property record whose size byte(s) start at `address`.
    ///
    /// Returns `None` at the terminating zero byte.
    pub fn property_at(&self, memory: &Memory, address: u32) -> VmResult<Option<Property>> {
        let size = memory.read_byte(address as usize)?;
        if size == 0 {
            return Ok(None);
        }
        let property = if self.version <= 3 {
            Property {
                number: size & 0x1f,
                header_address: address,
                data_address: address + 1,
                len: (size >> 5) as u16 + 1,
            }
        } else if size & 0x80 != 0 {
            let second = memory.read_byte(address as usize + 1)? & 0x3f;
            Property {
                number: size & 0x3f,
                header_address: address,
                data_address: address + 2,
                len: if second == 0 { 64 } else { second as u16 },
            }
        } else {
            Property {
                number: size & 0x3f,
                header_address: address,
                data_address: address + 1,
                len: if size & 0x40 != 0 { 2 } else { 1 },
            }
        };
        Ok(Some(property))
    }

    /// First property record of `object`.
    pub fn first_property(&self, memory: &Memory, object: u16) -> VmResult<Option<Property>> {
        let table = self.property_table(memory, object)?;
        let name_words = memory.read_byte(table as usize)? as u32;
        self.property_at(memory, table + 1 + name_words * 2)
    }

    /// Find `property` on `object`.
    pub fn find_property(
        &self,
        memory: &Memory,
        object: u16,
        property: u16,
    ) -> VmResult<Option<Property>> {
        let mut current = self.first_property(memory, object)?;
        while let Some(record) = current {
            if record.number as u16 == property {
                return Ok(Some(record));
            }
            if (record.number as u16) < property {
                break;
            }
            current = self.property_at(memory, record.next_address())?;
        }
        Ok(None)
    }

    /// Default value of `property`.
    pub fn default_property(&self, memory: &Memory, property: u16) -> VmResult<u16> {
        let max = if self.version <= 3 { 31 } else { 63 };
        if property == 0 || property > max {
            return Err(VmError::MissingProperty { object: 0, property });
        }
        Ok(memory.read_word((self.defaults + (property as u32 - 1) * 2) as usize)?)
    }

    /// `get_prop`: property value, or its default when absent.
    pub fn property(&self, memory: &Memory, object: u16, property: u16) -> VmResult<u16> {
        match self.find_property(memory, object, property)? {
            Some(record) if record.len == 1 => {
                Ok(memory.read_byte(record.data_address as usize)? as u16)
            }
            Some(record) => Ok(memory.read_word(record.data_address as usize)?),
            None => self.default_property(memory, property),
        }
    }

    /// `get_prop_addr`: payload address, or 0 when absent.
    pub fn property_address(&self, memory: &Memory, object: u16, property: u16) -> VmResult<u32> {
        Ok(self
            .find_property(memory, object, property)?
            .map_or(0, |record| record.data_address))
    }

    /// `get_next_prop`: number of the property after `property` (0 = first).
    pub fn next_property(&self, memory: &Memory, object: u16, property: u16) -> VmResult<u16> {
        let next = if property == 0 {
            self.first_property(memory, object)?
        } else {
            let record = self
                .find_property(memory, object, property)?
                .ok_or(VmError::MissingProperty { object, property })?;
            self.property_at(memory, record.next_address())?
        };
        Ok(next.map_or(0, |record| record.number as u16))
    }

    /// `get_prop_len`: payload length given its address (0 for address 0).
    pub fn property_length(&self, memory: &Memory, data_address: u32) -> VmResult<u16> {
        if data_address == 0 {
            return Ok(0);
        }
        let size = memory.read_byte(data_address as usize - 1)?;
        if self.version <= 3 {
            return Ok((size >> 5) as u16 + 1);
        }
        if size & 0x80 != 0 {
            let len = size & 0x3f;
            Ok(if len == 0 { 64 } else { len as u16 })
        } else if size & 0x40 != 0 {
            Ok(2)
        } else {
            Ok(1)
        }
    }

    /// `put_prop`: overwrite an existing property.
    pub fn set_property(
        &self,
        memory: &mut Memory,
        object: u16,
        property: u16,
        value: u16,
    ) -> VmResult<()> {
        let record = self
            .find_property(memory, object, property)?
            .ok_or(VmError::MissingProperty { object, property })?;
        if record.len == 1 {
            memory.write_byte(record.data_address as usize, value as u8)?;
        } else {
            memory.write_word(record.data_address as usize, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::{Assembler, ObjectEntry};

    fn object(parent: u16, sibling: u16, child: u16) -> ObjectEntry {
        ObjectEntry {
            parent,
            sibling,
            child,
            ..ObjectEntry::default()
        }
    }

    /// Objects 1..=7: 2 holds 4 -> 5 -> 6, 7 is empty.
    fn tree(version: u8) -> (Memory, ObjectTable) {
        let mut asm = Assembler::new(version);
        let mut objects = vec![
            object(0, 0, 0),
            object(0, 0, 4),
            object(0, 0, 0),
            object(2, 5, 0),
            object(2, 6, 0),
            object(2, 0, 0),
            object(0, 0, 0),
        ];
        objects[4].attributes = vec![0, 9, 31];
        objects[4].name = "lamp".to_string();
        objects[4].properties = vec![(18, vec![0x12, 0x34]), (5, vec![7]), (11, vec![1, 2, 3, 4])];
        let mut defaults = vec![0u16; 31];
        defaults[2] = 0xbeef;
        asm.object_table(&defaults, &objects);
        let memory = Memory::new(asm.finish().unwrap());
        let header = Header::read(&memory).unwrap();
        let table = ObjectTable::new(&memory, &header);
        (memory, table)
    }

    #[test]
    fn counts_objects_up_to_the_first_property_table() {
        let (_, table) = tree(3);
        assert_eq!(table.count(), 7);
        assert!(table.entry_address(0).is_err());
        assert!(table.entry_address(8).is_err());
    }

    #[test]
    fn move_relinks_both_sides() {
        for version in [3, 5] {
            let (mut memory, table) = tree(version);
            table.insert(&mut memory, 5, 7).unwrap();

            assert_eq!(table.parent(&memory, 5).unwrap(), 7);
            assert_eq!(table.child(&memory, 7).unwrap(), 5);
            assert_eq!(table.sibling(&memory, 5).unwrap(), 0);
            assert_eq!(table.child(&memory, 2).unwrap(), 4);
            assert_eq!(table.sibling(&memory, 4).unwrap(), 6);

            table.insert(&mut memory, 4, 7).unwrap();
            assert_eq!(table.child(&memory, 2).unwrap(), 6);
            assert_eq!(table.child(&memory, 7).unwrap(), 4);
            assert_eq!(table.sibling(&memory, 4).unwrap(), 5);

            table.remove(&mut memory, 6).unwrap();
            assert_eq!(table.child(&memory, 2).unwrap(), 0);
            assert_eq!(table.parent(&memory, 6).unwrap(), 0);
        }
    }

    #[test]
    fn insert_refuses_to_create_a_cycle() {
        let links = |memory: &Memory, table: &ObjectTable| -> Vec<(u16, u16, u16)> {
            (1..=7)
                .map(|n| {
                    (
                        table.parent(memory, n).unwrap(),
                        table.sibling(memory, n).unwrap(),
                        table.child(memory, n).unwrap(),
                    )
                })
                .collect()
        };

        for version in [3, 5] {
            let (mut memory, table) = tree(version);
            let before = links(&memory, &table);

            assert!(matches!(
                table.insert(&mut memory, 5, 5),
                Err(VmError::InvalidObject(5))
            ));
            assert!(matches!(
                table.insert(&mut memory, 2, 4),
                Err(VmError::InvalidObject(2))
            ));
            assert_eq!(links(&memory, &table), before);

            // 7 now sits two levels below 2.
            table.insert(&mut memory, 7, 4).unwrap();
            assert!(matches!(
                table.insert(&mut memory, 2, 7),
                Err(VmError::InvalidObject(2))
            ));
            assert_eq!(table.parent(&memory, 7).unwrap(), 4);
            assert_eq!(table.parent(&memory, 2).unwrap(), 0);
        }
    }

    #[test]
    fn attributes_use_high_bit_first() {
        let (mut memory, table) = tree(3);
        assert!(table.attribute(&memory, 5, 0).unwrap());
        assert!(table.attribute(&memory, 5, 9).unwrap());
        assert!(!table.attribute(&memory, 5, 10).unwrap());
        let entry = table.entry_address(5).unwrap() as usize;
        assert_eq!(memory.read_byte(entry).unwrap(), 0x80);
        assert_eq!(memory.read_byte(entry + 1).unwrap(), 0x40);

        table.set_attribute(&mut memory, 5, 9, false).unwrap();
        assert!(!table.attribute(&memory, 5, 9).unwrap());
        assert!(matches!(
            table.attribute(&memory, 5, 32),
            Err(VmError::InvalidAttribute(32))
        ));
        assert!(matches!(
            table.attribute(&memory, 0, 1),
            Err(VmError::InvalidObject(0))
        ));
    }

    #[test]
    fn property_walk() {
        for version in [3, 5] {
            let (mut memory, table) = tree(version);
            assert_eq!(table.property(&memory, 5, 18).unwrap(), 0x1234);
            assert_eq!(table.property(&memory, 5, 5).unwrap(), 7);
            assert_eq!(table.property(&memory, 5, 3).unwrap(), 0xbeef);
            assert_eq!(table.next_property(&memory, 5, 0).unwrap(), 18);
            assert_eq!(table.next_property(&memory, 5, 18).unwrap(), 11);
            assert_eq!(table.next_property(&memory, 5, 5).unwrap(), 0);
            assert!(table.next_property(&memory, 5, 6).is_err());

            let address = table.property_address(&memory, 5, 11).unwrap();
            assert_eq!(table.property_length(&memory, address).unwrap(), 4);
            assert_eq!(table.property_address(&memory, 5, 12).unwrap(), 0);
            assert_eq!(table.property_length(&memory, 0).unwrap(), 0);

            table.set_property(&mut memory, 5, 5, 0x0199).unwrap();
            assert_eq!(table.property(&memory, 5, 5).unwrap(), 0x99);
            assert!(table.set_property(&mut memory, 5, 6, 1).is_err());

            let (_, words) = table.short_name(&memory, 5).unwrap();
            assert_eq!(words, 2);
        }
    }

    #[test]
    fn long_property_length_zero_means_64() {
        let mut asm = Assembler::new(5);
        let mut lamp = object(0, 0, 0);
        lamp.properties = vec![(20, vec![0xaa; 64]), (3, vec![1, 2, 3])];
        asm.object_table(&[], &[lamp]);
        let memory = Memory::new(asm.finish().unwrap());
        let table = ObjectTable::new(&memory, &Header::read(&memory).unwrap());

        let first = table.first_property(&memory, 1).unwrap().unwrap();
        assert_eq!(first.number, 20);
        assert_eq!(first.len, 64);
        assert_eq!(table.property_length(&memory, first.data_address).unwrap(), 64);
        assert_eq!(table.next_property(&memory, 1, 20).unwrap(), 3);
        assert_eq!(table.next_property(&memory, 1, 3).unwrap(), 0);
    }
}
