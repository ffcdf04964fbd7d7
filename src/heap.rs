use crate::value::{HeapRef, StructType, Value, ValueKind};
use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::trace;

pub const PAGE_SIZE: usize = 4096;

// Region layouts: byte 0 is always the kind tag.
const SCALAR_PAYLOAD: usize = 1; // tag | payload
const STRING_PAYLOAD: usize = 5; // tag | i32 length | bytes
const ARRAY_HEADER: usize = 6; // tag | element kind | i32 length | slots
const STRUCT_HEADER: usize = 5; // tag | u32 struct id | field payload

/// Arena heap. Every allocation is an owned, page-rounded byte buffer keyed
/// by a monotonically increasing handle; handles of freed regions are never
/// reissued, so a stale `Ptr` can never alias a later allocation.
#[derive(Debug, Default)]
pub struct Heap {
    regions: HashMap<HeapRef, Vec<u8>>,
    next_handle: HeapRef,
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Heap {
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Allocates a zeroed region of at least `size` bytes, rounded up to
    /// whole pages.
    pub fn allocate(&mut self, size: usize) -> Result<HeapRef> {
        if size == 0 {
            bail!("cannot allocate zero bytes");
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.regions.insert(handle, vec![0; pages * PAGE_SIZE]);
        trace!(handle, size, pages, "heap allocate");
        Ok(handle)
    }

    pub fn free(&mut self, handle: HeapRef) -> Result<()> {
        trace!(handle, "heap free");
        if self.regions.remove(&handle).is_none() {
            bail!("failed to free memory at handle {}", handle);
        }
        Ok(())
    }

    pub fn contains(&self, handle: HeapRef) -> bool {
        self.regions.contains_key(&handle)
    }

    fn region(&self, handle: HeapRef) -> Result<&[u8]> {
        match self.regions.get(&handle) {
            Some(region) => Ok(region),
            None => bail!("invalid memory handle {}", handle),
        }
    }

    fn region_mut(&mut self, handle: HeapRef) -> Result<&mut Vec<u8>> {
        match self.regions.get_mut(&handle) {
            Some(region) => Ok(region),
            None => bail!("invalid memory handle {}", handle),
        }
    }

    /// Kind tag of a live region.
    pub fn tag(&self, handle: HeapRef) -> Result<ValueKind> {
        ValueKind::try_from(self.region(handle)?[0])
    }

    /// Writes a scalar value: the kind tag at offset 0, the payload after it.
    pub fn store_value(&mut self, handle: HeapRef, value: Value) -> Result<()> {
        let region = self.region_mut(handle)?;
        let required = SCALAR_PAYLOAD + value.kind().slot_size();
        if region.len() < required {
            bail!(
                "store of {} bytes exceeds allocation of {} bytes",
                required,
                region.len()
            );
        }
        region[0] = value.kind() as u8;
        match value {
            Value::Int32(v) => region[1..5].copy_from_slice(&v.to_be_bytes()),
            Value::Float32(v) => region[1..5].copy_from_slice(&v.to_bits().to_be_bytes()),
            Value::Ptr(v) => region[1..5].copy_from_slice(&v.to_be_bytes()),
            Value::Byte(v) => region[1] = v,
        }
        Ok(())
    }

    /// Reads back a scalar written by [`store_value`](Self::store_value).
    pub fn load_value(&self, handle: HeapRef) -> Result<Value> {
        let region = self.region(handle)?;
        let kind = ValueKind::try_from(region[0])?;
        let required = SCALAR_PAYLOAD + kind.slot_size();
        if region.len() < required {
            bail!("memory access out of bounds");
        }
        match kind {
            ValueKind::Int32 => Ok(Value::Int32(read_i32(&region[1..5]))),
            ValueKind::Float32 => Ok(Value::Float32(f32::from_bits(read_u32(&region[1..5])))),
            ValueKind::Ptr => Ok(Value::Ptr(read_u32(&region[1..5]))),
            ValueKind::Byte => Ok(Value::Byte(region[1])),
            _ => bail!("region holds {}, not a scalar", kind),
        }
    }

    pub fn allocate_string(&mut self, bytes: &[u8]) -> Result<HeapRef> {
        if bytes.len() > i32::MAX as usize {
            bail!("string of {} bytes is too long", bytes.len());
        }
        let handle = self.allocate(STRING_PAYLOAD + bytes.len())?;
        let region = self.region_mut(handle)?;
        region[0] = ValueKind::String as u8;
        region[1..5].copy_from_slice(&(bytes.len() as i32).to_be_bytes());
        region[STRING_PAYLOAD..STRING_PAYLOAD + bytes.len()].copy_from_slice(bytes);
        Ok(handle)
    }

    pub fn load_string(&self, handle: HeapRef) -> Result<Vec<u8>> {
        let region = self.region(handle)?;
        if ValueKind::try_from(region[0])? != ValueKind::String {
            bail!("region at handle {} is not a string", handle);
        }
        let length = read_i32(&region[1..5]);
        if length < 0 || region.len() < STRING_PAYLOAD + length as usize {
            bail!("memory access out of bounds");
        }
        Ok(region[STRING_PAYLOAD..STRING_PAYLOAD + length as usize].to_vec())
    }

    pub fn allocate_array(&mut self, element_kind: ValueKind, length: i32) -> Result<HeapRef> {
        if length < 0 {
            bail!("negative array length {}", length);
        }
        let width = element_width(element_kind)?;
        let handle = self.allocate(ARRAY_HEADER + length as usize * width)?;
        let region = self.region_mut(handle)?;
        region[0] = ValueKind::Array as u8;
        region[1] = element_kind as u8;
        region[2..6].copy_from_slice(&length.to_be_bytes());
        Ok(handle)
    }

    fn array_meta(&self, handle: HeapRef) -> Result<(ValueKind, i32)> {
        let region = self.region(handle)?;
        if ValueKind::try_from(region[0])? != ValueKind::Array {
            bail!("region at handle {} is not an array", handle);
        }
        Ok((ValueKind::try_from(region[1])?, read_i32(&region[2..6])))
    }

    pub fn array_length(&self, handle: HeapRef) -> Result<i32> {
        Ok(self.array_meta(handle)?.1)
    }

    pub fn get_array_element(&self, handle: HeapRef, index: i32) -> Result<Value> {
        let (element_kind, length) = self.array_meta(handle)?;
        if index < 0 || index >= length {
            bail!("array index {} out of bounds for length {}", index, length);
        }
        let width = element_width(element_kind)?;
        let offset = ARRAY_HEADER + index as usize * width;
        self.read_slot(self.region(handle)?, offset, element_kind)
    }

    pub fn set_array_element(&mut self, handle: HeapRef, index: i32, value: Value) -> Result<()> {
        let (element_kind, length) = self.array_meta(handle)?;
        if index < 0 || index >= length {
            bail!("array index {} out of bounds for length {}", index, length);
        }
        self.check_slot_kind(element_kind, value)?;
        let width = element_width(element_kind)?;
        let offset = ARRAY_HEADER + index as usize * width;
        write_slot(self.region_mut(handle)?, offset, value);
        Ok(())
    }

    /// Allocates a struct region: the `Struct` tag, the table id of its
    /// layout, and a zeroed field payload.
    pub fn allocate_struct(&mut self, id: u32, layout: &StructType) -> Result<HeapRef> {
        let handle = self.allocate(STRUCT_HEADER + layout.size as usize)?;
        let region = self.region_mut(handle)?;
        region[0] = ValueKind::Struct as u8;
        region[1..5].copy_from_slice(&id.to_be_bytes());
        Ok(handle)
    }

    /// Struct-table id embedded in a struct region.
    pub fn struct_id(&self, handle: HeapRef) -> Result<u32> {
        let region = self.region(handle)?;
        if ValueKind::try_from(region[0])? != ValueKind::Struct {
            bail!("region at handle {} is not a struct", handle);
        }
        Ok(read_u32(&region[1..5]))
    }

    pub fn get_struct_field(
        &self,
        handle: HeapRef,
        layout: &StructType,
        name: &str,
    ) -> Result<Value> {
        self.struct_id(handle)?;
        let field = match layout.field(name) {
            Some(field) => field,
            None => bail!("struct {} has no field named {}", layout.name, name),
        };
        let offset = STRUCT_HEADER + field.offset as usize;
        self.read_slot(self.region(handle)?, offset, field.kind)
    }

    pub fn set_struct_field(
        &mut self,
        handle: HeapRef,
        layout: &StructType,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.struct_id(handle)?;
        let field = match layout.field(name) {
            Some(field) => field,
            None => bail!("struct {} has no field named {}", layout.name, name),
        };
        self.check_slot_kind(field.kind, value)?;
        let offset = STRUCT_HEADER + field.offset as usize;
        write_slot(self.region_mut(handle)?, offset, value);
        Ok(())
    }

    fn read_slot(&self, region: &[u8], offset: usize, kind: ValueKind) -> Result<Value> {
        let width = element_width(kind)?;
        if region.len() < offset + width {
            bail!("memory access out of bounds");
        }
        match kind {
            ValueKind::Int32 => Ok(Value::Int32(read_i32(&region[offset..offset + 4]))),
            ValueKind::Float32 => Ok(Value::Float32(f32::from_bits(read_u32(
                &region[offset..offset + 4],
            )))),
            ValueKind::Byte => Ok(Value::Byte(region[offset])),
            ValueKind::Ptr | ValueKind::String | ValueKind::Array | ValueKind::Struct => {
                Ok(Value::Ptr(read_u32(&region[offset..offset + 4])))
            }
            ValueKind::Void => bail!("cannot read a void slot"),
        }
    }

    /// A slot declared with a scalar kind takes exactly that kind. Reference
    /// slots take a `Ptr`; for string/array/struct slots the pointed-to
    /// region's tag must agree with the declared kind.
    fn check_slot_kind(&self, declared: ValueKind, value: Value) -> Result<()> {
        match declared {
            ValueKind::Int32 | ValueKind::Float32 | ValueKind::Byte => {
                if value.kind() != declared {
                    bail!("expected {} value, got {}", declared, value.kind());
                }
            }
            ValueKind::Ptr => {
                value.as_ptr()?;
            }
            ValueKind::String | ValueKind::Array | ValueKind::Struct => {
                let target = value.as_ptr()?;
                let tag = self.tag(target)?;
                if tag != declared {
                    bail!(
                        "handle {} refers to a {} region, expected {}",
                        target,
                        tag,
                        declared
                    );
                }
            }
            ValueKind::Void => bail!("cannot store into a void slot"),
        }
        Ok(())
    }
}

fn element_width(kind: ValueKind) -> Result<usize> {
    match kind {
        ValueKind::Void => bail!("void has no storage width"),
        _ => Ok(kind.slot_size()),
    }
}

fn write_slot(region: &mut [u8], offset: usize, value: Value) {
    match value {
        Value::Int32(v) => region[offset..offset + 4].copy_from_slice(&v.to_be_bytes()),
        Value::Float32(v) => region[offset..offset + 4].copy_from_slice(&v.to_bits().to_be_bytes()),
        Value::Ptr(v) => region[offset..offset + 4].copy_from_slice(&v.to_be_bytes()),
        Value::Byte(v) => region[offset] = v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate(8)?;
        for value in [
            Value::Int32(-123),
            Value::Float32(2.5),
            Value::Byte(200),
            Value::Ptr(77),
        ] {
            heap.store_value(handle, value)?;
            assert_eq!(heap.load_value(handle)?, value);
        }
        Ok(())
    }

    #[test]
    fn test_allocation_rounds_to_pages() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate(1)?;
        heap.store_value(handle, Value::Int32(1))?;
        let big = heap.allocate(PAGE_SIZE + 1)?;
        assert_ne!(handle, big);
        assert!(heap.allocate(0).is_err());
        Ok(())
    }

    #[test]
    fn test_handles_are_unique_and_stay_dead() -> Result<()> {
        let mut heap = Heap::new();
        let first = heap.allocate(4)?;
        heap.free(first)?;
        let second = heap.allocate(4)?;
        assert_ne!(first, second);
        assert!(!heap.contains(first));
        assert!(heap.contains(second));
        assert!(heap.load_value(first).is_err());
        assert!(heap.store_value(first, Value::Int32(1)).is_err());
        assert!(heap.free(first).is_err());
        Ok(())
    }

    #[test]
    fn test_free_unknown_handle() {
        let mut heap = Heap::new();
        assert!(heap.free(42).is_err());
    }

    #[test]
    fn test_string_roundtrip() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate_string(b"hello world")?;
        assert_eq!(heap.load_string(handle)?, b"hello world");
        let empty = heap.allocate_string(b"")?;
        assert_eq!(heap.load_string(empty)?, b"");
        Ok(())
    }

    #[test]
    fn test_load_string_checks_tag() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate(8)?;
        heap.store_value(handle, Value::Int32(5))?;
        assert!(heap.load_string(handle).is_err());
        Ok(())
    }

    #[test]
    fn test_array_roundtrip() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate_array(ValueKind::Int32, 3)?;
        assert_eq!(heap.array_length(handle)?, 3);
        // Fresh slots are zeroed.
        assert_eq!(heap.get_array_element(handle, 1)?, Value::Int32(0));
        heap.set_array_element(handle, 1, Value::Int32(7))?;
        assert_eq!(heap.get_array_element(handle, 0)?, Value::Int32(0));
        assert_eq!(heap.get_array_element(handle, 1)?, Value::Int32(7));
        assert_eq!(heap.get_array_element(handle, 2)?, Value::Int32(0));
        Ok(())
    }

    #[test]
    fn test_byte_array_elements_are_one_byte() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate_array(ValueKind::Byte, 4)?;
        heap.set_array_element(handle, 0, Value::Byte(0xAA))?;
        heap.set_array_element(handle, 1, Value::Byte(0xBB))?;
        assert_eq!(heap.get_array_element(handle, 0)?, Value::Byte(0xAA));
        assert_eq!(heap.get_array_element(handle, 1)?, Value::Byte(0xBB));
        Ok(())
    }

    #[test]
    fn test_array_bounds() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate_array(ValueKind::Int32, 2)?;
        assert!(heap.get_array_element(handle, -1).is_err());
        assert!(heap.get_array_element(handle, 2).is_err());
        assert!(heap.set_array_element(handle, 2, Value::Int32(1)).is_err());
        assert!(heap.allocate_array(ValueKind::Int32, -1).is_err());
        Ok(())
    }

    #[test]
    fn test_array_element_kind_enforced() -> Result<()> {
        let mut heap = Heap::new();
        let handle = heap.allocate_array(ValueKind::Int32, 2)?;
        assert!(heap.set_array_element(handle, 0, Value::Float32(1.0)).is_err());
        // A failed store leaves the slot untouched.
        assert_eq!(heap.get_array_element(handle, 0)?, Value::Int32(0));
        Ok(())
    }

    #[test]
    fn test_string_array_holds_verified_handles() -> Result<()> {
        let mut heap = Heap::new();
        let strings = heap.allocate_array(ValueKind::String, 2)?;
        let hello = heap.allocate_string(b"hello")?;
        heap.set_array_element(strings, 0, Value::Ptr(hello))?;
        assert_eq!(heap.get_array_element(strings, 0)?, Value::Ptr(hello));

        // A non-string region is rejected for a string slot.
        let scalar = heap.allocate(8)?;
        heap.store_value(scalar, Value::Int32(1))?;
        assert!(heap
            .set_array_element(strings, 1, Value::Ptr(scalar))
            .is_err());
        Ok(())
    }

    fn point_layout() -> StructType {
        StructType::new(
            "Point",
            vec![
                ("x".to_string(), ValueKind::Int32, None),
                ("y".to_string(), ValueKind::Int32, None),
                ("label".to_string(), ValueKind::String, None),
            ],
        )
    }

    #[test]
    fn test_struct_field_roundtrip() -> Result<()> {
        let mut heap = Heap::new();
        let layout = point_layout();
        let handle = heap.allocate_struct(0, &layout)?;
        assert_eq!(heap.struct_id(handle)?, 0);

        heap.set_struct_field(handle, &layout, "x", Value::Int32(42))?;
        heap.set_struct_field(handle, &layout, "y", Value::Int32(-1))?;
        assert_eq!(heap.get_struct_field(handle, &layout, "x")?, Value::Int32(42));
        assert_eq!(heap.get_struct_field(handle, &layout, "y")?, Value::Int32(-1));

        // Writing one field does not disturb its neighbor.
        heap.set_struct_field(handle, &layout, "x", Value::Int32(7))?;
        assert_eq!(heap.get_struct_field(handle, &layout, "y")?, Value::Int32(-1));
        Ok(())
    }

    #[test]
    fn test_struct_string_field() -> Result<()> {
        let mut heap = Heap::new();
        let layout = point_layout();
        let handle = heap.allocate_struct(0, &layout)?;
        let name = heap.allocate_string(b"origin")?;
        heap.set_struct_field(handle, &layout, "label", Value::Ptr(name))?;
        assert_eq!(
            heap.get_struct_field(handle, &layout, "label")?,
            Value::Ptr(name)
        );
        Ok(())
    }

    #[test]
    fn test_struct_unknown_field() -> Result<()> {
        let mut heap = Heap::new();
        let layout = point_layout();
        let handle = heap.allocate_struct(0, &layout)?;
        assert!(heap.get_struct_field(handle, &layout, "z").is_err());
        assert!(heap
            .set_struct_field(handle, &layout, "z", Value::Int32(0))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_struct_field_kind_enforced() -> Result<()> {
        let mut heap = Heap::new();
        let layout = point_layout();
        let handle = heap.allocate_struct(0, &layout)?;
        assert!(heap
            .set_struct_field(handle, &layout, "x", Value::Float32(1.0))
            .is_err());
        assert!(heap
            .set_struct_field(handle, &layout, "label", Value::Int32(3))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_struct_ops_reject_non_struct_region() -> Result<()> {
        let mut heap = Heap::new();
        let layout = point_layout();
        let handle = heap.allocate_string(b"not a struct")?;
        assert!(heap.struct_id(handle).is_err());
        assert!(heap.get_struct_field(handle, &layout, "x").is_err());
        Ok(())
    }

    #[test]
    fn test_scalar_load_rejects_record_regions() -> Result<()> {
        let mut heap = Heap::new();
        let string = heap.allocate_string(b"abc")?;
        let array = heap.allocate_array(ValueKind::Int32, 1)?;
        assert!(heap.load_value(string).is_err());
        assert!(heap.load_value(array).is_err());
        Ok(())
    }
}
