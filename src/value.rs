use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// Handle into the VM heap. Never a machine address.
pub type HeapRef = u32;

/// Wire discriminants for value kinds. These bytes appear in `PUSH` operands,
/// heap region tags, array element descriptors, and `FUNC`/`DEFSTRUCT`
/// headers, so the numbering is part of the bytecode format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int32 = 0,
    Float32 = 1,
    Ptr = 2,
    String = 3,
    Array = 4,
    Void = 5,
    Struct = 6,
    Byte = 7,
}

impl ValueKind {
    /// Width in bytes of one slot of this kind inside an array or struct
    /// payload. Reference kinds store a handle.
    pub fn slot_size(self) -> usize {
        match self {
            ValueKind::Int32 | ValueKind::Float32 => 4,
            ValueKind::Ptr | ValueKind::String | ValueKind::Array | ValueKind::Struct => 4,
            ValueKind::Byte => 1,
            ValueKind::Void => 0,
        }
    }
}

impl TryFrom<u8> for ValueKind {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => ValueKind::Int32,
            1 => ValueKind::Float32,
            2 => ValueKind::Ptr,
            3 => ValueKind::String,
            4 => ValueKind::Array,
            5 => ValueKind::Void,
            6 => ValueKind::Struct,
            7 => ValueKind::Byte,
            _ => bail!("unknown value kind byte 0x{:02x}", byte),
        })
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Int32 => "int32",
            ValueKind::Float32 => "float32",
            ValueKind::Ptr => "ptr",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Void => "void",
            ValueKind::Struct => "struct",
            ValueKind::Byte => "byte",
        };
        write!(f, "{}", name)
    }
}

/// A tagged slot. Every operand-stack entry, local, and heap scalar is one of
/// these. Reference values carry a heap handle; the region's own tag byte
/// says whether the handle points at a string, array, or struct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int32(i32),
    Float32(f32),
    Byte(u8),
    Ptr(HeapRef),
}

impl Value {
    pub fn kind(self) -> ValueKind {
        match self {
            Value::Int32(_) => ValueKind::Int32,
            Value::Float32(_) => ValueKind::Float32,
            Value::Byte(_) => ValueKind::Byte,
            Value::Ptr(_) => ValueKind::Ptr,
        }
    }

    pub fn as_int32(self) -> Result<i32> {
        match self {
            Value::Int32(v) => Ok(v),
            _ => bail!("value is not int32, it is {}", self.kind()),
        }
    }

    pub fn as_float32(self) -> Result<f32> {
        match self {
            Value::Float32(v) => Ok(v),
            _ => bail!("value is not float32, it is {}", self.kind()),
        }
    }

    pub fn as_byte(self) -> Result<u8> {
        match self {
            Value::Byte(v) => Ok(v),
            _ => bail!("value is not byte, it is {}", self.kind()),
        }
    }

    pub fn as_ptr(self) -> Result<HeapRef> {
        match self {
            Value::Ptr(v) => Ok(v),
            _ => bail!("value is not ptr, it is {}", self.kind()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Ptr(v) => write!(f, "heap@{}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float32(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Byte(value)
    }
}

/// Equality over numeric values. Both operands must share a kind, and only
/// the numeric kinds compare.
pub fn equals(left: Value, right: Value) -> Result<bool> {
    if left.kind() != right.kind() {
        bail!(
            "type mismatch for comparison: {} vs {}",
            left.kind(),
            right.kind()
        );
    }
    match (left, right) {
        (Value::Int32(l), Value::Int32(r)) => Ok(l == r),
        (Value::Float32(l), Value::Float32(r)) => Ok(l == r),
        _ => bail!("unsupported kind {} for comparison", left.kind()),
    }
}

pub fn lesser(left: Value, right: Value) -> Result<bool> {
    if left.kind() != right.kind() {
        bail!(
            "type mismatch for comparison: {} vs {}",
            left.kind(),
            right.kind()
        );
    }
    match (left, right) {
        (Value::Int32(l), Value::Int32(r)) => Ok(l < r),
        (Value::Float32(l), Value::Float32(r)) => Ok(l < r),
        _ => bail!("unsupported kind {} for comparison", left.kind()),
    }
}

pub fn lesser_or_equal(left: Value, right: Value) -> Result<bool> {
    if left.kind() != right.kind() {
        bail!(
            "type mismatch for comparison: {} vs {}",
            left.kind(),
            right.kind()
        );
    }
    match (left, right) {
        (Value::Int32(l), Value::Int32(r)) => Ok(l <= r),
        (Value::Float32(l), Value::Float32(r)) => Ok(l <= r),
        _ => bail!("unsupported kind {} for comparison", left.kind()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub kind: ValueKind,
    /// Byte offset within the struct payload.
    pub offset: u32,
    /// Element kind when `kind` is `Array`.
    pub element_kind: Option<ValueKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
    /// Total payload size in bytes.
    pub size: u32,
    /// Method name -> code address. Reserved; nothing populates it yet.
    pub methods: HashMap<String, u32>,
}

impl StructType {
    /// Builds a struct layout, assigning each field the running byte offset.
    pub fn new(name: impl Into<String>, fields: Vec<(String, ValueKind, Option<ValueKind>)>) -> Self {
        let mut offset = 0u32;
        let fields = fields
            .into_iter()
            .map(|(name, kind, element_kind)| {
                let field = StructField {
                    name,
                    kind,
                    offset,
                    element_kind,
                };
                offset += kind.slot_size() as u32;
                field
            })
            .collect();
        Self {
            name: name.into(),
            fields,
            size: offset,
            methods: HashMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

impl Display for StructType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "struct {} {{", self.name)?;
        for field in &self.fields {
            match field.element_kind {
                Some(element) => {
                    writeln!(f, "  {}: {}[] (offset: {})", field.name, element, field.offset)?
                }
                None => writeln!(f, "  {}: {} (offset: {})", field.name, field.kind, field.offset)?,
            }
        }
        writeln!(f, "  size: {} bytes", self.size)?;
        write!(f, "}}")
    }
}

/// Struct layouts in definition order. The position of a struct in the table
/// is its id, which heap struct allocations embed.
#[derive(Debug, Clone, Default)]
pub struct StructTable {
    types: Vec<StructType>,
    by_name: HashMap<String, u32>,
}

impl StructTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, struct_type: StructType) -> Result<u32> {
        if self.by_name.contains_key(&struct_type.name) {
            bail!("duplicate struct definition: {}", struct_type.name);
        }
        let id = self.types.len() as u32;
        self.by_name.insert(struct_type.name.clone(), id);
        self.types.push(struct_type);
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<(u32, &StructType)> {
        let id = *self.by_name.get(name)?;
        Some((id, &self.types[id as usize]))
    }

    pub fn by_id(&self, id: u32) -> Option<&StructType> {
        self.types.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructType> {
        self.types.iter()
    }
}
