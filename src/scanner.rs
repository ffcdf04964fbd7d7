use crate::opcode::Opcode;
use crate::value::{StructTable, StructType, ValueKind};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    /// Byte address of the first body instruction.
    pub entry: usize,
    pub param_count: u16,
    pub return_kind: ValueKind,
    /// Struct name when `return_kind` is `Struct`.
    pub return_struct: Option<String>,
    pub is_main: bool,
}

/// Tables materialized by the prescan: every function keyed by its entry
/// address, every struct layout, and the address execution starts at.
#[derive(Debug)]
pub struct ScanResult {
    pub functions: HashMap<usize, FunctionSignature>,
    pub structs: StructTable,
    /// Entry address of `main`.
    pub entry: usize,
}

/// Walks the bytecode once before execution, decoding every instruction's
/// operand width so `FUNC` headers and `DEFSTRUCT` records are found without
/// misreading operand bytes as opcodes. Exactly one `MAIN`-flavored function
/// must exist and it must return void.
pub fn scan(bytecode: &[u8]) -> Result<ScanResult> {
    let mut cursor = Cursor::new(bytecode);
    let mut functions = HashMap::new();
    let mut structs = StructTable::new();
    let mut main_entry: Option<usize> = None;

    while !cursor.at_end() {
        let offset = cursor.position;
        let opcode = Opcode::try_from(cursor.read_byte()?)
            .map_err(|error| anyhow!("{} at offset {}", error, offset))?;
        match opcode {
            Opcode::DefStruct => {
                let struct_def = read_struct_def(&mut cursor)?;
                debug!(name = %struct_def.name, size = struct_def.size, "scanned struct");
                structs.insert(struct_def)?;
            }
            Opcode::Func => {
                let flavor = cursor.read_byte()?;
                let is_main = if flavor == Opcode::FuncMain as u8 {
                    true
                } else if flavor == Opcode::FuncNormal as u8 {
                    false
                } else {
                    bail!("invalid function flavor byte 0x{:02x} at offset {}", flavor, offset);
                };
                let param_count = cursor.read_u16()?;
                let return_kind = ValueKind::try_from(cursor.read_byte()?)?;
                let return_struct = if return_kind == ValueKind::Struct {
                    Some(cursor.read_cstr()?)
                } else {
                    None
                };
                let entry = cursor.position;
                if is_main {
                    if return_kind != ValueKind::Void {
                        bail!("main must return void, found {}", return_kind);
                    }
                    if main_entry.replace(entry).is_some() {
                        bail!("multiple main functions defined");
                    }
                }
                debug!(entry, param_count, %return_kind, is_main, "scanned function");
                functions.insert(
                    entry,
                    FunctionSignature {
                        entry,
                        param_count,
                        return_kind,
                        return_struct,
                        is_main,
                    },
                );
            }
            Opcode::FuncNormal | Opcode::FuncMain => {
                bail!("stray function flavor byte at offset {}", offset);
            }
            other => skip_operands(&mut cursor, other)?,
        }
    }

    let entry = match main_entry {
        Some(entry) => entry,
        None => bail!("no main function defined"),
    };
    Ok(ScanResult {
        functions,
        structs,
        entry,
    })
}

fn read_struct_def(cursor: &mut Cursor) -> Result<StructType> {
    let name = cursor.read_cstr()?;
    let field_count = cursor.read_byte()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let field_name = cursor.read_cstr()?;
        let kind = ValueKind::try_from(cursor.read_byte()?)?;
        let element_kind = if kind == ValueKind::Array {
            Some(ValueKind::try_from(cursor.read_byte()?)?)
        } else {
            None
        };
        fields.push((field_name, kind, element_kind));
    }
    Ok(StructType::new(name, fields))
}

fn skip_operands(cursor: &mut Cursor, opcode: Opcode) -> Result<()> {
    match opcode {
        Opcode::Push => {
            let kind = ValueKind::try_from(cursor.read_byte()?)?;
            match kind {
                ValueKind::Byte => cursor.skip(1)?,
                ValueKind::Int32 | ValueKind::Float32 => cursor.skip(4)?,
                other => bail!("invalid push immediate kind {}", other),
            }
        }
        Opcode::Store | Opcode::Load | Opcode::Jmp | Opcode::Call | Opcode::Syscall => {
            cursor.skip(2)?;
        }
        Opcode::Ije | Opcode::Ijne | Opcode::Fje | Opcode::Fjne => cursor.skip(6)?,
        Opcode::StrAlloc => {
            let length = cursor.read_u16()?;
            cursor.skip(length as usize)?;
        }
        Opcode::NewArr => cursor.skip(1)?,
        Opcode::NewStruct | Opcode::FldGet | Opcode::StField => {
            cursor.read_cstr()?;
        }
        _ => {}
    }
    Ok(())
}

struct Cursor<'a> {
    bytecode: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytecode: &'a [u8]) -> Self {
        Self {
            bytecode,
            position: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.position >= self.bytecode.len()
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.at_end() {
            bail!("unexpected end of bytecode at offset {}", self.position);
        }
        let byte = self.bytecode[self.position];
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let high = self.read_byte()?;
        let low = self.read_byte()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn skip(&mut self, count: usize) -> Result<()> {
        if self.position + count > self.bytecode.len() {
            bail!("unexpected end of bytecode at offset {}", self.position);
        }
        self.position += count;
        Ok(())
    }

    fn read_cstr(&mut self) -> Result<String> {
        let start = self.position;
        while self.position < self.bytecode.len() && self.bytecode[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.bytecode.len() {
            bail!("unterminated string starting at offset {}", start);
        }
        let bytes = &self.bytecode[start..self.position];
        self.position += 1;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| anyhow!("invalid utf-8 in string at offset {}", start))
    }
}
