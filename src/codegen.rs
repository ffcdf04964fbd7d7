use crate::lexer::Token;
use crate::opcode::Opcode;
use crate::parser::{Instruction, ParsedFunction, Program};
use crate::value::{StructTable, StructType, ValueKind};
use crate::vm::Syscall;
use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::debug;

/// Byte addresses of a function's body and of each instruction within it,
/// fixed before any code is emitted so labels and forward calls resolve.
struct FunctionLayout {
    body_address: usize,
    /// Offset of instruction `i` relative to the body start; the final entry
    /// is the body size, so a label bound past the last instruction resolves
    /// to the first byte after the body.
    offsets: Vec<usize>,
}

/// Translates a parsed [`Program`] into bytecode: the `DEFSTRUCT` prelude,
/// then every function as a `FUNC` header plus its body, then a terminal
/// `HALT`. Errors are collected across the whole program and reported
/// together.
pub struct CodeGenerator<'a> {
    program: &'a Program,
    bytecode: Vec<u8>,
    function_table: HashMap<String, usize>,
    struct_table: StructTable,
    errors: Vec<String>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            bytecode: Vec::new(),
            function_table: HashMap::new(),
            struct_table: StructTable::new(),
            errors: Vec::new(),
        }
    }

    /// Body address of each generated function, by name.
    pub fn function_table(&self) -> &HashMap<String, usize> {
        &self.function_table
    }

    pub fn struct_table(&self) -> &StructTable {
        &self.struct_table
    }

    pub fn generate(&mut self) -> Result<Vec<u8>> {
        let program = self.program;
        for struct_def in &program.structs {
            if let Err(error) = self.struct_table.insert(struct_def.clone()) {
                self.errors.push(error.to_string());
            }
        }

        let layouts = self.lay_out_functions();

        for struct_def in &program.structs {
            self.emit_struct_def(struct_def);
        }
        for (function, layout) in program.functions.iter().zip(&layouts) {
            self.emit_function_header(function);
            debug!(
                function = %function.name,
                body = layout.body_address,
                instructions = function.body.len(),
                "generating function"
            );
            for (index, instruction) in function.body.iter().enumerate() {
                if let Err(error) = self.emit_instruction(function, layout, instruction) {
                    self.errors
                        .push(format!("line {}: {}", instruction.span.line, error));
                }
                debug!(
                    opcode = %instruction.opcode,
                    address = layout.body_address + layout.offsets[index],
                    "emitted instruction"
                );
            }
        }
        self.emit_byte(Opcode::Halt as u8);

        if !self.errors.is_empty() {
            bail!(
                "assembly failed with {} error(s):\n  {}",
                self.errors.len(),
                self.errors.join("\n  ")
            );
        }
        Ok(std::mem::take(&mut self.bytecode))
    }

    /// Assigns every function its header and body address and computes each
    /// instruction's byte offset. All operand widths are known before
    /// emission, which is what lets labels become absolute byte addresses
    /// and lets `call` reference functions defined later.
    fn lay_out_functions(&mut self) -> Vec<FunctionLayout> {
        let program = self.program;
        let mut address: usize = program.structs.iter().map(struct_def_size).sum();
        let mut layouts = Vec::with_capacity(program.functions.len());
        for function in &program.functions {
            let header = function_header_size(function);
            let body_address = address + header;
            if self
                .function_table
                .insert(function.name.clone(), body_address)
                .is_some()
            {
                self.errors
                    .push(format!("duplicate function definition: {}", function.name));
            }
            let mut offsets = Vec::with_capacity(function.body.len() + 1);
            let mut offset = 0;
            for instruction in &function.body {
                offsets.push(offset);
                offset += instruction_size(instruction);
            }
            offsets.push(offset);
            debug!(
                function = %function.name,
                header = address,
                body = body_address,
                size = offset,
                "function layout"
            );
            address = body_address + offset;
            layouts.push(FunctionLayout {
                body_address,
                offsets,
            });
        }
        layouts
    }

    fn emit_struct_def(&mut self, struct_def: &StructType) {
        self.emit_byte(Opcode::DefStruct as u8);
        self.emit_cstr(&struct_def.name);
        if struct_def.fields.len() > u8::MAX as usize {
            self.errors.push(format!(
                "struct {} has {} fields, the limit is {}",
                struct_def.name,
                struct_def.fields.len(),
                u8::MAX
            ));
            return;
        }
        self.emit_byte(struct_def.fields.len() as u8);
        for field in &struct_def.fields {
            self.emit_cstr(&field.name);
            self.emit_byte(field.kind as u8);
            if let Some(element_kind) = field.element_kind {
                self.emit_byte(element_kind as u8);
            }
        }
    }

    fn emit_function_header(&mut self, function: &ParsedFunction) {
        self.emit_byte(Opcode::Func as u8);
        if function.name == "main" {
            self.emit_byte(Opcode::FuncMain as u8);
        } else {
            self.emit_byte(Opcode::FuncNormal as u8);
        }
        self.emit_u16(function.params.len() as u16);
        self.emit_byte(function.return_kind as u8);
        if function.return_kind == ValueKind::Struct {
            let name = function.return_struct.clone().unwrap_or_default();
            if self.struct_table.get(&name).is_none() {
                self.errors.push(format!(
                    "undefined struct return type: {} in function {}",
                    name, function.name
                ));
            }
            self.emit_cstr(&name);
        }
    }

    fn emit_instruction(
        &mut self,
        function: &ParsedFunction,
        layout: &FunctionLayout,
        instruction: &Instruction,
    ) -> Result<()> {
        self.emit_byte(instruction.opcode as u8);
        match instruction.opcode {
            Opcode::Push => {
                let value = &instruction.operands[1];
                match &instruction.operands[0] {
                    Token::Int32Type => {
                        self.emit_byte(ValueKind::Int32 as u8);
                        match value {
                            Token::Int(v) => self.emit_i32(*v),
                            other => {
                                bail!("push int32 requires an integer literal, got {}", other)
                            }
                        }
                    }
                    Token::Float32Type => {
                        self.emit_byte(ValueKind::Float32 as u8);
                        match value {
                            Token::Float(v) => self.emit_f32(*v),
                            Token::Int(v) => self.emit_f32(*v as f32),
                            other => bail!("push float32 requires a numeric literal, got {}", other),
                        }
                    }
                    Token::ByteType => {
                        self.emit_byte(ValueKind::Byte as u8);
                        match value {
                            Token::Int(v) if (0..=255).contains(v) => self.emit_byte(*v as u8),
                            Token::Int(v) => bail!("byte literal out of range: {}", v),
                            other => bail!("push byte requires an integer literal, got {}", other),
                        }
                    }
                    other => bail!("unsupported type in push: {}", other),
                }
            }
            Opcode::Store | Opcode::Load => {
                let slot = match &instruction.operands[0] {
                    Token::Int(v) => *v,
                    other => bail!("{} requires an integer slot, got {}", instruction.opcode, other),
                };
                if !(0..=u16::MAX as i32).contains(&slot) {
                    bail!("local slot {} out of range", slot);
                }
                self.emit_u16(slot as u16);
            }
            Opcode::Jmp | Opcode::Ije | Opcode::Ijne | Opcode::Fje | Opcode::Fjne => {
                let label = match &instruction.operands[0] {
                    Token::Ident(label) => label,
                    other => bail!("{} requires a label, got {}", instruction.opcode, other),
                };
                let index = match function.labels.get(label) {
                    Some(index) => *index,
                    None => bail!("undefined label: {}", label),
                };
                let address = layout.body_address + layout.offsets[index];
                if address > u16::MAX as usize {
                    bail!("jump target {} is out of range", address);
                }
                self.emit_u16(address as u16);
                match instruction.opcode {
                    Opcode::Jmp => {}
                    Opcode::Ije | Opcode::Ijne => match &instruction.operands[1] {
                        Token::Int(v) => self.emit_i32(*v),
                        _ => bail!("{} requires an integer immediate", instruction.opcode),
                    },
                    _ => match &instruction.operands[1] {
                        Token::Float(v) => self.emit_f32(*v),
                        Token::Int(v) => self.emit_f32(*v as f32),
                        other => {
                            bail!("{} requires a float immediate, got {}", instruction.opcode, other)
                        }
                    },
                }
            }
            Opcode::Call => {
                let name = match &instruction.operands[0] {
                    Token::Ident(name) => name,
                    other => bail!("call requires a function name, got {}", other),
                };
                let address = match self.function_table.get(name) {
                    Some(address) => *address,
                    None => bail!("undefined function: {}", name),
                };
                if address > u16::MAX as usize {
                    bail!("function address {} is out of range", address);
                }
                self.emit_u16(address as u16);
            }
            Opcode::StrAlloc => {
                let literal = match &instruction.operands[0] {
                    Token::Str(literal) => literal.clone(),
                    other => bail!("stralloc requires a string literal, got {}", other),
                };
                if literal.len() > u16::MAX as usize {
                    bail!("string literal of {} bytes is too long", literal.len());
                }
                self.emit_u16(literal.len() as u16);
                self.bytecode.extend_from_slice(literal.as_bytes());
            }
            Opcode::Syscall => {
                let id = match &instruction.operands[0] {
                    Token::StrLen => Syscall::StrLen as u16,
                    Token::StrCat => Syscall::StrCat as u16,
                    Token::StrEquals => Syscall::StrEquals as u16,
                    Token::WriteByte => Syscall::WriteByte as u16,
                    Token::ReadByte => Syscall::ReadByte as u16,
                    Token::Int(id) if (0..=u16::MAX as i32).contains(id) => *id as u16,
                    Token::Int(id) => bail!("syscall id {} out of range", id),
                    other => bail!("syscall requires an id, got {}", other),
                };
                self.emit_u16(id);
            }
            Opcode::NewArr => {
                let kind = match &instruction.operands[0] {
                    Token::Int32Type => ValueKind::Int32,
                    Token::Float32Type => ValueKind::Float32,
                    Token::ByteType => ValueKind::Byte,
                    Token::StringType => ValueKind::String,
                    other => bail!("unsupported element type in newarr: {}", other),
                };
                self.emit_byte(kind as u8);
            }
            Opcode::NewStruct => {
                let name = match &instruction.operands[0] {
                    Token::Ident(name) => name.clone(),
                    other => bail!("newstruct requires a struct name, got {}", other),
                };
                if self.struct_table.get(&name).is_none() {
                    bail!("undefined struct: {}", name);
                }
                self.emit_cstr(&name);
            }
            Opcode::StField | Opcode::FldGet => {
                let name = match &instruction.operands[0] {
                    Token::Str(name) => name.clone(),
                    other => bail!("{} requires a field name, got {}", instruction.opcode, other),
                };
                self.emit_cstr(&name);
            }
            // Bare opcodes carry no operands.
            _ => {}
        }
        Ok(())
    }

    fn emit_byte(&mut self, byte: u8) {
        self.bytecode.push(byte);
    }

    fn emit_u16(&mut self, value: u16) {
        self.bytecode.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.bytecode.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_f32(&mut self, value: f32) {
        self.bytecode.extend_from_slice(&value.to_bits().to_be_bytes());
    }

    /// Null-terminated string operand.
    fn emit_cstr(&mut self, value: &str) {
        self.bytecode.extend_from_slice(value.as_bytes());
        self.emit_byte(0);
    }
}

fn struct_def_size(struct_def: &StructType) -> usize {
    let mut size = 1 + struct_def.name.len() + 1 + 1;
    for field in &struct_def.fields {
        size += field.name.len() + 1 + 1;
        if field.element_kind.is_some() {
            size += 1;
        }
    }
    size
}

fn function_header_size(function: &ParsedFunction) -> usize {
    let mut size = 5;
    if function.return_kind == ValueKind::Struct {
        size += function.return_struct.as_deref().unwrap_or_default().len() + 1;
    }
    size
}

fn instruction_size(instruction: &Instruction) -> usize {
    match instruction.opcode {
        Opcode::Push => {
            if instruction.operands[0] == Token::ByteType {
                3
            } else {
                6
            }
        }
        Opcode::Store | Opcode::Load | Opcode::Jmp | Opcode::Call | Opcode::Syscall => 3,
        Opcode::Ije | Opcode::Ijne | Opcode::Fje | Opcode::Fjne => 7,
        Opcode::StrAlloc => match &instruction.operands[0] {
            Token::Str(literal) => 3 + literal.len(),
            _ => 3,
        },
        Opcode::NewArr => 2,
        Opcode::NewStruct | Opcode::StField | Opcode::FldGet => {
            match &instruction.operands[0] {
                Token::Ident(name) | Token::Str(name) => 2 + name.len(),
                _ => 2,
            }
        }
        _ => 1,
    }
}
