use crate::heap::Heap;
use crate::opcode::Opcode;
use crate::scanner::{scan, FunctionSignature, ScanResult};
use crate::value::{self, StructTable, Value, ValueKind};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use tracing::trace;

/// Return address installed in the outermost frame; a `RET`/`RETV` against it
/// terminates the program cleanly.
pub const RETURN_SENTINEL: usize = usize::MAX;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    StrLen = 0,
    StrCat = 1,
    StrEquals = 2,
    WriteByte = 3,
    ReadByte = 4,
}

impl TryFrom<u16> for Syscall {
    type Error = anyhow::Error;

    fn try_from(id: u16) -> Result<Self> {
        Ok(match id {
            0 => Syscall::StrLen,
            1 => Syscall::StrCat,
            2 => Syscall::StrEquals,
            3 => Syscall::WriteByte,
            4 => Syscall::ReadByte,
            _ => bail!("unknown syscall id {}", id),
        })
    }
}

/// One call-stack record. Every frame owns its locals and its operand stack;
/// opcodes only ever touch the top frame's.
#[derive(Debug)]
pub struct StackFrame {
    pub locals: HashMap<u16, Value>,
    pub return_address: usize,
    pub operand_stack: Vec<Value>,
    /// Entry address of the function this frame is executing, for looking up
    /// its signature at return time.
    pub function: usize,
}

impl StackFrame {
    fn new(return_address: usize, function: usize) -> Self {
        Self {
            locals: HashMap::new(),
            return_address,
            operand_stack: Vec::new(),
            function,
        }
    }
}

pub struct VirtualMachine {
    ip: usize,
    bytecode: Vec<u8>,
    running: bool,
    call_stack: Vec<StackFrame>,
    heap: Heap,
    functions: HashMap<usize, FunctionSignature>,
    structs: StructTable,
    exit_value: Option<Value>,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("ip", &self.ip)
            .field("bytecode", &self.bytecode)
            .field("running", &self.running)
            .field("call_stack", &self.call_stack)
            .field("heap", &self.heap)
            .field("functions", &self.functions)
            .field("structs", &self.structs)
            .field("exit_value", &self.exit_value)
            .finish_non_exhaustive()
    }
}

impl VirtualMachine {
    /// Prescans the bytecode and sets up the outermost frame at `main`.
    pub fn new(bytecode: Vec<u8>) -> Result<Self> {
        Self::with_io(bytecode, Box::new(io::stdin()), Box::new(io::stdout()))
    }

    pub fn with_io(
        bytecode: Vec<u8>,
        input: Box<dyn Read>,
        output: Box<dyn Write>,
    ) -> Result<Self> {
        let ScanResult {
            functions,
            structs,
            entry,
        } = scan(&bytecode)?;
        Ok(Self {
            ip: entry,
            bytecode,
            running: true,
            call_stack: vec![StackFrame::new(RETURN_SENTINEL, entry)],
            heap: Heap::new(),
            functions,
            structs,
            exit_value: None,
            input,
            output,
        })
    }

    /// Value carried out of the program by a `RET` from the outermost frame.
    pub fn exit_value(&self) -> Option<Value> {
        self.exit_value
    }

    /// Top of the current frame's operand stack.
    pub fn stack_top(&self) -> Result<Value> {
        match self.current_frame()?.operand_stack.last() {
            Some(value) => Ok(*value),
            None => bail!("operand stack is empty"),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn run(&mut self) -> Result<()> {
        while self.running {
            let offset = self.ip;
            let opcode = Opcode::try_from(self.fetch_byte()?)
                .map_err(|error| anyhow!("{} at offset {}", error, offset))?;
            trace!(ip = offset, opcode = %opcode, depth = self.call_stack.len(), "execute");
            self.execute(opcode)
                .map_err(|error| anyhow!("{} (at offset {}, opcode {})", error, offset, opcode))?;
        }
        Ok(())
    }

    fn execute(&mut self, opcode: Opcode) -> Result<()> {
        match opcode {
            Opcode::Halt => {
                self.running = false;
            }
            Opcode::Push => {
                let kind = ValueKind::try_from(self.fetch_byte()?)?;
                let value = match kind {
                    ValueKind::Int32 => Value::Int32(self.fetch_u32()? as i32),
                    ValueKind::Float32 => Value::Float32(f32::from_bits(self.fetch_u32()?)),
                    ValueKind::Byte => Value::Byte(self.fetch_byte()?),
                    other => bail!("unsupported push immediate kind {}", other),
                };
                self.push(value)?;
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.pop()?;
                self.push(top)?;
                self.push(top)?;
            }
            Opcode::IAdd => {
                let right = self.pop()?.as_int32()?;
                let left = self.pop()?.as_int32()?;
                self.push(Value::Int32(left.wrapping_add(right)))?;
            }
            Opcode::ISub => {
                let right = self.pop()?.as_int32()?;
                let left = self.pop()?.as_int32()?;
                self.push(Value::Int32(left.wrapping_sub(right)))?;
            }
            Opcode::IMul => {
                let right = self.pop()?.as_int32()?;
                let left = self.pop()?.as_int32()?;
                self.push(Value::Int32(left.wrapping_mul(right)))?;
            }
            Opcode::IDiv => {
                let right = self.pop()?.as_int32()?;
                let left = self.pop()?.as_int32()?;
                if right == 0 {
                    bail!("division by zero");
                }
                self.push(Value::Int32(left.wrapping_div(right)))?;
            }
            Opcode::FAdd => {
                let right = self.pop()?.as_float32()?;
                let left = self.pop()?.as_float32()?;
                self.push(Value::Float32(left + right))?;
            }
            Opcode::FSub => {
                let right = self.pop()?.as_float32()?;
                let left = self.pop()?.as_float32()?;
                self.push(Value::Float32(left - right))?;
            }
            Opcode::FMul => {
                let right = self.pop()?.as_float32()?;
                let left = self.pop()?.as_float32()?;
                self.push(Value::Float32(left * right))?;
            }
            Opcode::FDiv => {
                let right = self.pop()?.as_float32()?;
                let left = self.pop()?.as_float32()?;
                if right == 0.0 {
                    bail!("division by zero");
                }
                self.push(Value::Float32(left / right))?;
            }
            Opcode::Eq => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = value::equals(first, second)?;
                self.push_bool(result)?;
            }
            Opcode::Ne => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = !value::equals(first, second)?;
                self.push_bool(result)?;
            }
            Opcode::Lt => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = value::lesser(second, first)?;
                self.push_bool(result)?;
            }
            Opcode::Le => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = value::lesser_or_equal(second, first)?;
                self.push_bool(result)?;
            }
            Opcode::Gt => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = !value::lesser(second, first)?;
                self.push_bool(result)?;
            }
            Opcode::Ge => {
                let first = self.pop()?;
                let second = self.pop()?;
                let result = value::lesser_or_equal(first, second)?;
                self.push_bool(result)?;
            }
            Opcode::Jmp => {
                let address = self.fetch_u16()? as usize;
                if address >= self.bytecode.len() {
                    bail!("invalid jump address {}", address);
                }
                self.ip = address;
            }
            Opcode::Ije | Opcode::Ijne => {
                let address = self.fetch_u16()? as usize;
                if address >= self.bytecode.len() {
                    bail!("invalid jump address {}", address);
                }
                let immediate = self.fetch_u32()? as i32;
                let top = self.pop()?.as_int32()?;
                if (top == immediate) == (opcode == Opcode::Ije) {
                    self.ip = address;
                }
            }
            Opcode::Fje | Opcode::Fjne => {
                let address = self.fetch_u16()? as usize;
                if address >= self.bytecode.len() {
                    bail!("invalid jump address {}", address);
                }
                let immediate = f32::from_bits(self.fetch_u32()?);
                let top = self.pop()?.as_float32()?;
                if (top == immediate) == (opcode == Opcode::Fje) {
                    self.ip = address;
                }
            }
            Opcode::Store => {
                let slot = self.fetch_u16()?;
                let top = self.pop()?;
                self.current_frame_mut()?.locals.insert(slot, top);
            }
            Opcode::Load => {
                let slot = self.fetch_u16()?;
                let value = match self.current_frame()?.locals.get(&slot) {
                    Some(value) => *value,
                    None => bail!("local variable at slot {} not found", slot),
                };
                self.push(value)?;
            }
            Opcode::Call => {
                let address = self.fetch_u16()? as usize;
                let signature = match self.functions.get(&address) {
                    Some(signature) => signature.clone(),
                    None => bail!("call target {} is not a function entry", address),
                };
                let mut arguments = Vec::with_capacity(signature.param_count as usize);
                for _ in 0..signature.param_count {
                    arguments.push(self.pop()?);
                }
                let mut frame = StackFrame::new(self.ip, address);
                // Arguments land in the callee in original call order.
                for argument in arguments.into_iter().rev() {
                    frame.operand_stack.push(argument);
                }
                self.call_stack.push(frame);
                self.ip = address;
            }
            Opcode::Ret => {
                let frame = match self.call_stack.pop() {
                    Some(frame) => frame,
                    None => bail!("cannot ret: call stack empty"),
                };
                let value = match frame.operand_stack.last() {
                    Some(value) => *value,
                    None => bail!("cannot ret: operand stack empty"),
                };
                if frame.return_address == RETURN_SENTINEL {
                    self.exit_value = Some(value);
                    self.running = false;
                } else {
                    self.check_return_kind(frame.function, value)?;
                    self.push(value)?;
                    self.ip = frame.return_address;
                }
            }
            Opcode::Retv => {
                let frame = match self.call_stack.pop() {
                    Some(frame) => frame,
                    None => bail!("cannot retv: call stack empty"),
                };
                if frame.return_address == RETURN_SENTINEL {
                    self.running = false;
                } else {
                    self.ip = frame.return_address;
                }
            }
            Opcode::Alloc => {
                let size = self.pop()?.as_int32()?;
                if size < 0 {
                    bail!("negative allocation size {}", size);
                }
                let handle = self.heap.allocate(size as usize)?;
                self.push(Value::Ptr(handle))?;
            }
            Opcode::Free => {
                let handle = self.pop()?.as_ptr()?;
                self.heap.free(handle)?;
            }
            Opcode::LoadH => {
                let handle = self.pop()?.as_ptr()?;
                let value = self.heap.load_value(handle)?;
                self.push(value)?;
            }
            Opcode::StoreH => {
                let value = self.pop()?;
                let handle = self.pop()?.as_ptr()?;
                self.heap.store_value(handle, value)?;
            }
            Opcode::StrAlloc => {
                let length = self.fetch_u16()? as usize;
                if self.ip + length > self.bytecode.len() {
                    bail!("unexpected end of bytecode in string literal");
                }
                let bytes = self.bytecode[self.ip..self.ip + length].to_vec();
                self.ip += length;
                let handle = self.heap.allocate_string(&bytes)?;
                self.push(Value::Ptr(handle))?;
            }
            Opcode::Syscall => {
                let id = self.fetch_u16()?;
                let syscall = Syscall::try_from(id)?;
                self.execute_syscall(syscall)?;
            }
            Opcode::NewArr => {
                let kind = ValueKind::try_from(self.fetch_byte()?)?;
                let length = self.pop()?.as_int32()?;
                let handle = self.heap.allocate_array(kind, length)?;
                self.push(Value::Ptr(handle))?;
            }
            Opcode::LdElem => {
                let index = self.pop()?.as_int32()?;
                let handle = self.pop()?.as_ptr()?;
                let value = self.heap.get_array_element(handle, index)?;
                self.push(value)?;
            }
            Opcode::StElem => {
                let value = self.pop()?;
                let index = self.pop()?.as_int32()?;
                let handle = self.pop()?.as_ptr()?;
                self.heap.set_array_element(handle, index, value)?;
            }
            Opcode::NewStruct => {
                let name = self.fetch_cstr()?;
                let (id, layout) = match self.structs.get(&name) {
                    Some(entry) => entry,
                    None => bail!("undefined struct: {}", name),
                };
                let handle = self.heap.allocate_struct(id, layout)?;
                self.push(Value::Ptr(handle))?;
            }
            Opcode::FldGet => {
                let name = self.fetch_cstr()?;
                let handle = self.pop()?.as_ptr()?;
                let id = self.heap.struct_id(handle)?;
                let layout = match self.structs.by_id(id) {
                    Some(layout) => layout,
                    None => bail!("struct id {} is not in the struct table", id),
                };
                let value = self.heap.get_struct_field(handle, layout, &name)?;
                self.push(value)?;
            }
            Opcode::StField => {
                let name = self.fetch_cstr()?;
                let value = self.pop()?;
                let handle = self.pop()?.as_ptr()?;
                let id = self.heap.struct_id(handle)?;
                let layout = match self.structs.by_id(id) {
                    Some(layout) => layout,
                    None => bail!("struct id {} is not in the struct table", id),
                };
                self.heap.set_struct_field(handle, layout, &name, value)?;
            }
            // Metadata records are inert at run time; execution just steps
            // over their operands.
            Opcode::Func => {
                self.fetch_byte()?;
                self.fetch_u16()?;
                let kind = ValueKind::try_from(self.fetch_byte()?)?;
                if kind == ValueKind::Struct {
                    self.fetch_cstr()?;
                }
            }
            Opcode::DefStruct => {
                self.fetch_cstr()?;
                let field_count = self.fetch_byte()?;
                for _ in 0..field_count {
                    self.fetch_cstr()?;
                    let kind = ValueKind::try_from(self.fetch_byte()?)?;
                    if kind == ValueKind::Array {
                        self.fetch_byte()?;
                    }
                }
            }
            Opcode::FuncNormal | Opcode::FuncMain => {
                bail!("stray function flavor byte");
            }
        }
        Ok(())
    }

    fn execute_syscall(&mut self, syscall: Syscall) -> Result<()> {
        match syscall {
            Syscall::StrLen => {
                let handle = self.pop()?.as_ptr()?;
                let bytes = self.heap.load_string(handle)?;
                self.push(Value::Int32(bytes.len() as i32))?;
            }
            Syscall::StrCat => {
                let right = self.pop()?.as_ptr()?;
                let left = self.pop()?.as_ptr()?;
                let mut bytes = self.heap.load_string(left)?;
                bytes.extend(self.heap.load_string(right)?);
                let handle = self.heap.allocate_string(&bytes)?;
                self.push(Value::Ptr(handle))?;
            }
            Syscall::StrEquals => {
                let first = self.pop()?.as_ptr()?;
                let second = self.pop()?.as_ptr()?;
                let equal = self.heap.load_string(first)? == self.heap.load_string(second)?;
                self.push_bool(equal)?;
            }
            Syscall::WriteByte => {
                let value = self.pop()?;
                let byte = match value {
                    Value::Byte(byte) => byte,
                    Value::Int32(v) => (v & 0xFF) as u8,
                    _ => bail!(
                        "write_byte expects a byte or int32 value, got {}",
                        value.kind()
                    ),
                };
                self.output.write_all(&[byte])?;
                self.output.flush()?;
            }
            Syscall::ReadByte => {
                let mut buffer = [0u8; 1];
                self.input.read_exact(&mut buffer)?;
                self.push(Value::Byte(buffer[0]))?;
            }
        }
        Ok(())
    }

    /// The returned value's kind must match the callee's declared return
    /// kind. Declared reference kinds accept a `Ptr` whose target region
    /// carries the matching tag.
    fn check_return_kind(&self, function: usize, value: Value) -> Result<()> {
        let signature = match self.functions.get(&function) {
            Some(signature) => signature,
            None => bail!("no signature recorded for function at {}", function),
        };
        let declared = signature.return_kind;
        if value.kind() == declared {
            return Ok(());
        }
        if matches!(
            declared,
            ValueKind::Struct | ValueKind::String | ValueKind::Array
        ) {
            if let Value::Ptr(handle) = value {
                let tag = self.heap.tag(handle)?;
                if tag == declared {
                    return Ok(());
                }
                bail!(
                    "return type mismatch: declared {}, returned a handle to a {} region",
                    declared,
                    tag
                );
            }
        }
        bail!(
            "return type mismatch: declared {}, returned {}",
            declared,
            value.kind()
        )
    }

    fn current_frame(&self) -> Result<&StackFrame> {
        match self.call_stack.last() {
            Some(frame) => Ok(frame),
            None => bail!("call stack empty"),
        }
    }

    fn current_frame_mut(&mut self) -> Result<&mut StackFrame> {
        match self.call_stack.last_mut() {
            Some(frame) => Ok(frame),
            None => bail!("call stack empty"),
        }
    }

    fn push(&mut self, value: Value) -> Result<()> {
        self.current_frame_mut()?.operand_stack.push(value);
        Ok(())
    }

    fn push_bool(&mut self, value: bool) -> Result<()> {
        self.push(Value::Int32(if value { 1 } else { 0 }))
    }

    fn pop(&mut self) -> Result<Value> {
        match self.current_frame_mut()?.operand_stack.pop() {
            Some(value) => Ok(value),
            None => bail!("operand stack empty"),
        }
    }

    fn fetch_byte(&mut self) -> Result<u8> {
        if self.ip >= self.bytecode.len() {
            bail!("instruction pointer ran past the end of the bytecode");
        }
        let byte = self.bytecode[self.ip];
        self.ip += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> Result<u16> {
        let high = self.fetch_byte()?;
        let low = self.fetch_byte()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn fetch_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        for byte in &mut bytes {
            *byte = self.fetch_byte()?;
        }
        Ok(u32::from_be_bytes(bytes))
    }

    fn fetch_cstr(&mut self) -> Result<String> {
        let start = self.ip;
        while self.ip < self.bytecode.len() && self.bytecode[self.ip] != 0 {
            self.ip += 1;
        }
        if self.ip >= self.bytecode.len() {
            bail!("unterminated string operand at offset {}", start);
        }
        let bytes = self.bytecode[start..self.ip].to_vec();
        self.ip += 1;
        String::from_utf8(bytes).map_err(|_| anyhow!("invalid utf-8 in string operand"))
    }
}
