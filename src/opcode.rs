use anyhow::{bail, Result};
use std::fmt::{self, Display, Formatter};

/// One-byte opcodes. The discriminants are the wire encoding; `FuncNormal`
/// and `FuncMain` double as the flavor byte inside a `FUNC` header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Halt = 0,
    Push,
    Pop,
    IAdd,
    ISub,
    IMul,
    IDiv,
    FAdd,
    FSub,
    FMul,
    FDiv,
    Jmp,
    Ijne,
    Ije,
    Fjne,
    Fje,
    Eq,
    Ne,
    Lt,
    Gt,
    Ge,
    Le,
    Load,
    Store,
    Call,
    Ret,
    Retv,
    Alloc,
    Free,
    LoadH,
    StoreH,
    Dup,
    StrAlloc,
    Syscall,
    NewArr,
    LdElem,
    StElem,
    Func,
    FuncNormal,
    FuncMain,
    DefStruct,
    NewStruct,
    FldGet,
    StField,
}

const OPCODES: [Opcode; 44] = [
    Opcode::Halt,
    Opcode::Push,
    Opcode::Pop,
    Opcode::IAdd,
    Opcode::ISub,
    Opcode::IMul,
    Opcode::IDiv,
    Opcode::FAdd,
    Opcode::FSub,
    Opcode::FMul,
    Opcode::FDiv,
    Opcode::Jmp,
    Opcode::Ijne,
    Opcode::Ije,
    Opcode::Fjne,
    Opcode::Fje,
    Opcode::Eq,
    Opcode::Ne,
    Opcode::Lt,
    Opcode::Gt,
    Opcode::Ge,
    Opcode::Le,
    Opcode::Load,
    Opcode::Store,
    Opcode::Call,
    Opcode::Ret,
    Opcode::Retv,
    Opcode::Alloc,
    Opcode::Free,
    Opcode::LoadH,
    Opcode::StoreH,
    Opcode::Dup,
    Opcode::StrAlloc,
    Opcode::Syscall,
    Opcode::NewArr,
    Opcode::LdElem,
    Opcode::StElem,
    Opcode::Func,
    Opcode::FuncNormal,
    Opcode::FuncMain,
    Opcode::DefStruct,
    Opcode::NewStruct,
    Opcode::FldGet,
    Opcode::StField,
];

impl TryFrom<u8> for Opcode {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self> {
        match OPCODES.get(byte as usize) {
            Some(opcode) => Ok(*opcode),
            None => bail!("unknown opcode 0x{:02x}", byte),
        }
    }
}

impl Opcode {
    /// Assembly mnemonic. The metadata opcodes have no source form and use
    /// uppercase placeholder names.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Halt => "halt",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::IAdd => "iadd",
            Opcode::ISub => "isub",
            Opcode::IMul => "imul",
            Opcode::IDiv => "idiv",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::Jmp => "jmp",
            Opcode::Ijne => "ijne",
            Opcode::Ije => "ije",
            Opcode::Fjne => "fjne",
            Opcode::Fje => "fje",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Lt => "lt",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Le => "le",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Retv => "retv",
            Opcode::Alloc => "alloc",
            Opcode::Free => "free",
            Opcode::LoadH => "loadh",
            Opcode::StoreH => "storeh",
            Opcode::Dup => "dup",
            Opcode::StrAlloc => "stralloc",
            Opcode::Syscall => "syscall",
            Opcode::NewArr => "newarr",
            Opcode::LdElem => "ldelem",
            Opcode::StElem => "stelem",
            Opcode::Func => "FUNC",
            Opcode::FuncNormal => "FUNC_NORMAL",
            Opcode::FuncMain => "FUNC_MAIN",
            Opcode::DefStruct => "DEFSTRUCT",
            Opcode::NewStruct => "newstruct",
            Opcode::FldGet => "fldget",
            Opcode::StField => "stfield",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() -> Result<()> {
        for byte in 0..OPCODES.len() as u8 {
            let opcode = Opcode::try_from(byte)?;
            assert_eq!(opcode as u8, byte);
        }
        Ok(())
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(Opcode::try_from(44).is_err());
        assert!(Opcode::try_from(0xff).is_err());
    }

    #[test]
    fn test_wire_discriminants_are_stable() {
        assert_eq!(Opcode::Halt as u8, 0);
        assert_eq!(Opcode::Push as u8, 1);
        assert_eq!(Opcode::Jmp as u8, 11);
        assert_eq!(Opcode::Ret as u8, 25);
        assert_eq!(Opcode::StrAlloc as u8, 32);
        assert_eq!(Opcode::Func as u8, 37);
        assert_eq!(Opcode::FuncMain as u8, 39);
        assert_eq!(Opcode::StField as u8, 43);
    }
}
