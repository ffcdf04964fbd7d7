mod codegen;
mod heap;
mod lexer;
mod opcode;
mod parser;
mod scanner;
mod value;
mod vm;

pub use self::{
    codegen::*, heap::*, lexer::*, opcode::*, parser::*, scanner::*, value::*, vm::*,
};
