use crate::lexer::{Span, Spanned, Token};
use crate::opcode::Opcode;
use crate::value::{StructType, ValueKind};
use anyhow::{bail, Result};
use std::collections::HashMap;

/// Parsed assembly source: struct definitions and functions, in source order.
#[derive(Debug, Default)]
pub struct Program {
    pub structs: Vec<StructType>,
    pub functions: Vec<ParsedFunction>,
}

#[derive(Debug)]
pub struct ParsedFunction {
    pub name: String,
    pub params: Vec<ParsedParam>,
    pub return_kind: ValueKind,
    /// Struct name when `return_kind` is `Struct`.
    pub return_struct: Option<String>,
    pub body: Vec<Instruction>,
    /// Label name -> index of the instruction it points at. A label bound
    /// after the last instruction maps to `body.len()`.
    pub labels: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedParam {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Token>,
    /// Location of the mnemonic, kept for error reporting.
    pub span: Span,
}

fn type_kind(token: &Token) -> Option<ValueKind> {
    match token {
        Token::Int32Type => Some(ValueKind::Int32),
        Token::Float32Type => Some(ValueKind::Float32),
        Token::StringType => Some(ValueKind::String),
        Token::ByteType => Some(ValueKind::Byte),
        _ => None,
    }
}

fn token_opcode(token: &Token) -> Option<Opcode> {
    Some(match token {
        Token::Halt => Opcode::Halt,
        Token::Syscall => Opcode::Syscall,
        Token::Push => Opcode::Push,
        Token::Pop => Opcode::Pop,
        Token::Dup => Opcode::Dup,
        Token::Store => Opcode::Store,
        Token::Load => Opcode::Load,
        Token::Alloc => Opcode::Alloc,
        Token::Free => Opcode::Free,
        Token::LoadH => Opcode::LoadH,
        Token::StoreH => Opcode::StoreH,
        Token::IAdd => Opcode::IAdd,
        Token::ISub => Opcode::ISub,
        Token::IMul => Opcode::IMul,
        Token::IDiv => Opcode::IDiv,
        Token::FAdd => Opcode::FAdd,
        Token::FSub => Opcode::FSub,
        Token::FMul => Opcode::FMul,
        Token::FDiv => Opcode::FDiv,
        Token::Eq => Opcode::Eq,
        Token::Ne => Opcode::Ne,
        Token::Lt => Opcode::Lt,
        Token::Le => Opcode::Le,
        Token::Gt => Opcode::Gt,
        Token::Ge => Opcode::Ge,
        Token::Jmp => Opcode::Jmp,
        Token::Ije => Opcode::Ije,
        Token::Ijne => Opcode::Ijne,
        Token::Fje => Opcode::Fje,
        Token::Fjne => Opcode::Fjne,
        Token::Call => Opcode::Call,
        Token::Ret => Opcode::Ret,
        Token::Retv => Opcode::Retv,
        Token::NewArr => Opcode::NewArr,
        Token::LdElem => Opcode::LdElem,
        Token::StElem => Opcode::StElem,
        Token::StrAlloc => Opcode::StrAlloc,
        Token::NewStruct => Opcode::NewStruct,
        Token::FldGet => Opcode::FldGet,
        Token::StField => Opcode::StField,
        _ => return None,
    })
}

/// Recursive-descent parser over the lexed token stream. Errors are
/// accumulated so one pass reports every problem in the source; a non-empty
/// error list turns into a single composite failure at the end.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    errors: Vec<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    /// Peeks the current token without consuming it.
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|spanned| &spanned.token)
    }

    /// Peeks one past the current token without consuming anything.
    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|spanned| &spanned.token)
    }

    /// Consumes the current token and returns it by value.
    fn next_token(&mut self) -> Token {
        let token = self
            .tokens
            .get(self.pos)
            .map(|spanned| spanned.token.clone())
            .unwrap_or(Token::Eof);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    /// Span of the current token, falling back to the last token at EOF.
    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|spanned| spanned.span)
            .unwrap_or(Span { line: 1, col: 1 })
    }

    fn error_at(&mut self, span: Span, message: String) {
        self.errors.push(format!("line {}: {}", span.line, message));
    }

    /// Skips forward to the next plausible definition start after a failed
    /// struct or function parse.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                None
                | Some(
                    Token::Struct
                    | Token::Func
                    | Token::SectionText
                    | Token::SectionStructs
                    | Token::Eof,
                ) => return,
                _ => {
                    self.next_token();
                }
            }
        }
    }

    pub fn parse(&mut self) -> Result<Program> {
        let mut program = Program::default();
        loop {
            match self.peek() {
                None | Some(Token::Eof) => break,
                Some(Token::SectionStructs) => {
                    self.next_token();
                    while matches!(self.peek(), Some(Token::Struct)) {
                        match self.parse_struct_def() {
                            Some(struct_def) => program.structs.push(struct_def),
                            None => self.synchronize(),
                        }
                    }
                }
                Some(Token::SectionText) => {
                    self.next_token();
                    while matches!(self.peek(), Some(Token::Func)) {
                        match self.parse_function() {
                            Some(function) => program.functions.push(function),
                            None => self.synchronize(),
                        }
                    }
                }
                _ => {
                    self.next_token();
                }
            }
        }
        if !self.errors.is_empty() {
            bail!(
                "parsing failed with {} error(s):\n  {}",
                self.errors.len(),
                self.errors.join("\n  ")
            );
        }
        Ok(program)
    }

    fn parse_struct_def(&mut self) -> Option<StructType> {
        let span = self.span();
        self.next_token(); // consume 'struct'

        let name = match self.next_token() {
            Token::Ident(name) => name,
            other => {
                self.error_at(span, format!("expected struct name, got {}", other));
                return None;
            }
        };
        if self.next_token() != Token::LBrace {
            self.error_at(span, format!("expected {{ after struct {}", name));
            return None;
        }

        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.next_token();
                    break;
                }
                None | Some(Token::Eof) => {
                    self.error_at(self.span(), format!("expected }} in struct {}", name));
                    return None;
                }
                _ => {}
            }
            let field_span = self.span();
            let field_name = match self.next_token() {
                Token::Ident(field_name) => field_name,
                other => {
                    self.error_at(field_span, format!("expected field name, got {}", other));
                    return None;
                }
            };
            if self.next_token() != Token::Colon {
                self.error_at(field_span, format!("expected : after field {}", field_name));
                return None;
            }
            let type_token = self.next_token();
            let base_kind = match type_kind(&type_token) {
                Some(kind) => kind,
                None => {
                    self.error_at(field_span, format!("expected field type, got {}", type_token));
                    return None;
                }
            };
            if matches!(self.peek(), Some(Token::LBracket)) {
                self.next_token();
                if self.next_token() != Token::RBracket {
                    self.error_at(field_span, format!("expected ] after field {}", field_name));
                    return None;
                }
                fields.push((field_name, ValueKind::Array, Some(base_kind)));
            } else {
                fields.push((field_name, base_kind, None));
            }
        }
        Some(StructType::new(name, fields))
    }

    fn parse_function(&mut self) -> Option<ParsedFunction> {
        let span = self.span();
        self.next_token(); // consume 'func'

        let name = match self.next_token() {
            Token::Ident(name) => name,
            other => {
                self.error_at(span, format!("expected function name, got {}", other));
                return None;
            }
        };
        if self.next_token() != Token::LParen {
            self.error_at(span, format!("expected ( after function {}", name));
            return None;
        }

        let mut params = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RParen) => {
                    self.next_token();
                    break;
                }
                None | Some(Token::Eof) => {
                    self.error_at(self.span(), format!("expected ) in function {}", name));
                    return None;
                }
                _ => {}
            }
            let param_span = self.span();
            let param_name = match self.next_token() {
                Token::Ident(param_name) => param_name,
                other => {
                    self.error_at(param_span, format!("expected parameter name, got {}", other));
                    return None;
                }
            };
            if self.next_token() != Token::Colon {
                self.error_at(
                    param_span,
                    format!("expected : after parameter {}", param_name),
                );
                return None;
            }
            let type_token = self.next_token();
            let kind = match type_kind(&type_token) {
                Some(kind) => kind,
                None => {
                    self.error_at(
                        param_span,
                        format!("expected parameter type, got {}", type_token),
                    );
                    return None;
                }
            };
            params.push(ParsedParam {
                name: param_name,
                kind,
            });
            if matches!(self.peek(), Some(Token::Comma)) {
                self.next_token();
            }
        }

        if self.next_token() != Token::Arrow {
            self.error_at(span, format!("expected -> in function {}", name));
            return None;
        }
        let return_span = self.span();
        let (return_kind, return_struct) = match self.next_token() {
            Token::Void => (ValueKind::Void, None),
            Token::Ident(struct_name) => (ValueKind::Struct, Some(struct_name)),
            other => match type_kind(&other) {
                Some(kind) => (kind, None),
                None => {
                    self.error_at(return_span, format!("expected return type, got {}", other));
                    return None;
                }
            },
        };

        if self.next_token() != Token::LBrace {
            self.error_at(span, format!("expected {{ in function {}", name));
            return None;
        }

        let mut body = Vec::new();
        let mut labels: HashMap<String, usize> = HashMap::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.next_token();
                    break;
                }
                None | Some(Token::Eof) => {
                    self.error_at(
                        self.span(),
                        format!("expected }} at end of function {}", name),
                    );
                    return None;
                }
                Some(Token::Ident(_)) if matches!(self.peek_next(), Some(Token::Colon)) => {
                    let label_span = self.span();
                    if let Token::Ident(label) = self.next_token() {
                        self.next_token(); // consume ':'
                        if labels.insert(label.clone(), body.len()).is_some() {
                            self.error_at(label_span, format!("duplicate label {}", label));
                        }
                    }
                }
                _ => {
                    if let Some(instruction) = self.parse_instruction() {
                        body.push(instruction);
                    }
                }
            }
        }

        Some(ParsedFunction {
            name,
            params,
            return_kind,
            return_struct,
            body,
            labels,
        })
    }

    fn parse_instruction(&mut self) -> Option<Instruction> {
        let span = self.span();
        let mnemonic = self.next_token();
        let opcode = match token_opcode(&mnemonic) {
            Some(opcode) => opcode,
            None => {
                self.error_at(span, format!("unknown instruction {}", mnemonic));
                return None;
            }
        };
        let mut operands = Vec::new();

        match opcode {
            Opcode::Push => {
                match self.peek() {
                    Some(Token::Int32Type | Token::Float32Type | Token::ByteType) => {
                        operands.push(self.next_token());
                    }
                    _ => {
                        let got = self.next_token();
                        self.error_at(span, format!("push requires an operand type, got {}", got));
                        return None;
                    }
                }
                match self.peek() {
                    Some(Token::Int(_) | Token::Float(_)) => {
                        operands.push(self.next_token());
                    }
                    _ => {
                        let got = self.next_token();
                        self.error_at(span, format!("push requires a value operand, got {}", got));
                        return None;
                    }
                }
            }
            Opcode::Store | Opcode::Load => match self.peek() {
                Some(Token::Int(_)) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(
                        span,
                        format!("{} requires an integer slot operand, got {}", opcode, got),
                    );
                    return None;
                }
            },
            Opcode::Jmp | Opcode::Ije | Opcode::Ijne | Opcode::Fje | Opcode::Fjne => {
                match self.peek() {
                    Some(Token::Ident(_)) => operands.push(self.next_token()),
                    _ => {
                        let got = self.next_token();
                        self.error_at(
                            span,
                            format!("{} requires a label operand, got {}", opcode, got),
                        );
                        return None;
                    }
                }
                if opcode != Opcode::Jmp {
                    match self.peek() {
                        Some(Token::Int(_) | Token::Float(_)) => {
                            operands.push(self.next_token());
                        }
                        _ => {
                            let got = self.next_token();
                            self.error_at(
                                span,
                                format!("{} requires a value operand, got {}", opcode, got),
                            );
                            return None;
                        }
                    }
                }
            }
            Opcode::Call => match self.peek() {
                Some(Token::Ident(_)) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(span, format!("call requires a function name, got {}", got));
                    return None;
                }
            },
            Opcode::StrAlloc => match self.peek() {
                Some(Token::Str(_)) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(
                        span,
                        format!("stralloc requires a string literal, got {}", got),
                    );
                    return None;
                }
            },
            Opcode::NewStruct => match self.peek() {
                Some(Token::Ident(_)) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(span, format!("newstruct requires a struct name, got {}", got));
                    return None;
                }
            },
            Opcode::StField | Opcode::FldGet => match self.peek() {
                Some(Token::Str(_)) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(
                        span,
                        format!("{} requires a field name, got {}", opcode, got),
                    );
                    return None;
                }
            },
            Opcode::NewArr => match self.peek() {
                Some(
                    Token::Int32Type | Token::Float32Type | Token::ByteType | Token::StringType,
                ) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(span, format!("newarr requires an element type, got {}", got));
                    return None;
                }
            },
            Opcode::Syscall => match self.peek() {
                Some(
                    Token::Int(_)
                    | Token::StrLen
                    | Token::StrCat
                    | Token::StrEquals
                    | Token::WriteByte
                    | Token::ReadByte,
                ) => operands.push(self.next_token()),
                _ => {
                    let got = self.next_token();
                    self.error_at(
                        span,
                        format!("syscall requires an id or syscall name, got {}", got),
                    );
                    return None;
                }
            },
            // Everything else is a bare opcode.
            _ => {}
        }

        Some(Instruction {
            opcode,
            operands,
            span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(input: &str) -> Result<Program> {
        Parser::new(Lexer::new(input).tokenize()?).parse()
    }

    #[test]
    fn test_parse_minimal_main() -> Result<()> {
        let program = parse(
            r#".text
            func main() -> void {
                push int32 2
                push int32 3
                iadd
                ret
            }"#,
        )?;
        assert_eq!(program.functions.len(), 1);
        let main = &program.functions[0];
        assert_eq!(main.name, "main");
        assert!(main.params.is_empty());
        assert_eq!(main.return_kind, ValueKind::Void);
        assert_eq!(main.body.len(), 4);
        assert_eq!(main.body[0].opcode, Opcode::Push);
        assert_eq!(main.body[0].operands, vec![Token::Int32Type, Token::Int(2)]);
        assert_eq!(main.body[3].opcode, Opcode::Ret);
        Ok(())
    }

    #[test]
    fn test_parse_struct_section() -> Result<()> {
        let program = parse(
            r#".structs
            struct Point {
                x: int32
                y: float32
                name: string
                tags: byte[]
            }"#,
        )?;
        assert_eq!(program.structs.len(), 1);
        let point = &program.structs[0];
        assert_eq!(point.name, "Point");
        assert_eq!(point.fields.len(), 4);
        assert_eq!(point.field("x").unwrap().kind, ValueKind::Int32);
        assert_eq!(point.field("y").unwrap().offset, 4);
        assert_eq!(point.field("name").unwrap().kind, ValueKind::String);
        let tags = point.field("tags").unwrap();
        assert_eq!(tags.kind, ValueKind::Array);
        assert_eq!(tags.element_kind, Some(ValueKind::Byte));
        Ok(())
    }

    #[test]
    fn test_parse_params_and_returns() -> Result<()> {
        let program = parse(
            r#".text
            func add(a: int32, b: int32) -> int32 {
                iadd
                ret
            }
            func greet(name: string) -> string {
                ret
            }"#,
        )?;
        assert_eq!(program.functions.len(), 2);
        let add = &program.functions[0];
        assert_eq!(
            add.params,
            vec![
                ParsedParam {
                    name: "a".to_string(),
                    kind: ValueKind::Int32
                },
                ParsedParam {
                    name: "b".to_string(),
                    kind: ValueKind::Int32
                },
            ]
        );
        assert_eq!(add.return_kind, ValueKind::Int32);
        assert_eq!(program.functions[1].return_kind, ValueKind::String);
        Ok(())
    }

    #[test]
    fn test_parse_struct_return() -> Result<()> {
        let program = parse(
            r#".text
            func make() -> Point {
                newstruct Point
                ret
            }"#,
        )?;
        let make = &program.functions[0];
        assert_eq!(make.return_kind, ValueKind::Struct);
        assert_eq!(make.return_struct.as_deref(), Some("Point"));
        Ok(())
    }

    #[test]
    fn test_parse_labels() -> Result<()> {
        let program = parse(
            r#".text
            func main() -> void {
            start:
                push int32 1
                ijne start 0
            done:
                ret
            }"#,
        )?;
        let main = &program.functions[0];
        assert_eq!(main.labels["start"], 0);
        assert_eq!(main.labels["done"], 2);
        assert_eq!(main.body.len(), 3);
        Ok(())
    }

    #[test]
    fn test_label_after_last_instruction() -> Result<()> {
        let program = parse(
            r#".text
            func main() -> void {
                jmp end
            end:
            }"#,
        )?;
        let main = &program.functions[0];
        assert_eq!(main.labels["end"], 1);
        assert_eq!(main.body.len(), 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_label_is_an_error() {
        let result = parse(
            r#".text
            func main() -> void {
            here:
                push int32 1
            here:
                ret
            }"#,
        );
        let message = result.unwrap_err().to_string();
        assert!(message.contains("duplicate label here"));
    }

    #[test]
    fn test_syscall_operands() -> Result<()> {
        let program = parse(
            r#".text
            func main() -> void {
                syscall str_len
                syscall 3
            }"#,
        )?;
        let main = &program.functions[0];
        assert_eq!(main.body[0].operands, vec![Token::StrLen]);
        assert_eq!(main.body[1].operands, vec![Token::Int(3)]);
        Ok(())
    }

    #[test]
    fn test_all_errors_are_collected() {
        let result = parse(
            r#".text
            func main() -> void {
                push int32
                iadd
                store
                ret
            }"#,
        );
        let message = result.unwrap_err().to_string();
        assert!(message.contains("2 error(s)"), "got: {}", message);
        assert!(message.contains("push requires a value operand"));
        assert!(message.contains("store requires an integer slot operand"));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let message = parse(
            r#".text
            func main() -> void {
                jmp 7
            }"#,
        )
        .unwrap_err()
        .to_string();
        assert!(message.contains("line 3: jmp requires a label operand"), "got: {}", message);
    }

    #[test]
    fn test_field_operand_is_a_string_literal() -> Result<()> {
        let program = parse(
            r#".text
            func main() -> void {
                newstruct Point
                dup
                push int32 42
                stfield "x"
                fldget "x"
                ret
            }"#,
        )?;
        let main = &program.functions[0];
        assert_eq!(main.body[3].opcode, Opcode::StField);
        assert_eq!(main.body[3].operands, vec![Token::Str("x".to_string())]);
        Ok(())
    }
}
