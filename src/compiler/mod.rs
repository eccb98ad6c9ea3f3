//! Single-pass compiler: a Pratt parser that emits bytecode directly,
//! with no intermediate tree. Parsing functions double as code
//! generators; the resolver tracks which names live where.

pub mod resolver;

use std::mem;
use std::rc::Rc;

use crate::chunk::{Chunk, OpCode};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::value::{Function, Value};

use resolver::{FunctionKind, FunctionResolver, LocalSlot};

/// Binding strength, weakest first. Each infix rule parses its right
/// operand at one level above its own, giving left associativity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

impl<'src> ParseRule<'src> {
    fn new(
        prefix: Option<ParseFn<'src>>,
        infix: Option<ParseFn<'src>>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

/// Per-class compile state, stacked for nested class bodies.
struct ClassContext {
    has_superclass: bool,
}

/// Compiles a source string to the top-level script function. Compile
/// errors are reported to stderr as they are found; `None` means at
/// least one occurred.
pub fn compile(source: &str) -> Option<Rc<Function>> {
    let mut compiler = Compiler::new(source);
    compiler.advance();

    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }

    compiler.emit_return();
    if compiler.had_error {
        None
    } else {
        Some(Rc::new(compiler.resolver.function))
    }
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token,
    current: Token,
    /// The function currently being compiled.
    resolver: FunctionResolver,
    /// Suspended resolvers for the functions enclosing `resolver`,
    /// outermost first.
    enclosing: Vec<FunctionResolver>,
    /// Class bodies currently open, innermost last.
    classes: Vec<ClassContext>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        Compiler {
            scanner: Scanner::new(source),
            previous: Token::eof(),
            current: Token::eof(),
            resolver: FunctionResolver::new(FunctionKind::Script, ""),
            enclosing: Vec::new(),
            classes: Vec::new(),
            had_error: false,
            panic_mode: false,
        }
    }

    // Token plumbing

    fn advance(&mut self) {
        self.previous = mem::replace(&mut self.current, Token::eof());

        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.text.clone();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // Bytecode emission

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.resolver.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_with(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Emits a backward jump to `loop_start`. The operand counts from the
    /// byte after the offset itself.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body contains too many instructions.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emits a forward jump with a placeholder offset; returns the offset
    /// position for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Relative to the byte after the two-byte operand.
        let jump = self.current_chunk().len() - offset - 2;

        if jump > u16::MAX as usize {
            self.error("Jump is too long.");
        }

        self.current_chunk().set_code(offset, ((jump >> 8) & 0xff) as u8);
        self.current_chunk().set_code(offset + 1, (jump & 0xff) as u8);
    }

    /// Implicit return: initializers give back the receiver, everything
    /// else returns null.
    fn emit_return(&mut self) {
        if self.resolver.kind == FunctionKind::Initializer {
            self.emit_with(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.current_chunk().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Chunks support at most 256 constants.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_with(OpCode::Const, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.make_constant(Value::from(name))
    }

    // Pratt machinery

    fn rule(kind: TokenKind) -> ParseRule<'src> {
        use TokenKind::*;
        match kind {
            OpenParen => ParseRule::new(
                Some(Compiler::grouping),
                Some(Compiler::call),
                Precedence::Call,
            ),
            OpenSquare => ParseRule::new(
                Some(Compiler::array_literal),
                Some(Compiler::array_index),
                Precedence::Call,
            ),
            Dot => ParseRule::new(None, Some(Compiler::dot), Precedence::Call),
            Tilde => ParseRule::new(Some(Compiler::unary), None, Precedence::Unary),
            Caret => ParseRule::new(None, Some(Compiler::binary), Precedence::Term),
            Plus => ParseRule::new(None, Some(Compiler::binary), Precedence::Term),
            Minus => ParseRule::new(
                Some(Compiler::unary),
                Some(Compiler::binary),
                Precedence::Term,
            ),
            Star => ParseRule::new(None, Some(Compiler::binary), Precedence::Factor),
            Slash => ParseRule::new(None, Some(Compiler::binary), Precedence::Factor),
            Excl => ParseRule::new(Some(Compiler::unary), None, Precedence::None),
            ExclEqual => ParseRule::new(None, Some(Compiler::binary), Precedence::Equality),
            EqualEqual => ParseRule::new(None, Some(Compiler::binary), Precedence::Equality),
            Greater => ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison),
            GreaterEqual => ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison),
            Less => ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison),
            LessEqual => ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison),
            Amp => ParseRule::new(None, Some(Compiler::binary), Precedence::Factor),
            AmpAmp => ParseRule::new(None, Some(Compiler::and), Precedence::And),
            Pipe => ParseRule::new(None, Some(Compiler::binary), Precedence::Term),
            PipePipe => ParseRule::new(None, Some(Compiler::or), Precedence::Or),
            Identifier => ParseRule::new(Some(Compiler::variable), None, Precedence::None),
            Str => ParseRule::new(Some(Compiler::string), None, Precedence::None),
            Number => ParseRule::new(Some(Compiler::number), None, Precedence::None),
            False | True | Null => {
                ParseRule::new(Some(Compiler::literal), None, Precedence::None)
            }
            Super => ParseRule::new(Some(Compiler::super_), None, Precedence::None),
            This => ParseRule::new(Some(Compiler::this), None, Precedence::None),
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Compiler::rule(self.previous.kind).prefix else {
            self.error("Expected expression.");
            return;
        };

        // Assignment binds loosest; only a target parsed at assignment
        // level may consume an `=` itself.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Compiler::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Compiler::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
            self.expression();
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // Expression parse handlers

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::CloseParen, "Expected ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.text.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // The scanner guarantees both delimiters are present.
        let text = &self.previous.text;
        let inner = text[1..text.len() - 1].to_string();
        self.emit_constant(Value::from(inner));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Null => self.emit_op(OpCode::Null),
            _ => {}
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Excl => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Compiler::rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::ExclEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            _ => {}
        }
    }

    /// `&&` short-circuits: if the left side is falsey it stays on the
    /// stack as the result and the right side is skipped.
    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.args_list();
        self.emit_with(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = {
            let text = self.previous.text.clone();
            self.identifier_constant(&text)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::OpenParen) {
            let arg_count = self.args_list();
            self.emit_with(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_with(OpCode::GetProperty, name);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;

        if !self.check(TokenKind::CloseSquare) {
            loop {
                if self.check(TokenKind::CloseSquare) {
                    break;
                }
                // Elements parse above assignment so `,` and `=` end them.
                self.parse_precedence(Precedence::Or);

                if count == u8::MAX as usize {
                    self.error("List literals do not allow more than 255 items.");
                }
                count += 1;

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::CloseSquare, "Expected ']' after list literal.");

        self.emit_op(OpCode::BuildArray);
        self.emit_byte(count.min(u8::MAX as usize) as u8);
    }

    fn array_index(&mut self, can_assign: bool) {
        self.parse_precedence(Precedence::Or);
        self.consume(
            TokenKind::CloseSquare,
            "Expected ']' after array index expression.",
        );

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreArray);
        } else {
            self.emit_op(OpCode::IndexArray);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.text.clone();
        self.named_variable(&name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'this' cannot be referenced outside of a class body.");
            return;
        }

        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("'super' cannot be invoked outside of a class instance."),
            Some(context) if !context.has_superclass => {
                self.error("'super' cannot be invoked in classes without parent classes.");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");

        let name = {
            let text = self.previous.text.clone();
            self.identifier_constant(&text)
        };

        self.named_variable("this", false);
        if self.match_token(TokenKind::OpenParen) {
            // Direct superclass call, no intermediate bound method.
            let arg_count = self.args_list();
            self.named_variable("super", false);
            self.emit_with(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_with(OpCode::GetSuper, name);
        }
    }

    /// Emits the get or set for a name, resolved as local, then upvalue,
    /// then global.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = match self.resolver.resolve_local(name) {
            LocalSlot::Found(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            LocalSlot::Uninitialized(slot) => {
                self.error("Cannot read local variable in initializer.");
                (OpCode::GetLocal, OpCode::SetLocal, slot)
            }
            LocalSlot::NotFound => match self.resolve_upvalue(0, name) {
                Some(index) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index),
                None => {
                    let constant = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with(set_op, arg);
        } else {
            self.emit_with(get_op, arg);
        }
    }

    /// Resolver `depth` levels out from the innermost function. Callers
    /// keep `depth` within the enclosing stack.
    fn resolver_at(&mut self, depth: usize) -> &mut FunctionResolver {
        if depth == 0 {
            &mut self.resolver
        } else {
            let index = self.enclosing.len() - depth;
            &mut self.enclosing[index]
        }
    }

    /// Finds `name` in a function enclosing the one at `depth`, threading
    /// an upvalue through every function in between.
    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Option<u8> {
        let enclosing_depth = depth + 1;
        if enclosing_depth > self.enclosing.len() {
            return None;
        }

        match self.resolver_at(enclosing_depth).resolve_local(name) {
            LocalSlot::Found(slot) | LocalSlot::Uninitialized(slot) => {
                let enclosing = self.resolver_at(enclosing_depth);
                if let Some(local) = enclosing.locals.get_mut(slot as usize) {
                    local.is_captured = true;
                }
                self.add_upvalue(depth, slot, true)
            }
            LocalSlot::NotFound => {
                let index = self.resolve_upvalue(enclosing_depth, name)?;
                self.add_upvalue(depth, index, false)
            }
        }
    }

    fn add_upvalue(&mut self, depth: usize, index: u8, is_local: bool) -> Option<u8> {
        match self.resolver_at(depth).add_upvalue(index, is_local) {
            Ok(slot) => Some(slot),
            Err(message) => {
                self.error(&message);
                Some(0)
            }
        }
    }

    // Declarations and statements

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Func) {
            self.func_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::OpenCurly) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn begin_scope(&mut self) {
        self.resolver.begin_scope();
    }

    /// Each local leaving scope is either popped or, if some closure
    /// captured it, hoisted off the stack first.
    fn end_scope(&mut self) {
        for captured in self.resolver.end_scope() {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::CloseCurly) && !self.check(TokenKind::Eof) {
            self.declaration();
        }

        self.consume(TokenKind::CloseCurly, "Expected '}' after block.");
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        let name = self.previous.text.clone();
        if let Err(err) = self.resolver.declare_variable(&name) {
            self.error(&err);
        }
        if self.resolver.is_local_scope() {
            return 0;
        }

        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.resolver.is_local_scope() {
            self.resolver.mark_initialized();
            return;
        }

        self.emit_with(OpCode::DefineGlobal, global);
    }

    fn args_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::CloseParen) {
            loop {
                self.expression();
                if arg_count == u8::MAX {
                    self.error("Functions cannot have more than 255 parameters.");
                } else {
                    arg_count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::CloseParen, "Expected ')' after arguments.");
        arg_count
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Null);
        }

        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn func_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        self.resolver.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a function body and emits the closure that wraps it,
    /// followed by one `(is_local, index)` pair per upvalue.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.text.clone();
        let parent = mem::replace(&mut self.resolver, FunctionResolver::new(kind, &name));
        self.enclosing.push(parent);
        self.resolver.begin_scope();

        self.consume(TokenKind::OpenParen, "Expected '(' after function name.");

        if !self.check(TokenKind::CloseParen) {
            loop {
                if self.resolver.function.arity == u8::MAX {
                    self.error_at_current("Functions cannot have more than 255 parameters.");
                } else {
                    self.resolver.function.arity += 1;
                }

                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::CloseParen, "Expected ')' after parameters.");
        self.consume(TokenKind::OpenCurly, "Expected '{' before function body.");
        self.block();

        self.emit_return();

        if let Some(parent) = self.enclosing.pop() {
            let finished = mem::replace(&mut self.resolver, parent);
            let upvalues = finished.upvalues;

            let constant = self.make_constant(Value::Function(Rc::new(finished.function)));
            self.emit_with(OpCode::Closure, constant);

            for upvalue in upvalues {
                self.emit_byte(upvalue.is_local as u8);
                self.emit_byte(upvalue.index);
            }
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name = self.previous.text.clone();
        let constant = self.identifier_constant(&name);

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_with(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");

        let class_name = self.previous.text.clone();
        let name_constant = self.identifier_constant(&class_name);
        if let Err(err) = self.resolver.declare_variable(&class_name) {
            self.error(&err);
        }

        self.emit_with(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            self.variable(false);

            if class_name == self.previous.text {
                self.error("Classes cannot inherit from themselves.");
            }

            // The superclass value becomes a scoped local named "super"
            // so methods can capture it.
            self.begin_scope();
            if let Err(err) = self.resolver.add_local("super") {
                self.error(&err);
            }
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(context) = self.classes.last_mut() {
                context.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::OpenCurly, "Expected '{' before class body.");

        while !self.check(TokenKind::CloseCurly) && !self.check(TokenKind::Eof) {
            self.method();
        }

        self.consume(TokenKind::CloseCurly, "Expected '}' after class body.");
        self.emit_op(OpCode::Pop);

        let had_superclass = self
            .classes
            .last()
            .is_some_and(|context| context.has_superclass);
        if had_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.resolver.kind == FunctionKind::Script {
            self.error("Cannot return from main script.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.resolver.kind == FunctionKind::Initializer {
                self.error("Cannot return value from object initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::OpenParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenKind::OpenParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.statement();

        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::OpenParen, "Expected '(' after 'for'.");
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;

        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::CloseParen) {
            // The increment runs after the body, so jump over it now and
            // loop back to it from the body's end.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();

            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::CloseParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();

        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    /// Skips to the next likely statement boundary after a parse error,
    /// so one mistake does not cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }

            match self.current.kind {
                TokenKind::Class
                | TokenKind::Func
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }

            self.advance();
        }
    }

    // Error reporting

    fn error_at(&mut self, at_current: bool, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let token = if at_current {
            &self.current
        } else {
            &self.previous
        };

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.text),
        }
        eprintln!(": {message}");

        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn ops_of(function: &Function) -> Vec<u8> {
        (0..function.chunk.len())
            .map(|i| function.chunk.code(i))
            .collect()
    }

    #[test]
    fn compile_print_statement() {
        let function = compile("print 1;").unwrap();
        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Const.as_byte(),
                0,
                OpCode::Print.as_byte(),
                OpCode::Null.as_byte(),
                OpCode::Return.as_byte(),
            ]
        );
        assert_eq!(function.chunk.constant(0), &Value::Number(1.0));
    }

    #[test]
    fn compile_global_declaration_and_use() {
        let function = compile("var a = 2; print a;").unwrap();
        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Const.as_byte(),
                1, // the initializer value; constant 0 is the name "a"
                OpCode::DefineGlobal.as_byte(),
                0,
                OpCode::GetGlobal.as_byte(),
                2,
                OpCode::Print.as_byte(),
                OpCode::Null.as_byte(),
                OpCode::Return.as_byte(),
            ]
        );
    }

    #[test]
    fn compile_var_without_initializer_defaults_to_null() {
        let function = compile("var a;").unwrap();
        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Null.as_byte(),
                OpCode::DefineGlobal.as_byte(),
                0,
                OpCode::Null.as_byte(),
                OpCode::Return.as_byte(),
            ]
        );
    }

    #[test]
    fn binary_operators_are_left_associative() {
        // 1 - 2 - 3 must compile as (1 - 2) - 3.
        let function = compile("print 1 - 2 - 3;").unwrap();
        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Const.as_byte(),
                0,
                OpCode::Const.as_byte(),
                1,
                OpCode::Sub.as_byte(),
                OpCode::Const.as_byte(),
                2,
                OpCode::Sub.as_byte(),
                OpCode::Print.as_byte(),
                OpCode::Null.as_byte(),
                OpCode::Return.as_byte(),
            ]
        );
    }

    #[test]
    fn comparison_compounds_lower_to_negations() {
        let function = compile("print 1 <= 2;").unwrap();
        let ops = ops_of(&function);
        assert_eq!(
            &ops[4..6],
            &[OpCode::Greater.as_byte(), OpCode::Not.as_byte()]
        );
    }

    #[test]
    fn while_loop_jumps_backwards() {
        let function = compile("while (true) { print 1; }").unwrap();
        let ops = ops_of(&function);
        let loop_at = ops
            .iter()
            .position(|&b| b == OpCode::Loop.as_byte())
            .unwrap();
        let offset = ((ops[loop_at + 1] as usize) << 8) | ops[loop_at + 2] as usize;
        // The backward jump lands on the condition at offset zero.
        assert_eq!(loop_at + 3 - offset, 0);
    }

    #[test]
    fn if_jump_is_patched_past_then_branch() {
        let function = compile("if (true) print 1;").unwrap();
        let ops = ops_of(&function);
        assert_eq!(ops[0], OpCode::True.as_byte());
        assert_eq!(ops[1], OpCode::JumpIfFalse.as_byte());
        let offset = ((ops[2] as usize) << 8) | ops[3] as usize;
        // Lands on the Pop of the else path.
        assert_eq!(ops[4 + offset], OpCode::Pop.as_byte());
    }

    #[test]
    fn closure_emission_includes_upvalue_pairs() {
        let function = compile(
            "func outer() { var x = 1; func inner() { print x; } inner(); }",
        )
        .unwrap();
        let outer = match function.chunk.constant(1) {
            Value::Function(f) => f.clone(),
            other => panic!("expected function constant, got {other}"),
        };
        let ops = ops_of(&outer);
        let closure_at = ops
            .iter()
            .position(|&b| b == OpCode::Closure.as_byte())
            .unwrap();
        // One captured local: pair (1, slot).
        assert_eq!(ops[closure_at + 2], 1);
        let inner = match outer.chunk.constant(ops[closure_at + 1] as usize) {
            Value::Function(f) => f.clone(),
            other => panic!("expected function constant, got {other}"),
        };
        assert_eq!(inner.upvalue_count, 1);
        assert_eq!(inner.name, "inner");
    }

    #[test]
    fn function_arity_is_counted() {
        let function = compile("func add(a, b, c) { print a + b + c; }").unwrap();
        let inner = function
            .chunk
            .constants()
            .iter()
            .find_map(|v| match v {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(inner.arity, 3);
        assert_eq!(inner.name, "add");
    }

    #[test]
    fn array_literal_emits_count() {
        let function = compile("print [1, 2, 3];").unwrap();
        let ops = ops_of(&function);
        let build_at = ops
            .iter()
            .position(|&b| b == OpCode::BuildArray.as_byte())
            .unwrap();
        assert_eq!(ops[build_at + 1], 3);
    }

    #[test]
    fn indexing_binds_tighter_than_addition() {
        // a[0] + b[1] must index both operands before adding, never
        // parse as (a[0] + b)[1].
        let function = compile("print a[0] + b[1];").unwrap();
        let ops = ops_of(&function);
        let add_at = ops
            .iter()
            .position(|&b| b == OpCode::Add.as_byte())
            .unwrap();
        let index_at: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == OpCode::IndexArray.as_byte())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(index_at.len(), 2);
        assert!(index_at.iter().all(|&at| at < add_at));
    }

    #[test]
    fn constant_pool_caps_at_256_entries() {
        let full: String = (0..256).map(|i| format!("print {i};")).collect();
        assert!(compile(&full).is_some());

        let overflow: String = (0..257).map(|i| format!("print {i};")).collect();
        assert!(compile(&overflow).is_none());
    }

    #[test]
    fn top_level_return_is_rejected() {
        assert!(compile("return 1;").is_none());
    }

    #[test]
    fn initializer_cannot_return_value() {
        assert!(compile("class A { init() { return 1; } }").is_none());
    }

    #[test]
    fn self_inheritance_is_rejected() {
        assert!(compile("class A < A {}").is_none());
    }

    #[test]
    fn this_outside_class_is_rejected() {
        assert!(compile("print this;").is_none());
    }

    #[test]
    fn super_without_superclass_is_rejected() {
        assert!(compile("class A { m() { super.m(); } }").is_none());
    }

    #[test]
    fn reading_local_in_own_initializer_is_rejected() {
        assert!(compile("{ var a = a; }").is_none());
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        assert!(compile("1 + 2 = 3;").is_none());
    }

    #[test]
    fn missing_semicolon_is_rejected_but_parsing_recovers() {
        // Both statements are bad; recovery should surface the second too,
        // and the compile still fails overall.
        assert!(compile("print 1\nprint 2;").is_none());
    }

    #[test]
    fn compound_assignment_has_no_rule() {
        assert!(compile("var a = 1; a += 2;").is_none());
    }

    #[test]
    fn class_with_methods_compiles() {
        assert!(compile(
            "class Point { init(x) { this.x = x; } get() { return this.x; } }"
        )
        .is_some());
    }

    #[test]
    fn inheritance_compiles() {
        assert!(compile(
            "class A { m() { return 1; } } class B < A { m() { return super.m(); } }"
        )
        .is_some());
    }
}
