use std::mem;

use crate::common::chunk::Chunk;
use crate::common::opcode::Opcode;
use crate::common::value::{Handle, Value};
use crate::compiler::lex::Lexer;
use crate::compiler::token::{Token, TokenKind};
use crate::vm::heap::Heap;
use crate::vm::object::{Function, Obj};
use crate::vm::table::Table;

/// We're using a Pratt parser, so this little enum
/// defines the different precedence levels.
/// Each successive level binds tighter, so, for example,
/// multiplication is higher than addition: `* > +`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Prec {
    None = 0,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==`, `!=`
    Equality,
    /// `<`, `<=`, `>`, `>=`
    Comparison,
    /// `+`, `-`
    Term,
    /// `*`, `/`
    Factor,
    /// `!`, unary `-`
    Unary,
    /// `.`, `(`
    Call,
    Primary,
}

impl Prec {
    /// The next-tighter precedence level, used to parse the right-hand
    /// side of a left-associative operator: `a + b + c` becomes
    /// `(a + b) + c` because the right operand is parsed one level up.
    ///
    /// Panics on `Prec::Primary`, which is the highest precedence.
    pub fn next(self) -> Prec {
        if let Prec::Primary = self {
            panic!("Can not associate further left");
        }
        unsafe { mem::transmute(self as u8 + 1) }
    }
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

/// One row of the parsing table: what to do with a token in prefix
/// position, what to do with it in infix position, and how tightly it
/// binds as an infix operator.
struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Prec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot during compilation.
/// `depth` is `None` between declaration and the end of the
/// initializer, which is how reads of a variable inside its own
/// initializer are caught.
#[derive(Debug)]
struct LocalVar<'src> {
    name: &'src str,
    depth: Option<usize>,
    captured: bool,
}

/// A captured variable of an enclosing function:
/// either one of its locals, or one of its own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Captured {
    index: u16,
    is_local: bool,
}

/// Per-function compilation state. These stack up as function
/// declarations nest; the innermost context is the one being emitted
/// into.
#[derive(Debug)]
struct Context<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<LocalVar<'src>>,
    upvalues: Vec<Captured>,
    scope_depth: usize,
}

/// Tracks `class` nesting, so `this` and `super` know whether they
/// mean anything where they appear.
#[derive(Debug)]
struct ClassContext {
    has_superclass: bool,
}

/// The single-pass compiler: pulls tokens from the lexer and emits
/// bytecode as it parses, resolving locals and upvalues on the way.
/// There is no syntax tree.
pub struct Parser<'src, 'h> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'h mut Heap,
    /// Read-only view of the VM globals, marked as roots during
    /// compile-time collections.
    globals: &'h Table,
    contexts: Vec<Context<'src>>,
    classes: Vec<ClassContext>,
}

/// Compiles a source buffer to a top-level function object.
/// Returns `None` if any diagnostic was reported; errors have already
/// been printed to stderr by then.
pub fn compile(source: &str, heap: &mut Heap, globals: &Table) -> Option<Handle> {
    let mut parser = Parser {
        lexer: Lexer::new(source),
        current: Token::empty(),
        previous: Token::empty(),
        had_error: false,
        panic_mode: false,
        heap,
        globals,
        contexts: vec![],
        classes: vec![],
    };

    parser.begin_context(FunctionKind::Script, None);
    parser.advance();

    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }

    let (function, _) = parser.end_context();
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'src, 'h> Parser<'src, 'h> {
    // error reporting

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => (),
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);

        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skips tokens until a statement boundary, leaving panic mode.
    /// Called after a declaration fails so one mistake doesn't spray
    /// errors over the rest of the file.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }

            match self.current.kind {
                TokenKind::Class
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    // token plumbing

    fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }

            let message = self.current.lexeme;
            self.error_at_current(message);
        }
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    // emission

    fn ctx(&mut self) -> &mut Context<'src> {
        match self.contexts.last_mut() {
            Some(ctx) => ctx,
            None => unreachable!("no active compiler context"),
        }
    }

    fn ctx_ref(&self) -> &Context<'src> {
        match self.contexts.last() {
            Some(ctx) => ctx,
            None => unreachable!("no active compiler context"),
        }
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.ctx().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_u16(&mut self, short: u16) {
        let line = self.previous.line;
        self.chunk().write_u16(short, line);
    }

    /// Emits a jump with a placeholder offset and returns the offset's
    /// position for later patching.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    /// Points the jump at `offset` to the next instruction to be
    /// emitted.
    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the jump offset itself
        let jump = self.chunk().code.len() - offset - 2;

        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        self.chunk().code[offset] = (jump >> 8) as u8;
        self.chunk().code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);

        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// The implicit return: an initializer hands back its receiver,
    /// everything else returns `nil`.
    fn emit_return(&mut self) {
        if self.ctx_ref().kind == FunctionKind::Initializer {
            self.emit_op(Opcode::GetLocal);
            self.emit_u16(0);
        } else {
            self.emit_op(Opcode::Nil);
        }

        self.emit_op(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let index = self.chunk().add_constant(value);
        if index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }

        index as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(Opcode::Constant);
        self.emit_u16(constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.gc_safepoint();
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    /// A compile-time allocation safepoint. Everything the compiler has
    /// produced so far is reachable through the constant pools and names
    /// of the in-progress functions; earlier interpretation survives
    /// only through the globals table.
    fn gc_safepoint(&mut self) {
        if !self.heap.wants_gc() {
            return;
        }

        for ctx in &self.contexts {
            if let Some(name) = ctx.function.name {
                self.heap.mark_object(name);
            }
            for constant in &ctx.function.chunk.constants {
                self.heap.mark_value(*constant);
            }
        }

        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }

        self.heap.collect();
    }

    // function contexts and scopes

    fn begin_context(&mut self, kind: FunctionKind, name: Option<Handle>) {
        // slot zero belongs to the callee; in a method it holds the
        // receiver and answers to `this`
        let slot_zero = LocalVar {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: Some(0),
            captured: false,
        };

        self.contexts.push(Context {
            function: Function::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: vec![],
            scope_depth: 0,
        });
    }

    /// Seals the innermost function and registers it on the heap.
    /// Returns its handle along with the captures the enclosing
    /// function must emit after `Closure`.
    fn end_context(&mut self) -> (Handle, Vec<Captured>) {
        self.emit_return();
        self.gc_safepoint();

        let ctx = match self.contexts.pop() {
            Some(ctx) => ctx,
            None => unreachable!("no active compiler context"),
        };

        let handle = self.heap.alloc(Obj::Function(ctx.function));
        (handle, ctx.upvalues)
    }

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx().scope_depth -= 1;

        // pop everything the scope declared; captured locals are
        // hoisted into their upvalues instead of discarded
        loop {
            let depth = self.ctx_ref().scope_depth;
            let captured = match self.ctx_ref().locals.last() {
                Some(local) if local.depth > Some(depth) => local.captured,
                _ => break,
            };

            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.ctx().locals.pop();
        }
    }

    // variable resolution

    fn add_local(&mut self, name: &'src str) {
        if self.ctx_ref().locals.len() > u16::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }

        self.ctx().locals.push(LocalVar {
            name,
            depth: None,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        // globals are late bound; only locals are declared
        if self.ctx_ref().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let depth = self.ctx_ref().scope_depth;

        let mut duplicate = false;
        for local in self.ctx_ref().locals.iter().rev() {
            if local.depth.is_some() && local.depth < Some(depth) {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }

        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let depth = self.ctx_ref().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.ctx().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    /// Consumes an identifier; for a local, declares it and returns 0,
    /// for a global, returns its name's constant index.
    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.ctx_ref().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u16) {
        if self.ctx_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_op(Opcode::DefineGlobal);
        self.emit_u16(global);
    }

    /// Finds `name` among the locals of context `ctx`, innermost first.
    fn resolve_local(&mut self, ctx: usize, name: &str) -> Option<u16> {
        let found = self.contexts[ctx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot as u16, local.depth.is_none()));

        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot)
    }

    /// Adds an upvalue to context `ctx`, reusing an existing entry when
    /// the same variable was captured before.
    fn add_upvalue(&mut self, ctx: usize, index: u16, is_local: bool) -> u16 {
        let captured = Captured { index, is_local };

        if let Some(existing) = self.contexts[ctx]
            .upvalues
            .iter()
            .position(|candidate| *candidate == captured)
        {
            return existing as u16;
        }

        if self.contexts[ctx].upvalues.len() >= u16::MAX as usize {
            self.error("Too many closure variables in function.");
            return 0;
        }

        self.contexts[ctx].upvalues.push(captured);
        let count = self.contexts[ctx].upvalues.len();
        self.contexts[ctx].function.upvalue_count = count as u16;
        count as u16 - 1
    }

    /// Finds `name` in an enclosing function, threading an upvalue
    /// chain down through every context in between. The local that ends
    /// the chain is flagged `captured` so its scope closes it instead of
    /// popping it.
    fn resolve_upvalue(&mut self, ctx: usize, name: &str) -> Option<u16> {
        if ctx == 0 {
            return None;
        }
        let enclosing = ctx - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.contexts[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(ctx, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(ctx, upvalue, false));
        }

        None
    }

    /// Emits a read of `name`, or a write if an `=` follows and
    /// assignment is allowed here: local slot, upvalue, or global, in
    /// that order of preference.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.contexts.len() - 1;

        let (get, set, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set);
        } else {
            self.emit_op(get);
        }
        self.emit_u16(arg);
    }

    // the Pratt machinery

    /// Parses anything at least as tight as `prec`: one prefix rule,
    /// then infix rules while the lookahead binds tighter. A rule may
    /// consume a trailing `=` only when `can_assign`; a leftover `=`
    /// afterwards means the target wasn't assignable.
    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();

        let prefix = match get_rule(self.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            },
        };

        let can_assign = prec <= Prec::Assignment;
        prefix(self, can_assign);

        while prec <= get_rule(self.current.kind).precedence {
            self.advance();
            match get_rule(self.previous.kind).infix {
                Some(infix) => infix(self, can_assign),
                None => unreachable!("token has infix precedence but no infix rule"),
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    // prefix and infix rules

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // the lexeme still carries its quotes
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];

        self.gc_safepoint();
        let handle = self.heap.intern(contents);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            _ => unreachable!("literal rule on a non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        // compile the operand first
        self.parse_precedence(Prec::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            _ => unreachable!("unary rule on a non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = get_rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::BangEqual => {
                self.emit_op(Opcode::Equal);
                self.emit_op(Opcode::Not);
            },
            TokenKind::GreaterEqual => {
                self.emit_op(Opcode::Less);
                self.emit_op(Opcode::Not);
            },
            TokenKind::LessEqual => {
                self.emit_op(Opcode::Greater);
                self.emit_op(Opcode::Not);
            },
            _ => unreachable!("binary rule on a non-binary token"),
        }
    }

    /// `and` short-circuits: if the left side is falsey it stays on the
    /// stack as the result and the right side is skipped.
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpFalse);
        let end_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);

        self.parse_precedence(Prec::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(Opcode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetProperty);
            self.emit_u16(name);
        } else if self.match_token(TokenKind::LeftParen) {
            // fused property access and call
            let arg_count = self.argument_list();
            self.emit_op(Opcode::Invoke);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(Opcode::GetProperty);
            self.emit_u16(name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }

        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            },
            Some(_) => (),
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(Opcode::SuperInvoke);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op(Opcode::GetSuper);
            self.emit_u16(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;

        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    // declarations and statements

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fn) {
            self.fn_declaration();
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
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }

        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // a function may refer to itself; it is initialized the moment
        // its name is bound
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a `(params) { body }` tail into a fresh function
    /// object, then emits the `Closure` instruction that builds it at
    /// runtime, one capture descriptor per upvalue.
    fn function(&mut self, kind: FunctionKind) {
        self.gc_safepoint();
        let name = self.heap.intern(self.previous.lexeme);
        self.begin_context(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.ctx_ref().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.ctx().function.arity += 1;
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // no end_scope: the context is discarded whole
        let (function, upvalues) = self.end_context();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(Opcode::Closure);
        self.emit_u16(constant);

        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_u16(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_op(Opcode::Method);
        self.emit_u16(constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op(Opcode::Class);
        self.emit_u16(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // `super` is an ordinary local of a scope wrapped around
            // the class body, captured by methods like any other
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(Opcode::Inherit);

            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        let had_superclass = match self.classes.pop() {
            Some(class) => class.has_superclass,
            None => unreachable!("class context underflow"),
        };
        if had_superclass {
            self.end_scope();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // the condition is popped on both paths, hence the two Pops
        let then_jump = self.emit_jump(Opcode::JumpFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
    }

    /// `for` is sugar for a `while` in its own scope. The increment
    /// runs after the body, so on the way in we jump over it, and it
    /// becomes the loop target from then on.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(Opcode::JumpFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk().code.len();

            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Opcode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx_ref().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx_ref().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }
}

/// The parsing table: one row per token kind.
fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'h>>,
        Option<ParseFn<'src, 'h>>,
        Prec,
    ) = match kind {
        TokenKind::LeftParen => (Some(Parser::grouping), Some(Parser::call), Prec::Call),
        TokenKind::Dot => (None, Some(Parser::dot), Prec::Call),
        TokenKind::Minus => (Some(Parser::unary), Some(Parser::binary), Prec::Term),
        TokenKind::Plus => (None, Some(Parser::binary), Prec::Term),
        TokenKind::Slash => (None, Some(Parser::binary), Prec::Factor),
        TokenKind::Star => (None, Some(Parser::binary), Prec::Factor),
        TokenKind::Bang => (Some(Parser::unary), None, Prec::None),
        TokenKind::BangEqual => (None, Some(Parser::binary), Prec::Equality),
        TokenKind::EqualEqual => (None, Some(Parser::binary), Prec::Equality),
        TokenKind::Greater => (None, Some(Parser::binary), Prec::Comparison),
        TokenKind::GreaterEqual => (None, Some(Parser::binary), Prec::Comparison),
        TokenKind::Less => (None, Some(Parser::binary), Prec::Comparison),
        TokenKind::LessEqual => (None, Some(Parser::binary), Prec::Comparison),
        TokenKind::Identifier => (Some(Parser::variable), None, Prec::None),
        TokenKind::Str => (Some(Parser::string), None, Prec::None),
        TokenKind::Number => (Some(Parser::number), None, Prec::None),
        TokenKind::And => (None, Some(Parser::and_), Prec::And),
        TokenKind::Or => (None, Some(Parser::or_), Prec::Or),
        TokenKind::False => (Some(Parser::literal), None, Prec::None),
        TokenKind::True => (Some(Parser::literal), None, Prec::None),
        TokenKind::Nil => (Some(Parser::literal), None, Prec::None),
        TokenKind::Super => (Some(Parser::super_), None, Prec::None),
        TokenKind::This => (Some(Parser::this_), None, Prec::None),
        _ => (None, None, Prec::None),
    };

    ParseRule {
        prefix,
        infix,
        precedence,
    }
}
