//! Single-pass Pratt-precedence compiler: source text directly to bytecode,
//! no separate AST.
//!
//! Scopes, upvalues and jump patch sites are all threaded through a stack
//! of [`FunctionState`] frames (one per nested `fun`/arrow being compiled),
//! with frame `i`'s enclosing function at frame `i - 1` — this sidesteps
//! the self-referential "compiler has a pointer to its parent compiler"
//! shape the reference C implementation uses, which Rust's ownership rules
//! make awkward, while keeping exactly the same resolution algorithm.

use crate::scanner::{decode_escapes, Scanner};
use crate::token::{Token, TokenType};
use ember_core::{chunk::OpCode, Chunk, Heap, Obj, ObjFunction, ObjRef, Table, UpvalueDesc, Value};
use std::fmt;

/// Compile-time failure. parse errors are printed as they're
/// found (with source position), synchronization continues, and
/// `compile()` as a whole fails if *any* were seen — so this type only
/// needs to report that final fact plus a representative count; the
/// detailed per-error text already reached stderr via `report_error`.
#[derive(Debug)]
pub struct CompileError {
    pub error_count: usize,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} compile error(s)", self.error_count)
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Comma,
    Assign,
    Cond,
    Or,
    And,
    Equal,
    Comp,
    Sum,
    Prod,
    Prefix,
    Postfix,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Comma,
            Comma => Assign,
            Assign => Cond,
            Cond => Or,
            Or => And,
            And => Equal,
            Equal => Comp,
            Comp => Sum,
            Sum => Prod,
            Prod => Prefix,
            Prefix => Postfix,
            Postfix => Primary,
            Primary => Primary,
        }
    }
}

struct Local<'src> {
    name: &'src str,
    /// `-1` marks "declared, initializer not yet evaluated" — looking a
    /// name up while its own local is in this state is the compile-time
    /// hazard `var x = x;` creates; `ember` rejects it
    /// (see `DESIGN.md`).
    depth: i32,
}

struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

/// One open loop's patch bookkeeping, so `break`/`continue` know where to
/// jump and how many locals to discard first.
struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<usize>,
    scope_depth: i32,
}

#[derive(PartialEq)]
enum FnKind {
    Script,
    Function,
}

struct FunctionState<'src> {
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    kind: FnKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    /// Non-loop break target (switch), reusing `LoopCtx`'s shape.
    switches: Vec<LoopCtx>,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FnKind, name: Option<String>) -> Self {
        // Slot 0 is reserved for the callee itself (the function or closure
        // value being called), so real
        // locals start at index 1 and line up with stack slots counted
        // from the frame pointer.
        let locals = vec![Local { name: "", depth: 0 }];
        FunctionState {
            name,
            arity: 0,
            chunk: Chunk::new(),
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            switches: Vec::new(),
        }
    }
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    functions: Vec<FunctionState<'src>>,
    errors: usize,
}

/// Compile `source` to a top-level callable function object.
///
/// `heap`/`interner` are owned by the caller (the VM) and persist across
/// calls — a REPL recompiles each line against the same heap so globals
/// and interned strings survive from one line to the next. The host reads
/// a source string and this produces a top-level callable function in
/// return, ready for the VM to invoke.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    interner: &mut ember_core::Table,
) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token {
            kind: TokenType::Error,
            lexeme: "",
            line: 0,
        },
        current: Token {
            kind: TokenType::Error,
            lexeme: "",
            line: 0,
        },
        had_error: false,
        panic_mode: false,
        functions: vec![FunctionState::new(FnKind::Script, None)],
        errors: 0,
    };

    compiler.advance(heap, interner);
    while !compiler.check(TokenType::Eof) {
        compiler.declaration(heap, interner);
    }
    compiler.consume(TokenType::Eof, "Expect end of expression.", heap, interner);

    let line = compiler.previous.line;
    compiler.emit_byte(OpCode::PushNil as u8, line);
    compiler.emit_byte(OpCode::Ret as u8, line);

    if compiler.had_error {
        return Err(CompileError {
            error_count: compiler.errors,
        });
    }

    let top = compiler.functions.pop().expect("script frame always present");
    let function = ObjFunction {
        name: None,
        arity: 0,
        chunk: top.chunk,
        upvalues: Vec::new(),
    };
    Ok(heap.alloc(Obj::Function(function)))
}

impl<'src> Compiler<'src> {
    // --- token stream helpers --------------------------------------------

    fn advance(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.lexeme, heap, interner);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenType, heap: &mut Heap, interner: &mut Table) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance(heap, interner);
        true
    }

    fn consume(&mut self, kind: TokenType, message: &str, heap: &mut Heap, interner: &mut Table) {
        if self.current.kind == kind {
            self.advance(heap, interner);
            return;
        }
        self.error_at_current(message, heap, interner);
    }

    fn error_at_current(&mut self, message: &str, heap: &mut Heap, interner: &mut Table) {
        let _ = (heap, interner);
        self.report_error(self.current.line, message);
    }

    fn error(&mut self, message: &str) {
        self.report_error(self.previous.line, message);
    }

    fn report_error(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors += 1;
        eprintln!("[line {line}] Error: {message}");
    }

    /// advance past tokens until a statement boundary so a
    /// single bad token doesn't cascade into dozens of spurious errors.
    fn synchronize(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.panic_mode = false;
        while self.current.kind != TokenType::Eof {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }
            match self.current.kind {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return
                | TokenType::Switch => return,
                _ => {}
            }
            self.advance(heap, interner);
        }
    }

    // --- chunk emission helpers -------------------------------------------

    fn current_fn(&mut self) -> &mut FunctionState<'src> {
        self.functions.last_mut().expect("at least the script frame")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn().chunk
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
        self.chunk().write_byte(operand, line);
    }

    /// Emit `op` with a placeholder i16 offset, returning the offset of the
    /// first operand byte so `patch_jump` can fill it in later.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
        let at = self.chunk().code.len();
        self.chunk().write_byte(0, line);
        self.chunk().write_byte(0, line);
        at
    }

    /// Patch a forward jump emitted by `emit_jump` to land at the chunk's
    /// current end: a 2-byte signed offset relative to the instruction
    /// following the 3-byte jump.
    fn patch_jump(&mut self, at: usize) {
        let target = self.chunk().code.len();
        let offset = (target as isize) - (at as isize + 2);
        self.write_offset(at, offset);
    }

    /// Emit a backward jump straight to `target` (used for loop-back edges,
    /// where the target is already known).
    fn emit_loop(&mut self, op: OpCode, target: usize) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
        let at = self.chunk().code.len();
        self.chunk().write_byte(0, line);
        self.chunk().write_byte(0, line);
        let offset = (target as isize) - (at as isize + 2);
        self.write_offset(at, offset);
    }

    fn write_offset(&mut self, at: usize, offset: isize) {
        if !(i16::MIN as isize..=i16::MAX as isize).contains(&offset) {
            self.error("Jump distance too large.");
            return;
        }
        let bytes = (offset as i16).to_le_bytes();
        let chunk = self.chunk();
        chunk.code[at] = bytes[0];
        chunk.code[at + 1] = bytes[1];
    }

    fn emit_constant(&mut self, value: Value) {
        match self.chunk().add_constant(value) {
            Some(idx) => self.emit_op_u8(OpCode::PushConst, idx),
            None => self.error("Too many constants in one chunk."),
        }
    }

    fn intern_identifier(&mut self, text: &str, heap: &mut Heap, interner: &mut Table) -> ObjRef {
        ember_core::intern(heap, interner, text)
    }

    // --- scopes & locals ----------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.previous.line;
        let depth = self.current_fn().scope_depth;
        let mut popped = 0u32;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth < depth {
                break;
            }
            self.current_fn().locals.pop();
            popped += 1;
        }
        self.current_fn().scope_depth -= 1;
        match popped {
            0 => {}
            1 => self.emit_byte(OpCode::Pop as u8, line),
            n => {
                self.emit_byte(OpCode::PopN as u8, line);
                self.emit_byte(n.min(255) as u8, line);
            }
        }
    }

    fn declare_local(&mut self, name: &'src str) {
        let depth = self.current_fn().scope_depth;
        if self
            .current_fn()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name)
        {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.current_fn().locals.len() >= ember_core::MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn().locals.push(Local { name, depth: -1 });
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_fn().scope_depth;
        if let Some(local) = self.current_fn().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(state: &FunctionState<'src>, name: &str) -> Option<(u8, bool)> {
        for (i, local) in state.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i as u8, local.depth == -1));
            }
        }
        None
    }

    fn add_upvalue(state: &mut FunctionState<'src>, index: u8, is_local: bool) -> Option<u8> {
        for (i, up) in state.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Some(i as u8);
            }
        }
        if state.upvalues.len() >= ember_core::MAX_LOCALS {
            return None;
        }
        state.upvalues.push(UpvalueSlot { index, is_local });
        Some((state.upvalues.len() - 1) as u8)
    }

    fn resolve_upvalue(functions: &mut [FunctionState<'src>], idx: usize, name: &str) -> Option<u8> {
        if idx == 0 {
            return None;
        }
        let parent_idx = idx - 1;
        if let Some((slot, uninitialized)) = Self::resolve_local(&functions[parent_idx], name) {
            if uninitialized {
                return None;
            }
            return Self::add_upvalue(&mut functions[idx], slot, true);
        }
        if let Some(up_slot) = Self::resolve_upvalue(functions, parent_idx, name) {
            return Self::add_upvalue(&mut functions[idx], up_slot, false);
        }
        None
    }

    // --- declarations & statements ------------------------------------------

    fn declaration(&mut self, heap: &mut Heap, interner: &mut Table) {
        if self.match_token(TokenType::Var, heap, interner) {
            self.var_declaration(heap, interner);
        } else if self.match_token(TokenType::Fun, heap, interner) {
            self.fun_declaration(heap, interner);
        } else {
            self.statement(heap, interner);
        }
        if self.panic_mode {
            self.synchronize(heap, interner);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::Identifier, "Expect variable name.", heap, interner);
        let name_tok = self.previous;
        let is_global = self.current_fn().scope_depth == 0;
        let global_ref = if is_global {
            Some(self.intern_identifier(name_tok.lexeme, heap, interner))
        } else {
            self.declare_local(name_tok.lexeme);
            None
        };

        if self.match_token(TokenType::Equal, heap, interner) {
            self.expression(heap, interner);
        } else {
            self.emit_op(OpCode::PushNil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
            heap,
            interner,
        );

        if let Some(name_ref) = global_ref {
            let idx = self
                .chunk()
                .add_constant(Value::Obj(name_ref))
                .unwrap_or_else(|| {
                    self.error("Too many constants in one chunk.");
                    0
                });
            self.emit_op_u8(OpCode::DefGlobal, idx);
        } else {
            self.mark_initialized();
        }
    }

    fn fun_declaration(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::Identifier, "Expect function name.", heap, interner);
        let name_tok = self.previous;
        let is_global = self.current_fn().scope_depth == 0;
        let global_ref = if is_global {
            Some(self.intern_identifier(name_tok.lexeme, heap, interner))
        } else {
            self.declare_local(name_tok.lexeme);
            self.mark_initialized();
            None
        };

        self.compile_function(FnKind::Function, Some(name_tok.lexeme.to_string()), heap, interner);

        if let Some(name_ref) = global_ref {
            let idx = self
                .chunk()
                .add_constant(Value::Obj(name_ref))
                .unwrap_or_else(|| {
                    self.error("Too many constants in one chunk.");
                    0
                });
            self.emit_op_u8(OpCode::DefGlobal, idx);
        } else {
            // the freshly-built function value is on the stack already,
            // sitting exactly in the local slot declared above
        }
    }

    /// Compile a `fun name(...) { ... }` / anonymous `fun (...) { ... }`
    /// body (the `(...)` → `-> expr` arrow form is also accepted here,
    /// when the keyword-led path is used to introduce it). Leaves the
    /// resulting value (a bare `Function` via `PUSH_CONST`, or a
    /// `Closure` via `PUSH_CLOSURE` when it captures anything) on the
    /// enclosing chunk's stack.
    fn compile_function(
        &mut self,
        kind: FnKind,
        name: Option<String>,
        heap: &mut Heap,
        interner: &mut Table,
    ) {
        self.functions.push(FunctionState::new(kind, name));
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.", heap, interner);
        self.function_params_and_body(heap, interner);
        self.finish_function(heap, interner);
    }

    /// Compile the bare `(p1, p2) -> expr` arrow-literal form, reached
    /// directly from `(` in prefix position (see `looks_like_arrow_params`)
    /// rather than via the `fun` keyword. The opening `(` is already
    /// consumed by the caller.
    fn arrow_function(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.functions.push(FunctionState::new(FnKind::Function, None));
        self.begin_scope();
        self.function_params_and_body(heap, interner);
        self.finish_function(heap, interner);
    }

    /// Shared by both function-literal forms: parse `(already consumed)
    /// params)` then either a `{ ... }` block body or a `-> expr` arrow
    /// body, emitting into the `FunctionState` pushed by the caller.
    fn function_params_and_body(&mut self, heap: &mut Heap, interner: &mut Table) {
        if !self.check(TokenType::RightParen) {
            loop {
                if self.current_fn().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.", heap, interner);
                }
                self.consume(TokenType::Identifier, "Expect parameter name.", heap, interner);
                let param = self.previous.lexeme;
                self.declare_local(param);
                self.mark_initialized();
                self.current_fn().arity += 1;
                if !self.match_token(TokenType::Comma, heap, interner) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.", heap, interner);

        if self.match_token(TokenType::Arrow, heap, interner) {
            self.expression(heap, interner);
            self.emit_op(OpCode::Ret);
        } else {
            self.consume(TokenType::LeftBrace, "Expect '{' before function body.", heap, interner);
            while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
                self.declaration(heap, interner);
            }
            self.consume(TokenType::RightBrace, "Expect '}' after function body.", heap, interner);
            let line = self.previous.line;
            self.emit_byte(OpCode::PushNil as u8, line);
            self.emit_byte(OpCode::Ret as u8, line);
        }
    }

    /// Pop the just-finished `FunctionState`, materialize it as an
    /// `ObjFunction` constant, and emit `PUSH_CONST` (no captures) or
    /// `PUSH_CLOSURE` (captures upvalues) into the *enclosing* chunk.
    fn finish_function(&mut self, heap: &mut Heap, interner: &mut Table) {
        let finished = self.functions.pop().expect("pushed above");
        let upvalues: Vec<UpvalueDesc> = finished
            .upvalues
            .iter()
            .map(|u| UpvalueDesc {
                source_index: u.index,
                is_local_in_parent: u.is_local,
            })
            .collect();
        let name_ref = finished
            .name
            .as_deref()
            .map(|n| self.intern_identifier(n, heap, interner));
        let function = ObjFunction {
            name: name_ref,
            arity: finished.arity,
            chunk: finished.chunk,
            upvalues: upvalues.clone(),
        };
        let func_ref = heap.alloc(Obj::Function(function));

        if upvalues.is_empty() {
            self.emit_constant(Value::Obj(func_ref));
        } else {
            match self.chunk().add_constant(Value::Obj(func_ref)) {
                Some(idx) => self.emit_op_u8(OpCode::PushClosure, idx),
                None => self.error("Too many constants in one chunk."),
            }
        }
    }

    /// Lookahead-only check for whether the `(` just consumed (`self.
    /// previous`) opens an arrow-function parameter list (`()`/`(a, b,
    /// ...)` followed by `->`) rather than a parenthesized expression.
    /// Scans a cloned `Scanner` without touching `self`'s real token
    /// stream, so a negative result leaves parsing state untouched and
    /// `grouping` proceeds exactly as if this check had never run.
    fn looks_like_arrow_params(&self) -> bool {
        let mut probe = self.scanner;
        let mut tok = self.current;
        if tok.kind == TokenType::RightParen {
            return probe.next_token().kind == TokenType::Arrow;
        }
        loop {
            if tok.kind != TokenType::Identifier {
                return false;
            }
            tok = probe.next_token();
            match tok.kind {
                TokenType::Comma => {
                    tok = probe.next_token();
                }
                TokenType::RightParen => {
                    return probe.next_token().kind == TokenType::Arrow;
                }
                _ => return false,
            }
        }
    }

    fn statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        if self.match_token(TokenType::LeftBrace, heap, interner) {
            self.begin_scope();
            self.block(heap, interner);
            self.end_scope();
        } else if self.match_token(TokenType::If, heap, interner) {
            self.if_statement(heap, interner);
        } else if self.match_token(TokenType::While, heap, interner) {
            self.while_statement(heap, interner);
        } else if self.match_token(TokenType::For, heap, interner) {
            self.for_statement(heap, interner);
        } else if self.match_token(TokenType::Do, heap, interner) {
            self.do_while_statement(heap, interner);
        } else if self.match_token(TokenType::Switch, heap, interner) {
            self.switch_statement(heap, interner);
        } else if self.match_token(TokenType::Return, heap, interner) {
            self.return_statement(heap, interner);
        } else if self.match_token(TokenType::Break, heap, interner) {
            self.break_statement(heap, interner);
        } else if self.match_token(TokenType::Continue, heap, interner) {
            self.continue_statement(heap, interner);
        } else {
            self.expression_statement(heap, interner);
        }
    }

    fn block(&mut self, heap: &mut Heap, interner: &mut Table) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration(heap, interner);
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.", heap, interner);
    }

    fn expression_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.expression(heap, interner);
        self.consume(TokenType::Semicolon, "Expect ';' after expression.", heap, interner);
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.", heap, interner);
        self.expression(heap, interner);
        self.consume(TokenType::RightParen, "Expect ')' after condition.", heap, interner);

        let else_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop); // discard condition, "then" path
        self.statement(heap, interner);

        let end_jump = self.emit_jump(OpCode::Jmp);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop); // discard condition, "else" path

        if self.match_token(TokenType::Else, heap, interner) {
            self.statement(heap, interner);
        }
        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        let loop_start = self.chunk().code.len();
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth,
        });

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.", heap, interner);
        self.expression(heap, interner);
        self.consume(TokenType::RightParen, "Expect ')' after condition.", heap, interner);

        let exit_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap, interner);
        self.emit_loop(OpCode::Jmp, loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let ctx = self.current_fn().loops.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn do_while_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        let loop_start = self.chunk().code.len();
        let scope_depth = self.current_fn().scope_depth;
        // continue target is patched below once known (the condition's
        // start); do-while's continue must re-check the condition, so it
        // is recorded after the body compiles.
        self.current_fn().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth,
        });

        self.statement(heap, interner);

        let cond_start = self.chunk().code.len();
        if let Some(ctx) = self.current_fn().loops.last_mut() {
            ctx.continue_target = cond_start;
        }
        self.consume(TokenType::While, "Expect 'while' after 'do' body.", heap, interner);
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.", heap, interner);
        self.expression(heap, interner);
        self.consume(TokenType::RightParen, "Expect ')' after condition.", heap, interner);
        self.consume(TokenType::Semicolon, "Expect ';' after 'do...while'.", heap, interner);

        let exit_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop); // true: loop again
        self.emit_loop(OpCode::Jmp, loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop); // false: fall through

        let ctx = self.current_fn().loops.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.", heap, interner);

        if self.match_token(TokenType::Semicolon, heap, interner) {
            // no initializer
        } else if self.match_token(TokenType::Var, heap, interner) {
            self.var_declaration(heap, interner);
        } else {
            self.expression_statement(heap, interner);
        }

        let mut loop_start = self.chunk().code.len();
        let has_condition = !self.check(TokenType::Semicolon);
        let mut exit_jump = None;
        if has_condition {
            self.expression(heap, interner);
        } else {
            self.emit_op(OpCode::PushTrue);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after loop condition.", heap, interner);
        exit_jump = exit_jump.or(Some(self.emit_jump(OpCode::JmpFalse)));
        self.emit_op(OpCode::Pop);
        let body_jump = self.emit_jump(OpCode::Jmp);

        let increment_start = self.chunk().code.len();
        if !self.check(TokenType::RightParen) {
            self.expression(heap, interner);
            self.emit_op(OpCode::Pop);
        }
        self.consume(TokenType::RightParen, "Expect ')' after for clauses.", heap, interner);
        self.emit_loop(OpCode::Jmp, loop_start);
        loop_start = increment_start;

        self.patch_jump(body_jump);
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth,
        });
        self.statement(heap, interner);
        self.emit_loop(OpCode::Jmp, increment_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let ctx = self.current_fn().loops.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    fn switch_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.", heap, interner);
        self.begin_scope();
        self.expression(heap, interner);
        self.consume(TokenType::RightParen, "Expect ')' after switch value.", heap, interner);
        // the scrutinee is now an anonymous local occupying the next slot
        self.current_fn().locals.push(Local {
            name: "",
            depth: self.current_fn().scope_depth,
        });
        let scrutinee_slot = (self.current_fn().locals.len() - 1) as u8;

        self.consume(TokenType::LeftBrace, "Expect '{' before switch body.", heap, interner);

        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().switches.push(LoopCtx {
            continue_target: 0,
            break_jumps: Vec::new(),
            scope_depth,
        });

        let mut pending_false_jump: Option<usize> = None;
        let mut fallthrough_jumps: Vec<usize> = Vec::new();
        let mut seen_default = false;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.match_token(TokenType::Case, heap, interner) {
                if let Some(p) = pending_false_jump.take() {
                    self.patch_jump(p);
                    self.emit_op(OpCode::Pop); // previous case didn't match: discard its comparison
                }
                self.emit_op_u8(OpCode::PushLocal, scrutinee_slot);
                self.expression(heap, interner);
                self.consume(TokenType::Colon, "Expect ':' after case value.", heap, interner);
                self.emit_op(OpCode::Teq);
                pending_false_jump = Some(self.emit_jump(OpCode::JmpFalse));
                self.emit_op(OpCode::Pop); // matched: discard comparison result
                for p in fallthrough_jumps.drain(..) {
                    self.patch_jump(p);
                }
                while !self.check(TokenType::Case)
                    && !self.check(TokenType::Default)
                    && !self.check(TokenType::RightBrace)
                    && !self.check(TokenType::Eof)
                {
                    self.declaration(heap, interner);
                }
                fallthrough_jumps.push(self.emit_jump(OpCode::Jmp));
            } else if self.match_token(TokenType::Default, heap, interner) {
                seen_default = true;
                self.consume(TokenType::Colon, "Expect ':' after 'default'.", heap, interner);
                if let Some(p) = pending_false_jump.take() {
                    self.patch_jump(p);
                    self.emit_op(OpCode::Pop); // previous case didn't match: discard its comparison
                }
                for p in fallthrough_jumps.drain(..) {
                    self.patch_jump(p);
                }
                while !self.check(TokenType::Case)
                    && !self.check(TokenType::Default)
                    && !self.check(TokenType::RightBrace)
                    && !self.check(TokenType::Eof)
                {
                    self.declaration(heap, interner);
                }
                fallthrough_jumps.push(self.emit_jump(OpCode::Jmp));
            } else {
                self.error_at_current("Expect 'case' or 'default' in switch body.", heap, interner);
                self.advance(heap, interner);
            }
        }
        let _ = seen_default;
        self.consume(TokenType::RightBrace, "Expect '}' after switch body.", heap, interner);

        if let Some(p) = pending_false_jump.take() {
            self.patch_jump(p);
            self.emit_op(OpCode::Pop); // no clause matched: discard comparison
        }
        for p in fallthrough_jumps.drain(..) {
            self.patch_jump(p);
        }

        let ctx = self.current_fn().switches.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope(); // pops the scrutinee local
    }

    fn return_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        if self.functions.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon, heap, interner) {
            self.emit_op(OpCode::PushNil);
        } else {
            self.expression(heap, interner);
            self.consume(TokenType::Semicolon, "Expect ';' after return value.", heap, interner);
        }
        self.emit_op(OpCode::Ret);
    }

    /// Shared by `break`/`continue`: find the nearest enclosing loop or
    /// switch context, returning its recorded scope depth and a way to
    /// record a break-patch site.
    fn innermost_breakable_depth(&self) -> Option<i32> {
        let loop_depth = self.functions.last().unwrap().loops.last().map(|c| c.scope_depth);
        let switch_depth = self.functions.last().unwrap().switches.last().map(|c| c.scope_depth);
        match (loop_depth, switch_depth) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn pop_locals_to_depth(&mut self, target_depth: i32) {
        let line = self.previous.line;
        let count = self
            .current_fn()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > target_depth)
            .count() as u32;
        match count {
            0 => {}
            1 => self.emit_byte(OpCode::Pop as u8, line),
            n => {
                self.emit_byte(OpCode::PopN as u8, line);
                self.emit_byte(n.min(255) as u8, line);
            }
        }
    }

    fn break_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.", heap, interner);
        match self.innermost_breakable_depth() {
            None => self.error("Can't use 'break' outside of a loop or switch."),
            Some(depth) => {
                self.pop_locals_to_depth(depth);
                let jump = self.emit_jump(OpCode::Jmp);
                let state = self.current_fn();
                // Whichever of the two contexts is actually innermost carries
                // the deeper recorded scope depth (switch/loop bodies always
                // open their own scope) — a switch directly inside a loop
                // must take `break` for itself, not let the enclosing loop
                // catch it.
                let loop_depth = state.loops.last().map(|c| c.scope_depth);
                let switch_depth = state.switches.last().map(|c| c.scope_depth);
                let switch_is_innermost = match (loop_depth, switch_depth) {
                    (Some(l), Some(s)) => s >= l,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if switch_is_innermost {
                    state.switches.last_mut().expect("switch_is_innermost implies a switch").break_jumps.push(jump);
                } else if let Some(ctx) = state.loops.last_mut() {
                    ctx.break_jumps.push(jump);
                }
            }
        }
    }

    fn continue_statement(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.", heap, interner);
        match self.current_fn().loops.last() {
            None => self.error("Can't use 'continue' outside of a loop."),
            Some(ctx) => {
                let depth = ctx.scope_depth;
                let target = ctx.continue_target;
                self.pop_locals_to_depth(depth);
                self.emit_loop(OpCode::Jmp, target);
            }
        }
    }

    // --- expressions ---------------------------------------------------------

    fn expression(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.parse_precedence(Precedence::Comma, heap, interner);
    }

    fn parse_precedence(&mut self, min_prec: Precedence, heap: &mut Heap, interner: &mut Table) {
        self.advance(heap, interner);
        let can_assign = min_prec <= Precedence::Assign;
        if !self.parse_prefix(self.previous.kind, can_assign, heap, interner) {
            self.error("Expect expression.");
            return;
        }

        while let Some(prec) = infix_precedence(self.current.kind) {
            if prec < min_prec {
                break;
            }
            self.advance(heap, interner);
            self.parse_infix(self.previous.kind, can_assign, heap, interner);
        }

        if can_assign && self.match_token(TokenType::Equal, heap, interner) {
            self.error("Invalid assignment target.");
        }
    }

    fn parse_prefix(
        &mut self,
        kind: TokenType,
        can_assign: bool,
        heap: &mut Heap,
        interner: &mut Table,
    ) -> bool {
        match kind {
            TokenType::LeftParen => {
                if self.looks_like_arrow_params() {
                    self.arrow_function(heap, interner);
                } else {
                    self.grouping(heap, interner);
                }
            }
            TokenType::Minus => self.unary(heap, interner),
            TokenType::Bang => self.unary(heap, interner),
            TokenType::Number => self.number(),
            TokenType::String => self.string(heap, interner),
            TokenType::Char => self.char_literal(),
            TokenType::True => self.emit_op(OpCode::PushTrue),
            TokenType::False => self.emit_op(OpCode::PushFalse),
            TokenType::Nil => self.emit_op(OpCode::PushNil),
            TokenType::Identifier => self.variable(can_assign, heap, interner),
            TokenType::Fun => self.compile_function(FnKind::Function, None, heap, interner),
            _ => return false,
        }
        true
    }

    fn parse_infix(&mut self, kind: TokenType, can_assign: bool, heap: &mut Heap, interner: &mut Table) {
        match kind {
            TokenType::Comma => {
                self.emit_op(OpCode::Pop);
                self.parse_precedence(Precedence::Assign, heap, interner);
            }
            TokenType::Question => self.ternary(heap, interner),
            TokenType::Or => self.or_(heap, interner),
            TokenType::And => self.and_(heap, interner),
            TokenType::Plus
            | TokenType::Minus
            | TokenType::Star
            | TokenType::Slash
            | TokenType::Percent
            | TokenType::EqualEqual
            | TokenType::BangEqual
            | TokenType::Less
            | TokenType::LessEqual
            | TokenType::Greater
            | TokenType::GreaterEqual => self.binary(kind, heap, interner),
            TokenType::LeftParen => self.call(heap, interner),
            TokenType::PlusEqual
            | TokenType::MinusEqual
            | TokenType::StarEqual
            | TokenType::SlashEqual
            | TokenType::PercentEqual => {
                // Handled as a prefix continuation from `variable()`; reaching
                // here means the LHS wasn't an assignable place.
                let _ = can_assign;
                self.error("Invalid assignment target.");
            }
            _ => unreachable!("infix_precedence admitted a token with no handler"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, interner: &mut Table) {
        self.expression(heap, interner);
        self.consume(TokenType::RightParen, "Expect ')' after expression.", heap, interner);
    }

    fn unary(&mut self, heap: &mut Heap, interner: &mut Table) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Prefix, heap, interner);
        match op_kind {
            TokenType::Minus => self.emit_op(OpCode::Neg),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenType, heap: &mut Heap, interner: &mut Table) {
        let prec = infix_precedence(kind).expect("binary token always has a precedence");
        self.parse_precedence(prec.next(), heap, interner);
        match kind {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Sub),
            TokenType::Star => self.emit_op(OpCode::Mul),
            TokenType::Slash => self.emit_op(OpCode::Div),
            TokenType::Percent => self.emit_op(OpCode::Mod),
            TokenType::EqualEqual => self.emit_op(OpCode::Teq),
            TokenType::BangEqual => {
                self.emit_op(OpCode::Teq);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Tlt),
            TokenType::Greater => self.emit_op(OpCode::Tgt),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Tgt);
                self.emit_op(OpCode::Not);
            }
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Tlt);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    /// `cond ? a : b`. Right-associative: both branches parse at `Cond`
    /// precedence so `a ? b : c ? d : e` reads as `a ? b : (c ? d : e)`.
    fn ternary(&mut self, heap: &mut Heap, interner: &mut Table) {
        let else_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Cond, heap, interner);
        let end_jump = self.emit_jump(OpCode::Jmp);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenType::Colon, "Expect ':' in ternary expression.", heap, interner);
        self.parse_precedence(Precedence::Cond, heap, interner);

        self.patch_jump(end_jump);
    }

    /// `lhs and rhs`, using a peek-only conditional jump plus an explicit
    /// `POP` on the taken path (equivalent to a single `JUMP_IF_FALSE_OR_POP`
    /// instruction, without needing one): false short-circuits, leaving the
    /// falsy LHS on the stack; true discards it and evaluates `rhs`.
    fn and_(&mut self, heap: &mut Heap, interner: &mut Table) {
        let end_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And.next(), heap, interner);
        self.patch_jump(end_jump);
    }

    /// `lhs or rhs`: true short-circuits leaving the truthy LHS on the
    /// stack; false discards it and evaluates `rhs`.
    fn or_(&mut self, heap: &mut Heap, interner: &mut Table) {
        let else_jump = self.emit_jump(OpCode::JmpFalse);
        let end_jump = self.emit_jump(OpCode::Jmp);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or.next(), heap, interner);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_else(|_| {
            self.error("Invalid number literal.");
            0.0
        });
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, heap: &mut Heap, interner: &mut Table) {
        let raw = self.previous.lexeme;
        let inner = &raw[1..raw.len() - 1];
        let decoded = decode_escapes(inner);
        let obj_ref = ember_core::intern(heap, interner, &decoded);
        self.emit_constant(Value::Obj(obj_ref));
    }

    fn char_literal(&mut self) {
        let raw = self.previous.lexeme;
        let inner = &raw[1..raw.len() - 1];
        let decoded = decode_escapes(inner);
        let byte = decoded.as_bytes().first().copied().unwrap_or(0);
        self.emit_constant(Value::Char(byte));
    }

    fn variable(&mut self, can_assign: bool, heap: &mut Heap, interner: &mut Table) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign, heap, interner);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool, heap: &mut Heap, interner: &mut Table) {
        let idx = self.functions.len() - 1;
        let (push_op, pop_op, slot) = if let Some((slot, uninitialized)) =
            Self::resolve_local(&self.functions[idx], name)
        {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            (OpCode::PushLocal, OpCode::PopLocal, slot)
        } else if let Some(slot) = Self::resolve_upvalue(&mut self.functions, idx, name) {
            (OpCode::PushUpvalue, OpCode::PopUpvalue, slot)
        } else {
            let name_ref = self.intern_identifier(name, heap, interner);
            let slot = match self.chunk().add_constant(Value::Obj(name_ref)) {
                Some(idx) => idx,
                None => {
                    self.error("Too many constants in one chunk.");
                    0
                }
            };
            (OpCode::PushGlobal, OpCode::PopGlobal, slot)
        };

        if can_assign && self.match_token(TokenType::Equal, heap, interner) {
            self.expression(heap, interner);
            self.emit_op(OpCode::Push);
            self.emit_op_u8(pop_op, slot);
        } else {
            self.emit_op_u8(push_op, slot);
            if can_assign {
                if let Some(arith) = self.try_consume_compound_assign(heap, interner) {
                    self.parse_precedence(Precedence::Assign, heap, interner);
                    self.emit_op(arith);
                    self.emit_op(OpCode::Push);
                    self.emit_op_u8(pop_op, slot);
                }
            }
        }
    }

    fn try_consume_compound_assign(&mut self, heap: &mut Heap, interner: &mut Table) -> Option<OpCode> {
        let op = match self.current.kind {
            TokenType::PlusEqual => OpCode::Add,
            TokenType::MinusEqual => OpCode::Sub,
            TokenType::StarEqual => OpCode::Mul,
            TokenType::SlashEqual => OpCode::Div,
            TokenType::PercentEqual => OpCode::Mod,
            _ => return None,
        };
        self.advance(heap, interner);
        Some(op)
    }

    fn call(&mut self, heap: &mut Heap, interner: &mut Table) {
        let mut arg_count: u8 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.parse_precedence(Precedence::Assign, heap, interner);
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    arg_count += 1;
                }
                if !self.match_token(TokenType::Comma, heap, interner) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.", heap, interner);
        self.emit_op_u8(OpCode::Call, arg_count);
    }
}

/// Precedence of `kind` used as an infix operator, or `None` if it never
/// appears in infix position.
fn infix_precedence(kind: TokenType) -> Option<Precedence> {
    use TokenType::*;
    Some(match kind {
        Comma => Precedence::Comma,
        Question => Precedence::Cond,
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equal,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comp,
        Plus | Minus => Precedence::Sum,
        Star | Slash | Percent => Precedence::Prod,
        LeftParen => Precedence::Postfix,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disassemble::disassemble_chunk;
    use ember_core::Heap;

    fn compile_ok(src: &str) -> (ObjRef, Heap, Table) {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let result = compile(src, &mut heap, &mut interner);
        let func_ref = result.unwrap_or_else(|e| panic!("{src}: {e}"));
        (func_ref, heap, interner)
    }

    fn dump(src: &str) -> String {
        let (func_ref, heap, _interner) = compile_ok(src);
        let chunk = heap.as_function(func_ref).chunk.clone();
        disassemble_chunk(&chunk, "test", &heap)
    }

    #[test]
    fn arithmetic_precedence_emits_mul_before_add() {
        let text = dump("1 + 2 * 3;");
        let mul_pos = text.find("MUL").unwrap();
        let add_pos = text.find("ADD").unwrap();
        assert!(mul_pos < add_pos, "* must be emitted before + for correct precedence:\n{text}");
    }

    #[test]
    fn global_declaration_emits_def_global() {
        let text = dump("var x = 1;");
        assert!(text.contains("DEF_GLOBAL"));
    }

    #[test]
    fn local_variables_use_local_slots_not_globals() {
        let text = dump("{ var x = 1; x = x + 1; }");
        assert!(text.contains("PUSH_LOCAL"));
        assert!(text.contains("POP_LOCAL"));
        assert!(!text.contains("GLOBAL"));
    }

    #[test]
    fn closures_over_locals_emit_push_closure_and_upvalue_ops() {
        let text = dump("fun outer() { var c = 0; fun inner() { c = c + 1; return c; } return inner; }");
        assert!(text.contains("PUSH_CLOSURE"));
        assert!(text.contains("PUSH_UPVALUE"));
        assert!(text.contains("POP_UPVALUE"));
    }

    #[test]
    fn bare_function_with_no_upvalues_skips_closure_allocation() {
        let text = dump("fun add(a, b) { return a + b; }");
        assert!(!text.contains("PUSH_CLOSURE"));
    }

    #[test]
    fn compound_assignment_desugars_to_op_then_reload() {
        let text = dump("var x = 1; x += 2;");
        assert!(text.contains("ADD"));
        assert!(text.contains("PUSH") || text.contains("PUSH_GLOBAL"));
    }

    #[test]
    fn not_equal_and_comparisons_piggyback_on_not() {
        let text = dump("1 != 2; 1 <= 2; 1 >= 2;");
        assert_eq!(text.matches("TEQ").count(), 1); // from !=
        assert_eq!(text.matches("TGT").count(), 1); // from <=
        assert_eq!(text.matches("TLT").count(), 1); // from >=
        assert_eq!(text.matches("NOT").count(), 3);
    }

    #[test]
    fn while_loop_jumps_backward() {
        let text = dump("while (true) { break; }");
        assert!(text.contains("JMP_FALSE"));
        assert!(text.contains("JMP"));
    }

    #[test]
    fn for_loop_compiles_all_three_clauses() {
        let text = dump("for (var i = 0; i < 3; i = i + 1) { println(i); }");
        assert!(text.contains("PUSH_LOCAL"));
        assert!(text.contains("TLT"));
        assert!(text.contains("JMP_FALSE"));
    }

    #[test]
    fn switch_statement_compiles_case_comparisons() {
        let text = dump("switch (1) { case 1: println(\"one\"); default: println(\"other\"); }");
        assert!(text.contains("TEQ"));
        assert!(text.contains("JMP_FALSE"));
    }

    #[test]
    fn ternary_compiles_to_conditional_jumps() {
        let text = dump("true ? 1 : 2;");
        assert!(text.contains("JMP_FALSE"));
        assert!(text.contains("JMP"));
    }

    #[test]
    fn string_literal_decodes_escapes_at_compile_time() {
        let (func_ref, heap, _interner) = compile_ok(r#"var s = "a\nb";"#);
        let chunk = &heap.as_function(func_ref).chunk;
        let decoded = chunk
            .constants
            .iter()
            .find_map(|v| v.as_obj())
            .map(|r| heap.as_string(r).as_str().to_string())
            .filter(|s| s.contains('\n'));
        assert_eq!(decoded, Some("a\nb".to_string()));
    }

    #[test]
    fn self_reference_in_initializer_is_rejected() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let err = compile("{ var x = x; }", &mut heap, &mut interner).unwrap_err();
        assert_eq!(err.error_count, 1);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let err = compile("break;", &mut heap, &mut interner).unwrap_err();
        assert_eq!(err.error_count, 1);
    }

    #[test]
    fn return_at_top_level_is_a_compile_error() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let err = compile("return 1;", &mut heap, &mut interner).unwrap_err();
        assert_eq!(err.error_count, 1);
    }

    #[test]
    fn duplicate_local_in_same_scope_is_a_compile_error() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let err = compile("{ var x = 1; var x = 2; }", &mut heap, &mut interner).unwrap_err();
        assert_eq!(err.error_count, 1);
    }

    #[test]
    fn unterminated_block_reports_error_and_recovers() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        // two separate bad statements, separated by a semicolon, should
        // synchronize rather than cascading into dozens of errors.
        let err = compile("var; var;", &mut heap, &mut interner).unwrap_err();
        assert_eq!(err.error_count, 2);
    }

    #[test]
    fn anonymous_function_expression_compiles() {
        let text = dump("var f = (x) -> x + 1;");
        assert!(text.contains("RET"));
    }
}
