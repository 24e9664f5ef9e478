//! The bytecode stack machine: fetch-dispatch loop, call frames, upvalue
//! lifecycle and the call/return protocol (user functions, closures and
//! host builtins share one calling convention).

use crate::builtins;
use crate::error::{RuntimeError, VmError};
use ember_core::{
    Chunk, Heap, Obj, ObjClosure, ObjRef, ObjUpvalue, Table, UpvalueLocation, Value, MAX_CALLS,
    STACK_MAX,
};
use std::time::Instant;

/// One active call: which function's bytecode is executing, which closure
/// (if any) supplies its upvalues, the stack slot its locals are counted
/// from, and the next instruction to fetch.
pub(crate) struct CallFrame {
    pub(crate) function: ObjRef,
    pub(crate) closure: Option<ObjRef>,
    pub(crate) fp: usize,
    pub(crate) ip: usize,
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interner: Table,
    pub(crate) globals: Table,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Upvalues still pointing into the live stack, sorted by descending
    /// stack slot so closing a range is a linear scan from the head.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) gc_enabled: bool,
    pub(crate) gc_threshold: usize,
    start_time: Instant,
    dump: bool,
}

enum ControlFlow {
    Continue,
    Halt,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let mut globals = Table::new();
        for b in builtins::BUILTINS {
            let name_ref = ember_core::intern(&mut heap, &mut interner, b.name);
            globals.set(&heap, name_ref, Value::Builtin(*b));
        }
        Vm {
            heap,
            interner,
            globals,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            gc_enabled: true,
            gc_threshold: 1024,
            start_time: Instant::now(),
            dump: false,
        }
    }

    /// When set, each `interpret` call prints the compiled chunk's
    /// disassembly (and any nested functions) before running it — the
    /// CLI's `--dump`/`--disassemble` flag.
    pub fn set_dump(&mut self, dump: bool) {
        self.dump = dump;
    }

    /// Compile and run `source` against this VM's heap, globals and
    /// interner, which persist across calls so a REPL can build on
    /// previous lines. Diagnostics (compile errors, runtime errors and
    /// traces) are printed to stderr before the error is returned.
    pub fn interpret(&mut self, source: &str) -> Result<(), VmError> {
        self.gc_enabled = false;
        let compiled = ember_compiler::compile(source, &mut self.heap, &mut self.interner);
        self.gc_enabled = true;
        let func_ref = compiled.map_err(VmError::Compile)?;

        if self.dump {
            let chunk = self.heap.as_function(func_ref).chunk.clone();
            print!("{}", ember_compiler::disassemble_chunk(&chunk, "script", &self.heap));
        }

        self.stack.push(Value::Obj(func_ref));
        self.frames.push(CallFrame { function: func_ref, closure: None, fp: 0, ip: 0 });

        let result = self.run();

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        result.map_err(VmError::Runtime)
    }

    // --- fetch helpers ----------------------------------------------------

    fn current_chunk_ptr(&self, func: ObjRef) -> &Chunk {
        &self.heap.as_function(func).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("run() always holds a frame");
        let ip = frame.ip;
        frame.ip += 1;
        let func = frame.function;
        self.current_chunk_ptr(func).code[ip]
    }

    fn read_i16(&mut self) -> i16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        i16::from_le_bytes([lo, hi])
    }

    fn jump(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("run() always holds a frame");
        frame.ip = (frame.ip as isize + offset as isize) as usize;
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("run() always holds a frame");
        self.current_chunk_ptr(frame.function)
            .line_for_offset(frame.ip.saturating_sub(1))
    }

    fn constant(&self, idx: u8) -> Value {
        let frame = self.frames.last().expect("run() always holds a frame");
        self.current_chunk_ptr(frame.function).constants[idx as usize]
    }

    // --- allocation (GC-checked) -------------------------------------------

    fn maybe_collect(&mut self) {
        if self.gc_enabled && self.heap.bytes_allocated() >= self.gc_threshold {
            self.collect();
        }
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        ember_core::intern(&mut self.heap, &mut self.interner, s)
    }

    // --- upvalues -----------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            match self.heap.as_upvalue(r).location {
                UpvalueLocation::Open(s) if s == slot => return r,
                UpvalueLocation::Open(s) if s < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let r = self.alloc(Obj::Upvalue(ObjUpvalue { location: UpvalueLocation::Open(slot) }));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    fn close_upvalues_from(&mut self, from_slot: usize) {
        while let Some(&top) = self.open_upvalues.first() {
            let slot = match self.heap.as_upvalue(top).location {
                UpvalueLocation::Open(s) => s,
                UpvalueLocation::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let Obj::Upvalue(u) = self.heap.get_mut(top) {
                u.location = UpvalueLocation::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // --- calls ---------------------------------------------------------------

    fn do_call(&mut self, nargs: u8) -> Result<(), RuntimeError> {
        let nargs = nargs as usize;
        let callee_slot = self.stack.len() - nargs - 1;
        let callee = self.stack[callee_slot];

        let (func_ref, closure_ref) = match callee {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Function(_) => (r, None),
                Obj::Closure(c) => (c.function, Some(r)),
                _ => return Err(RuntimeError::NotCallable),
            },
            Value::Builtin(b) => return self.call_builtin(b, callee_slot, nargs),
            _ => return Err(RuntimeError::NotCallable),
        };

        let arity = self.heap.as_function(func_ref).arity as usize;
        if arity != nargs {
            return Err(RuntimeError::ArityMismatch { expected: arity, got: nargs });
        }
        if self.frames.len() >= MAX_CALLS {
            return Err(RuntimeError::CallDepthExceeded);
        }
        self.frames.push(CallFrame { function: func_ref, closure: closure_ref, fp: callee_slot, ip: 0 });
        Ok(())
    }

    fn call_builtin(
        &mut self,
        b: ember_core::Builtin,
        callee_slot: usize,
        nargs: usize,
    ) -> Result<(), RuntimeError> {
        if b.arity as usize != nargs {
            return Err(RuntimeError::ArityMismatch { expected: b.arity as usize, got: nargs });
        }
        let args: Vec<Value> = self.stack[callee_slot + 1..].to_vec();
        let result = builtins::call(b.id, &args, &mut self.heap, &mut self.interner, self.start_time)?;
        self.stack.truncate(callee_slot);
        self.stack.push(result);
        Ok(())
    }

    fn push_closure(&mut self, const_idx: u8) {
        let frame_fp = self.frames.last().unwrap().fp;
        let parent_closure = self.frames.last().unwrap().closure;
        let func_ref = self.constant(const_idx).as_obj().expect("PUSH_CLOSURE operand names a Function constant");
        let descriptors = self.heap.as_function(func_ref).upvalues.clone();

        let mut upvalues = Vec::with_capacity(descriptors.len());
        for d in &descriptors {
            if d.is_local_in_parent {
                upvalues.push(self.capture_upvalue(frame_fp + d.source_index as usize));
            } else {
                let pc = parent_closure.expect("non-local upvalue descriptor needs an enclosing closure");
                upvalues.push(self.heap.as_closure(pc).upvalues[d.source_index as usize]);
            }
        }
        let closure_ref = self.alloc(Obj::Closure(ObjClosure { function: func_ref, upvalues }));
        self.stack.push(Value::Obj(closure_ref));
    }

    // --- value helpers --------------------------------------------------------

    fn is_string(&self, v: Value) -> bool {
        matches!(v.as_obj(), Some(r) if matches!(self.heap.get(r), Obj::String(_)))
    }

    fn stringify(&self, v: Value) -> String {
        self.heap.display_value(v)
    }

    fn frame_display_name(&self, idx: usize) -> String {
        let func = self.frames[idx].function;
        match self.heap.as_function(func).name {
            Some(n) => format!("<fn {}>", self.heap.as_string(n).as_str()),
            None if idx == 0 => "<script>".to_string(),
            None => "<anonymous fn>".to_string(),
        }
    }

    fn report_runtime_error(&self, err: &RuntimeError) {
        eprintln!("Runtime error at line {}: {err}", self.current_line());
        for (idx, frame) in self.frames.iter().enumerate().rev().skip(1) {
            let line = self.current_chunk_ptr(frame.function).line_for_offset(frame.ip.saturating_sub(1));
            eprintln!("from call of {} at line {line}", self.frame_display_name(idx));
        }
    }

    // --- the loop ---------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = ember_core::OpCode::from_u8(byte).expect("compiler never emits an unknown opcode");
            match self.execute(op) {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::Halt) => return Ok(()),
                Err(e) => {
                    self.report_runtime_error(&e);
                    return Err(e);
                }
            }
        }
    }

    fn execute(&mut self, op: ember_core::OpCode) -> Result<ControlFlow, RuntimeError> {
        use ember_core::OpCode::*;
        match op {
            Nop => {}
            PushConst => {
                let idx = self.read_byte();
                self.stack.push(self.constant(idx));
            }
            PushNil => self.stack.push(Value::Nil),
            PushTrue => self.stack.push(Value::Bool(true)),
            PushFalse => self.stack.push(Value::Bool(false)),
            Push => {
                let top = *self.stack.last().expect("PUSH requires a value on the stack");
                self.stack.push(top);
            }
            Pop => {
                self.stack.pop();
                let len = self.stack.len();
                self.close_upvalues_from(len);
            }
            PopN => {
                let n = self.read_byte() as usize;
                let new_len = self.stack.len() - n;
                self.stack.truncate(new_len);
                self.close_upvalues_from(new_len);
            }
            DefGlobal => {
                let idx = self.read_byte();
                let name_ref = self.constant(idx).as_obj().expect("DEF_GLOBAL operand names a string constant");
                let value = self.stack.pop().expect("DEF_GLOBAL requires a value on the stack");
                self.globals.set(&self.heap, name_ref, value);
            }
            PushGlobal => {
                let idx = self.read_byte();
                let name_ref = self.constant(idx).as_obj().expect("PUSH_GLOBAL operand names a string constant");
                match self.globals.get(&self.heap, name_ref) {
                    Some(v) => self.stack.push(v),
                    None => {
                        let name = self.heap.as_string(name_ref).as_str().to_string();
                        return Err(RuntimeError::UndefinedVariable(name));
                    }
                }
            }
            PopGlobal => {
                let idx = self.read_byte();
                let name_ref = self.constant(idx).as_obj().expect("POP_GLOBAL operand names a string constant");
                let value = self.stack.pop().expect("POP_GLOBAL requires a value on the stack");
                if self.globals.get(&self.heap, name_ref).is_none() {
                    let name = self.heap.as_string(name_ref).as_str().to_string();
                    return Err(RuntimeError::UndefinedVariable(name));
                }
                self.globals.set(&self.heap, name_ref, value);
            }
            PushLocal => {
                let slot = self.read_byte() as usize;
                let fp = self.frames.last().unwrap().fp;
                self.stack.push(self.stack[fp + slot]);
            }
            PopLocal => {
                let slot = self.read_byte() as usize;
                let fp = self.frames.last().unwrap().fp;
                let value = self.stack.pop().expect("POP_LOCAL requires a value on the stack");
                self.stack[fp + slot] = value;
            }
            PushUpvalue => {
                let idx = self.read_byte() as usize;
                let closure = self.frames.last().unwrap().closure.expect("PUSH_UPVALUE requires an active closure");
                let up_ref = self.heap.as_closure(closure).upvalues[idx];
                let value = match self.heap.as_upvalue(up_ref).location {
                    UpvalueLocation::Open(slot) => self.stack[slot],
                    UpvalueLocation::Closed(v) => v,
                };
                self.stack.push(value);
            }
            PopUpvalue => {
                let idx = self.read_byte() as usize;
                let closure = self.frames.last().unwrap().closure.expect("POP_UPVALUE requires an active closure");
                let up_ref = self.heap.as_closure(closure).upvalues[idx];
                let value = self.stack.pop().expect("POP_UPVALUE requires a value on the stack");
                match self.heap.as_upvalue(up_ref).location {
                    UpvalueLocation::Open(slot) => self.stack[slot] = value,
                    UpvalueLocation::Closed(_) => {
                        self.heap.as_upvalue_mut(up_ref).location = UpvalueLocation::Closed(value);
                    }
                }
            }
            PushClosure => {
                let idx = self.read_byte();
                self.push_closure(idx);
            }
            Neg => {
                let v = self.stack.pop().expect("NEG requires a value on the stack");
                match v.as_number() {
                    Some(n) => self.stack.push(Value::Number(-n)),
                    None => return Err(RuntimeError::TypeMismatch("Operand must be a number.".into())),
                }
            }
            Not => {
                let v = self.stack.pop().expect("NOT requires a value on the stack");
                self.stack.push(Value::Bool(v.is_falsey()));
            }
            Add => {
                let b = self.stack.pop().expect("ADD requires two values");
                let a = self.stack.pop().expect("ADD requires two values");
                let result = match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => Value::Number(x + y),
                    _ if self.is_string(a) || self.is_string(b) => {
                        let concatenated = format!("{}{}", self.stringify(a), self.stringify(b));
                        Value::Obj(self.intern(&concatenated))
                    }
                    _ => {
                        return Err(RuntimeError::TypeMismatch(
                            "Operands must be two numbers or involve a string.".into(),
                        ))
                    }
                };
                self.stack.push(result);
            }
            Sub => self.numeric_binop(|x, y| x - y)?,
            Mul => self.numeric_binop(|x, y| x * y)?,
            Div => self.numeric_binop(|x, y| x / y)?,
            Mod => self.numeric_binop(|x, y| x % y)?,
            Teq => {
                let b = self.stack.pop().expect("TEQ requires two values");
                let a = self.stack.pop().expect("TEQ requires two values");
                self.stack.push(Value::Bool(a == b));
            }
            Tlt => self.comparison(|x, y| x < y)?,
            Tgt => self.comparison(|x, y| x > y)?,
            Jmp => {
                let offset = self.read_i16();
                self.jump(offset);
            }
            JmpTrue => {
                let offset = self.read_i16();
                let cond = *self.stack.last().expect("JMP_TRUE requires a value on the stack");
                if !cond.is_falsey() {
                    self.jump(offset);
                }
            }
            JmpFalse => {
                let offset = self.read_i16();
                let cond = *self.stack.last().expect("JMP_FALSE requires a value on the stack");
                if cond.is_falsey() {
                    self.jump(offset);
                }
            }
            Call => {
                let nargs = self.read_byte();
                self.do_call(nargs)?;
            }
            Ret => {
                let value = self.stack.pop().expect("RET requires a value on the stack");
                if self.frames.len() == 1 {
                    self.frames.pop();
                    return Ok(ControlFlow::Halt);
                }
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.fp);
                self.close_upvalues_from(frame.fp);
                self.stack.push(value);
            }
        }
        Ok(ControlFlow::Continue)
    }

    fn numeric_binop(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.stack.pop().expect("binary op requires two values");
        let a = self.stack.pop().expect("binary op requires two values");
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.stack.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch("Operands must be numbers.".into())),
        }
    }

    fn comparison(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.stack.pop().expect("comparison requires two values");
        let a = self.stack.pop().expect("comparison requires two values");
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.stack.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch("Operands must be numbers.".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(vm: &mut Vm, src: &str) {
        vm.interpret(src).unwrap_or_else(|e| panic!("{src}: {e}"));
    }

    #[test]
    fn arithmetic_and_globals() {
        let mut vm = Vm::new();
        run_ok(&mut vm, "var x = 1 + 2 * 3; var y = x;");
        let x_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "x");
        assert_eq!(vm.globals.get(&vm.heap, x_ref), Some(Value::Number(7.0)));
    }

    #[test]
    fn string_concat_coerces_numbers() {
        let mut vm = Vm::new();
        run_ok(&mut vm, r#"var s = "n=" + 5;"#);
        let s_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "s");
        let v = vm.globals.get(&vm.heap, s_ref).unwrap();
        assert_eq!(vm.heap.display_value(v), "n=5");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("println(missing);").unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::UndefinedVariable(_))));
    }

    #[test]
    fn recursive_function_call() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } var r = fib(10);",
        );
        let r_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "r");
        assert_eq!(vm.globals.get(&vm.heap, r_ref), Some(Value::Number(55.0)));
    }

    #[test]
    fn closures_capture_distinct_loop_state() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            "var fns = nil; var a; var b;
             fun make(n) { return () -> n; }
             a = make(1); b = make(2);
             var av = a(); var bv = b();",
        );
        let av_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "av");
        let bv_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "bv");
        assert_eq!(vm.globals.get(&vm.heap, av_ref), Some(Value::Number(1.0)));
        assert_eq!(vm.globals.get(&vm.heap, bv_ref), Some(Value::Number(2.0)));
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        let mut vm = Vm::new();
        run_ok(&mut vm, "fun f(a, b) { return a + b; }");
        let err = vm.interpret("f(1);").unwrap_err();
        assert!(matches!(
            err,
            VmError::Runtime(RuntimeError::ArityMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn calling_a_non_callable_value_errors() {
        let mut vm = Vm::new();
        run_ok(&mut vm, "var x = 1;");
        let err = vm.interpret("x();").unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::NotCallable)));
    }

    #[test]
    fn break_in_switch_nested_in_loop_exits_only_the_switch() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            "var log = \"\";
             for (var i = 0; i < 3; i = i + 1) {
                 switch (i) {
                     case 1: log = log + \"s\"; break;
                     default: log = log + \"d\";
                 }
                 log = log + \"i\";
             }",
        );
        let log_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "log");
        let v = vm.globals.get(&vm.heap, log_ref).unwrap();
        // every loop iteration still runs to completion ("i" appended each
        // time) — a break that escaped to the `for` loop instead of just
        // the `switch` would truncate this to "disi" or shorter.
        assert_eq!(vm.heap.display_value(v), "disidi");
    }
}
