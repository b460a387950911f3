//! The bytecode virtual machine.

use std::collections::HashMap;

use crate::compiler;
use crate::gc::ActiveGC;
use crate::prelude::{Chunk, InterpretationError, OpCode, Value};

/// The fixed capacity of the value stack. Backed by a growable [Vec] for convenience, but
/// [VmWithChunk::push] enforces this limit and reports a runtime error once it's reached.
const STACK_SIZE: usize = 256;

/// Maintains state for the Lox virtual machine.
///
/// Owns the global variable table, which persists across multiple calls to
/// [VM::interpret] -- useful for a REPL, where each line is compiled and run separately, but
/// `var`s defined on one line should be visible on the next.
#[derive(Default)]
pub struct VM {
    globals: HashMap<&'static str, Value>,
}

/// A VM with an active chunk.
struct VmWithChunk<'a> {
    /// Instruction pointer --- index into the chunk for the next opcode to be executed
    // TODO: convert to slice?
    ip: usize,
    /// Value stack -- modified as elements are pushed and popped from the stack.
    stack: Vec<Value>,
    chunk: &'a Chunk,
    globals: &'a mut HashMap<&'static str, Value>,
}

/// Fetches the next bytecode in the chunk, **AND** increments the instruction pointer.
///
/// Note: use [current_ip] to get the "current" value of the instruction pointer being executed
/// right now.
macro_rules! next_bytecode {
    ($self: ident, $chunk: ident) => {{
        let byte = $chunk.get($self.ip);
        $self.ip += 1;
        byte
    }};
}

/// Gets the value of the current instruction pointer. To be used in conjunction with
/// [next_bytecode].
macro_rules! current_ip {
    ($self: ident) => {
        $self.ip - 1
    };
}

impl VM {
    /// Creates a fresh VM, with no global variables defined.
    pub fn new() -> VM {
        VM::default()
    }

    /// Compile and interpret the given Lox source code.
    ///
    /// Installs a fresh [ActiveGC] for the duration of the call, since string literals and
    /// runtime string concatenation both need somewhere to intern their contents. Globals defined
    /// by a previous call survive to the next, but any strings they reference remain valid only as
    /// long as some [ActiveGC] stays installed -- see [crate::gc] for the whole story.
    pub fn interpret(&mut self, source: &str) -> crate::Result<()> {
        // Keep the GC alive for the whole call: interned strings (both string constants and
        // anything produced at runtime by `Add`) are only valid while this guard is installed,
        // and globals read back out of `self.globals` during `run()` must still point at live
        // memory.
        let gc = ActiveGC::install();
        let chunk = compiler::compile(source, &gc)?;

        let mut vm = VmWithChunk {
            ip: 0,
            stack: Vec::with_capacity(STACK_SIZE),
            chunk: &chunk,
            globals: &mut self.globals,
        };
        vm.run()
    }
}

impl<'a> VmWithChunk<'a> {
    /// The main opcode interpreter loop.
    fn run(&mut self) -> crate::Result<()> {
        use OpCode::*;
        let chunk = self.chunk;

        loop {
            if cfg!(feature = "trace_execution") {
                use crate::debug::disassemble_instruction;

                // Prints the current stack:
                print!("        ");
                for value in self.stack.iter() {
                    print!("[ {value:?} ]")
                }
                println!();

                // Print the next instruction:
                disassemble_instruction(chunk, self.ip);
            }

            let opcode = next_bytecode!(self, chunk)
                .expect("I have an instruction pointer within range")
                .as_opcode();

            match opcode {
                Some(Constant) => {
                    let constant = next_bytecode!(self, chunk)
                        .expect("there should be an operand")
                        .resolve_constant()
                        .expect("there should be a constant at this index");
                    self.push(constant)?;
                }
                Some(Nil) => self.push(Value::Nil)?,
                Some(True) => self.push(true.into())?,
                Some(False) => self.push(false.into())?,
                Some(Pop) => {
                    self.pop();
                }
                Some(GetLocal) => {
                    let slot = self.read_byte_operand();
                    self.push(self.stack[slot])?;
                }
                Some(SetLocal) => {
                    let slot = self.read_byte_operand();
                    self.stack[slot] = self.peek(0);
                }
                Some(GetGlobal) => {
                    let name = self.read_string_constant();
                    match self.globals.get(name) {
                        Some(value) => self.push(*value)?,
                        None => {
                            let message = format!("Undefined variable '{name}'.");
                            self.runtime_error(&message)?
                        }
                    }
                }
                Some(DefineGlobal) => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                Some(SetGlobal) => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    if self.globals.insert(name, value).is_none() {
                        // There was nothing there before: this is not an assignment, it's an
                        // implicit (and disallowed) declaration.
                        self.globals.remove(name);
                        let message = format!("Undefined variable '{name}'.");
                        self.runtime_error(&message)?
                    }
                }
                Some(Equal) => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(lhs.lox_equal(&rhs).into())?;
                }
                Some(Greater) => self.binary_number_op(|a, b| a > b)?,
                Some(Less) => self.binary_number_op(|a, b| a < b)?,
                Some(Add) => self.add()?,
                Some(Subtract) => self.binary_number_op(|a, b| a - b)?,
                Some(Multiply) => self.binary_number_op(|a, b| a * b)?,
                Some(Divide) => self.binary_number_op(|a, b| a / b)?,
                Some(Not) => {
                    let value = self.pop();
                    self.push(value.is_falsy().into())?;
                }
                Some(Negate) => {
                    if let Value::Number(number) = self.peek(0) {
                        self.pop();
                        self.push((-number).into())?;
                    } else {
                        self.runtime_error("Operand must be a number.")?
                    }
                }
                Some(Print) => {
                    let value = self.pop();
                    println!("{value}");
                }
                Some(Jump) => {
                    let offset = self.read_short();
                    self.ip += offset as usize;
                }
                Some(JumpIfFalse) => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsy() {
                        self.ip += offset as usize;
                    }
                }
                Some(Loop) => {
                    let offset = self.read_short();
                    self.ip -= offset as usize;
                }
                Some(Return) => {
                    // There are no functions yet, so reaching the end of the top-level script is
                    // the only way to get here.
                    return Ok(());
                }
                None => panic!("fetched invalid opcode at {}", current_ip!(self)),
            }
        }
    }

    fn runtime_error<T>(&mut self, message: &str) -> crate::Result<T> {
        eprintln!("{message}");

        let line = self
            .chunk
            .line_number_for(current_ip!(self))
            .expect("line number");
        eprintln!("[line {line}] in script");

        self.reset_stack();

        Err(InterpretationError::RuntimeError)
    }

    /// Pops two operands on the stack to perform a binary operation that returns a number or
    /// boolean. Reports a runtime error if either operand isn't a number.
    fn binary_number_op<F, T>(&mut self, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> T,
        T: Into<Value>,
    {
        let rhs = self.pop();
        let lhs = self.pop();

        use Value::Number;
        match (lhs, rhs) {
            (Number(a), Number(b)) => self.push(op(a, b).into())?,
            (_, _) => self.runtime_error("Operands must be numbers.")?,
        };

        Ok(())
    }

    /// Implements `+`, which is overloaded: it adds two numbers, or concatenates two strings.
    fn add(&mut self) -> crate::Result<()> {
        let rhs = self.pop();
        let lhs = self.pop();

        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => self.push((a + b).into())?,
            (Value::String(a), Value::String(b)) => {
                let concatenated = format!("{a}{b}");
                self.push(concatenated.into())?;
            }
            (_, _) => self.runtime_error("Operands must be two numbers or two strings.")?,
        };

        Ok(())
    }

    /// Reads a one-byte operand (e.g. a local slot, or a constant index) and advances the
    /// instruction pointer.
    fn read_byte_operand(&mut self) -> usize {
        let chunk = self.chunk;
        next_bytecode!(self, chunk)
            .expect("there should be an operand")
            .as_constant_index()
    }

    /// Reads a two-byte big-endian jump offset and advances the instruction pointer.
    fn read_short(&mut self) -> u16 {
        let chunk = self.chunk;
        let hi = next_bytecode!(self, chunk)
            .expect("there should be a jump operand")
            .as_byte();
        let lo = next_bytecode!(self, chunk)
            .expect("there should be a jump operand")
            .as_byte();
        u16::from_be_bytes([hi, lo])
    }

    /// Reads a one-byte constant-pool index, resolves it, and unwraps it as a global's name.
    fn read_string_constant(&mut self) -> &'static str {
        let chunk = self.chunk;
        let constant = next_bytecode!(self, chunk)
            .expect("there should be an operand")
            .resolve_constant()
            .expect("there should be a constant at this index");

        match constant {
            Value::String(s) => s,
            _ => unreachable!("the compiler only ever emits string constants for names"),
        }
    }

    /// Pushes a [Value] on to the value stack.
    ///
    /// Reports a runtime error instead of pushing once the stack has reached [STACK_SIZE], since
    /// the language spec treats the value stack as a fixed-capacity array.
    fn push(&mut self, value: Value) -> crate::Result<()> {
        if self.stack.len() >= STACK_SIZE {
            return self.runtime_error("Stack overflow.");
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed Lox bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Peeks at the value relative to the top of the stack.
    ///
    /// # Panics
    ///
    ///  * When the stack is empty
    ///  * When the distance goes off the end of the stack
    #[inline(always)]
    fn peek(&self, distance: usize) -> Value {
        *self
            .stack
            .get(self.stack.len() - 1 - distance)
            .expect("peeked escaped bounds of the stack")
    }

    #[inline(always)]
    fn reset_stack(&mut self) {
        self.stack.clear()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn arithmetic_leaves_nothing_behind_and_does_not_error() {
        let mut vm = VM::new();
        assert!(vm.interpret("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    #[serial]
    fn strings_concatenate_with_plus() {
        let mut vm = VM::new();
        assert!(vm.interpret(r#"print "foo" + "bar";"#).is_ok());
    }

    #[test]
    #[serial]
    fn adding_a_number_to_a_string_is_a_runtime_error() {
        let mut vm = VM::new();
        let result = vm.interpret(r#"print 1 + "bar";"#);
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
    }

    #[test]
    #[serial]
    fn globals_persist_between_successive_interpret_calls() {
        let mut vm = VM::new();
        assert!(vm.interpret("var x = 10;").is_ok());
        assert!(vm.interpret("print x;").is_ok());
    }

    #[test]
    #[serial]
    fn reading_an_undefined_global_is_a_runtime_error() {
        let mut vm = VM::new();
        let result = vm.interpret("print undefined_name;");
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
    }

    #[test]
    #[serial]
    fn assigning_to_an_undefined_global_is_a_runtime_error() {
        let mut vm = VM::new();
        let result = vm.interpret("undefined_name = 1;");
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
    }

    #[test]
    #[serial]
    fn negating_a_non_number_is_a_runtime_error() {
        let mut vm = VM::new();
        let result = vm.interpret(r#"-"nope";"#);
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
    }

    #[test]
    #[serial]
    fn if_else_runs_only_the_taken_branch() {
        let mut vm = VM::new();
        assert!(vm
            .interpret("if (1) { print \"yes\"; } else { print \"no\"; }")
            .is_ok());
    }

    #[test]
    #[serial]
    fn while_loop_runs_to_completion() {
        let mut vm = VM::new();
        assert!(vm
            .interpret("var i = 1; while (i) { i = i - 1; }")
            .is_ok());
    }

    #[test]
    #[serial]
    fn locals_shadow_but_do_not_clobber_outer_scopes() {
        let mut vm = VM::new();
        assert!(vm
            .interpret("var a = 1; { var a = 2; print a; } print a;")
            .is_ok());
    }

    #[test]
    #[serial]
    fn and_short_circuits_without_evaluating_the_right_operand() {
        let mut vm = VM::new();
        // If short-circuiting were broken, this would error trying to treat the number 0 as
        // callable/whatever; instead it should stop after the falsy left-hand side.
        assert!(vm.interpret("print 0 and (1/0);").is_ok());
    }

    #[test]
    #[serial]
    fn filling_the_value_stack_past_capacity_is_a_runtime_error() {
        let mut vm = VM::new();

        // 256 locals fill the stack to exactly STACK_SIZE; the next value pushed (the `0`
        // literal below) has nowhere to go.
        let mut source = String::from("{\n");
        for i in 0..STACK_SIZE {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push_str("0;\n}\n");

        let result = vm.interpret(&source);
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
    }

    #[test]
    #[serial]
    fn or_short_circuits_without_evaluating_the_right_operand() {
        let mut vm = VM::new();
        assert!(vm.interpret("print 1 and 1 or (1/0);").is_ok());
    }
}
