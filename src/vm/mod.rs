//! The stack-based virtual machine. One engine owns the value stack, the
//! call frames, the global table, and the open-upvalue list; globals
//! survive across `interpret` calls so a REPL can accumulate state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use thiserror::Error;

use crate::chunk::OpCode;
use crate::compiler;
use crate::value::{
    BoundMethod, Class, Closure, Function, Instance, NativeFunction, Upvalue, Value, UINT8_COUNT,
};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

/// Outcome of one `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// A runtime failure. The engine turns this into a stderr report with a
/// stack trace and unwinds everything except the global table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }
}

/// One function activation: the closure being run, its instruction
/// pointer, and where its slot window starts on the value stack.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    stack_base: usize,
}

pub struct ExecutionEngine {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    /// Upvalues still pointing into the stack, ordered by slot descending
    /// so closing a range only ever inspects the front.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    out: Box<dyn Write>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        ExecutionEngine::new()
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        ExecutionEngine::with_output(Box::new(std::io::stdout()))
    }

    /// Builds an engine whose `print` output goes to `out` instead of
    /// stdout.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        ExecutionEngine {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            out,
        }
    }

    /// Compiles and runs `source`. Compile errors have already been
    /// reported token by token; runtime errors are reported here.
    pub fn interpret(&mut self, source: &str) -> ExecutionResult {
        let Some(function) = compiler::compile(source) else {
            return ExecutionResult::CompileError;
        };

        self.execute(function)
    }

    /// Runs an already-compiled script function. Compiled code holds no
    /// engine state, so the same function can be executed repeatedly.
    pub fn execute(&mut self, function: Rc<Function>) -> ExecutionResult {
        let closure = Rc::new(Closure::new(function));
        self.stack.push(Value::Closure(Rc::clone(&closure)));

        let outcome = self.call(closure, 0).and_then(|()| self.run());
        if let Err(error) = outcome {
            self.report_runtime_error(&error);
            return ExecutionResult::RuntimeError;
        }
        ExecutionResult::Ok
    }

    /// Registers a host function under a global name.
    pub fn define_native(
        &mut self,
        name: &str,
        function: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) {
        self.globals
            .insert(name.to_string(), Value::Native(NativeFunction::new(function)));
    }

    // Stack primitives

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new("Value stack underflow."))
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        let index = self
            .stack
            .len()
            .checked_sub(distance + 1)
            .ok_or_else(|| RuntimeError::new("Value stack underflow."))?;
        Ok(self.stack[index].clone())
    }

    // Instruction decoding

    fn frame(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::new("No active call frame."))
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self.frame()?;
        let byte = frame.closure.function.chunk.code(frame.ip);
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<usize, RuntimeError> {
        let high = self.read_byte()? as usize;
        let low = self.read_byte()? as usize;
        Ok((high << 8) | low)
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeError> {
        let index = self.read_byte()? as usize;
        let frame = self.frame()?;
        Ok(frame.closure.function.chunk.constant(index).clone())
    }

    fn read_string(&mut self) -> Result<String, RuntimeError> {
        match self.read_constant()? {
            Value::Str(s) => Ok(s.as_ref().clone()),
            _ => Err(RuntimeError::new("Expected a string constant.")),
        }
    }

    // Calls

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::Native(native) => {
                let start = self.stack.len() - arg_count as usize;
                let result = (native.0)(&self.stack[start..]).map_err(RuntimeError::new)?;
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Value::Class(class) => {
                let slot = self.stack.len() - arg_count as usize - 1;
                let instance = Rc::new(Instance::new(Rc::clone(&class)));
                self.stack[slot] = Value::Instance(instance);

                if let Some(init) = class.method("init") {
                    self.call(init, arg_count)
                } else if arg_count != 0 {
                    Err(RuntimeError::new(format!(
                        "Expected 0 arguments but got {arg_count}."
                    )))
                } else {
                    Ok(())
                }
            }
            Value::BoundMethod(bound) => {
                // The receiver takes the callee's slot, becoming "this".
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = Value::Instance(Rc::clone(&bound.receiver));
                self.call(Rc::clone(&bound.method), arg_count)
            }
            _ => Err(RuntimeError::new("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), RuntimeError> {
        if arg_count != closure.function.arity {
            return Err(RuntimeError::new(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            )));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::new("Stack Overflow."));
        }

        let stack_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_base,
        });
        Ok(())
    }

    fn invoke(&mut self, name: &str, arg_count: u8) -> Result<(), RuntimeError> {
        let Value::Instance(instance) = self.peek(arg_count as usize)? else {
            return Err(RuntimeError::new(
                "Only instances of classes have bound methods.",
            ));
        };

        // A field shadowing the method name wins, matching property access.
        let field = instance.fields.borrow().get(name).cloned();
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value.clone();
            return self.call_value(value, arg_count);
        }

        self.invoke_from_class(&instance.class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: &Rc<Class>,
        name: &str,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let Some(method) = class.method(name) else {
            return Err(RuntimeError::new(format!("Undefined property '{name}'.")));
        };
        self.call(method, arg_count)
    }

    fn bind_method(&mut self, class: &Rc<Class>, name: &str) -> Result<(), RuntimeError> {
        let Some(method) = class.method(name) else {
            return Err(RuntimeError::new(format!("Undefined property '{name}'.")));
        };

        let Value::Instance(receiver) = self.peek(0)? else {
            return Err(RuntimeError::new("Methods can only bind to instances."));
        };

        let bound = Value::BoundMethod(Rc::new(BoundMethod { receiver, method }));
        self.pop()?;
        self.push(bound);
        Ok(())
    }

    // Upvalues

    /// Returns the open upvalue for `slot`, creating one if no closure
    /// captured that slot yet. The list stays sorted by slot descending.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        for existing in &self.open_upvalues {
            if existing.borrow().is_open_at(slot) {
                return Rc::clone(existing);
            }
        }

        let created = Rc::new(RefCell::new(Upvalue::Open(slot)));
        let position = self
            .open_upvalues
            .iter()
            .position(|u| matches!(*u.borrow(), Upvalue::Open(s) if s < slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, Rc::clone(&created));
        created
    }

    /// Closes every open upvalue at or above `from_slot`, moving the
    /// captured stack value into the upvalue itself.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(first) = self.open_upvalues.first().cloned() {
            let slot = match *first.borrow() {
                Upvalue::Open(slot) => slot,
                Upvalue::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }

            let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
            *first.borrow_mut() = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // Operand helpers

    fn numeric_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => Ok((a, b)),
            _ => Err(RuntimeError::new("Operands must be numbers.")),
        }
    }

    fn array_index_operand(value: Value, len: usize, message: &str) -> Result<usize, RuntimeError> {
        let Value::Number(index) = value else {
            return Err(RuntimeError::new("Index is not a number."));
        };
        let index = index as i64;
        if index < 0 || index as usize >= len {
            return Err(RuntimeError::new(message));
        }
        Ok(index as usize)
    }

    // The dispatch loop

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from_byte(self.read_byte()?)
                .ok_or_else(|| RuntimeError::new("Corrupt bytecode."))?;

            match op {
                OpCode::Const => {
                    let constant = self.read_constant()?;
                    self.push(constant);
                }
                OpCode::Null => self.push(Value::Null),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self
                        .stack
                        .get(base + slot)
                        .cloned()
                        .ok_or_else(|| RuntimeError::new("Stack slot out of range."))?;
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self.peek(0)?;
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string()?;
                    let value = self.globals.get(&name).cloned().ok_or_else(|| {
                        RuntimeError::new(format!("Undefined variable '{name}'."))
                    })?;
                    self.push(value);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_string()?;
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::new(format!(
                            "Undefined variable '{name}'."
                        )));
                    }
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .borrow()
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| RuntimeError::new("Upvalue slot out of range."))?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(stack_slot) => self
                            .stack
                            .get(*stack_slot)
                            .cloned()
                            .unwrap_or(Value::Null),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek(0)?;
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .borrow()
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| RuntimeError::new("Upvalue slot out of range."))?;
                    let open_slot = match &*upvalue.borrow() {
                        Upvalue::Open(stack_slot) => Some(*stack_slot),
                        Upvalue::Closed(_) => None,
                    };
                    match open_slot {
                        Some(stack_slot) => self.stack[stack_slot] = value,
                        None => {
                            // Writing after close replaces this closure's
                            // slot with a private record; siblings keep
                            // the value they had at close time.
                            let closure = Rc::clone(&self.frame()?.closure);
                            closure.upvalues.borrow_mut()[slot] =
                                Rc::new(RefCell::new(Upvalue::Closed(value)));
                        }
                    }
                }

                OpCode::GetProperty => {
                    let Value::Instance(instance) = self.peek(0)? else {
                        return Err(RuntimeError::new(
                            "Only instances of classes can have retrievable properties.",
                        ));
                    };
                    let name = self.read_string()?;

                    let field = instance.fields.borrow().get(&name).cloned();
                    if let Some(value) = field {
                        self.pop()?;
                        self.push(value);
                    } else {
                        let class = Rc::clone(&instance.class);
                        self.bind_method(&class, &name)?;
                    }
                }
                OpCode::SetProperty => {
                    let Value::Instance(instance) = self.peek(1)? else {
                        return Err(RuntimeError::new(
                            "Only instances of classes can have fields.",
                        ));
                    };
                    let name = self.read_string()?;
                    let value = self.peek(0)?;
                    instance.fields.borrow_mut().insert(name, value);

                    // Assignment evaluates to the stored value.
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string()?;
                    let Value::Class(superclass) = self.pop()? else {
                        return Err(RuntimeError::new("Superclass must be a class."));
                    };
                    self.bind_method(&superclass, &name)?;
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a.eq_value(&b)));
                }
                OpCode::Greater => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Less => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a < b));
                }

                OpCode::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                        (Value::Str(a), Value::Str(b)) => {
                            Value::from(format!("{a}{b}"))
                        }
                        (Value::Number(a), Value::Str(b)) => {
                            Value::from(format!("{}{b}", Value::format_number(*a)))
                        }
                        (Value::Str(a), Value::Number(b)) => {
                            Value::from(format!("{a}{}", Value::format_number(*b)))
                        }
                        _ => {
                            return Err(RuntimeError::new(
                                "Operands must be numbers or strings.",
                            ));
                        }
                    };
                    self.push(result);
                }
                OpCode::Sub => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Mul => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Div => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a / b));
                }

                OpCode::BitAnd => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i64) & (b as i64)) as f64));
                }
                OpCode::BitOr => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i64) | (b as i64)) as f64));
                }
                OpCode::BitXor => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i64) ^ (b as i64)) as f64));
                }
                OpCode::BitNot => {
                    let Value::Number(n) = self.pop()? else {
                        return Err(RuntimeError::new("Operand must be a number."));
                    };
                    self.push(Value::Number(!(n as i64) as f64));
                }

                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.pop()? else {
                        return Err(RuntimeError::new("Operand must be a number."));
                    };
                    self.push(Value::Number(-n));
                }

                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.out, "{value}")
                        .map_err(|e| RuntimeError::new(e.to_string()))?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16()?;
                    self.frame()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16()?;
                    self.frame()?.ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte()?;
                    let callee = self.peek(arg_count as usize)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()?;
                    self.invoke(&name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()?;
                    let Value::Class(superclass) = self.pop()? else {
                        return Err(RuntimeError::new("Superclass must be a class."));
                    };
                    self.invoke_from_class(&superclass, &name, arg_count)?;
                }

                OpCode::Closure => {
                    let Value::Function(function) = self.read_constant()? else {
                        return Err(RuntimeError::new("Expected a function constant."));
                    };

                    let (base, enclosing) = {
                        let frame = self.frame()?;
                        (frame.stack_base, Rc::clone(&frame.closure))
                    };

                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;

                        let upvalue = if is_local {
                            self.capture_upvalue(base + index)
                        } else {
                            enclosing.upvalues.borrow().get(index).cloned().ok_or_else(
                                || RuntimeError::new("Upvalue slot out of range."),
                            )?
                        };
                        upvalues.push(upvalue);
                    }

                    self.push(Value::Closure(Rc::new(Closure {
                        function,
                        upvalues: RefCell::new(upvalues),
                    })));
                }
                OpCode::CloseUpvalue => {
                    let top = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or_else(|| RuntimeError::new("Value stack underflow."))?;
                    self.close_upvalues(top);
                    self.pop()?;
                }

                OpCode::Return => {
                    let result = self.pop()?;
                    let base = self.frame()?.stack_base;
                    self.close_upvalues(base);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        // The script closure itself is still on the stack.
                        self.pop()?;
                        return Ok(());
                    }

                    self.stack.truncate(base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string()?;
                    self.push(Value::Class(Rc::new(Class::new(&name))));
                }
                OpCode::Inherit => {
                    let Value::Class(superclass) = self.peek(1)? else {
                        return Err(RuntimeError::new("Superclass must be a class."));
                    };
                    let Value::Class(subclass) = self.peek(0)? else {
                        return Err(RuntimeError::new("Superclass must be a class."));
                    };

                    // Methods are copied, not shared: later definitions on
                    // either class never leak into the other.
                    let inherited = superclass.methods.borrow().clone();
                    *subclass.methods.borrow_mut() = inherited;
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.read_string()?;
                    let Value::Closure(method) = self.peek(0)? else {
                        return Err(RuntimeError::new("Expected a method closure."));
                    };
                    let Value::Class(class) = self.peek(1)? else {
                        return Err(RuntimeError::new("Expected a class for the method."));
                    };
                    class.methods.borrow_mut().insert(name, method);
                    self.pop()?;
                }

                OpCode::BuildArray => {
                    let count = self.read_byte()? as usize;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count)
                        .ok_or_else(|| RuntimeError::new("Value stack underflow."))?;
                    let items = self.stack.split_off(start);
                    self.push(Value::Array(Rc::new(RefCell::new(items))));
                }
                OpCode::IndexArray => {
                    let index = self.pop()?;
                    let Value::Array(array) = self.pop()? else {
                        return Err(RuntimeError::new("Object is not an array."));
                    };
                    let items = array.borrow();
                    let index = ExecutionEngine::array_index_operand(
                        index,
                        items.len(),
                        "Array index out of range.",
                    )?;
                    let value = items[index].clone();
                    drop(items);
                    self.push(value);
                }
                OpCode::StoreArray => {
                    let item = self.pop()?;
                    let index = self.pop()?;
                    let Value::Array(array) = self.pop()? else {
                        return Err(RuntimeError::new("Object is not an array."));
                    };
                    let mut items = array.borrow_mut();
                    let index = ExecutionEngine::array_index_operand(
                        index,
                        items.len(),
                        "Array index out of bounds.",
                    )?;
                    items[index] = item.clone();
                    drop(items);
                    self.push(item);
                }
            }
        }
    }

    /// Prints the error and a stack trace, innermost frame first, then
    /// unwinds. Globals survive so a REPL session can continue.
    fn report_runtime_error(&mut self, error: &RuntimeError) {
        eprintln!("{error}");

        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            if function.name.is_empty() {
                eprintln!("[line {line}] in script");
            } else {
                eprintln!("[line {line}] in {}()", function.name);
            }
        }

        self.reset_stack();
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}
