use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::rc::Rc;

use crate::chunk::Chunk;

/// Max locals/upvalues/constants per function; all are indexed by one byte.
pub const UINT8_COUNT: usize = u8::MAX as usize + 1;

/// A compiled function: immutable once compilation completes.
/// An empty name marks the top-level script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: String,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Function {
            arity: 0,
            upvalue_count: 0,
            name: name.to_string(),
            chunk: Chunk::new(),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "<script>")
        } else {
            write!(f, "<fn {}>", self.name)
        }
    }
}

/// A runtime upvalue: open while the captured stack slot is live, closed
/// (holding a private copy) once the declaring scope ends. The transition
/// is one-directional.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    pub fn is_open_at(&self, slot: usize) -> bool {
        matches!(self, Upvalue::Open(s) if *s == slot)
    }
}

/// A function plus the upvalue slots it captured at creation time.
/// A slot is replaced wholesale when a closed upvalue is written, so
/// sibling closures stop sharing state once the declaring frame is gone.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: RefCell<Vec<Rc<RefCell<Upvalue>>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        Closure {
            upvalues: RefCell::new(Vec::with_capacity(function.upvalue_count)),
            function,
        }
    }
}

/// A class and its method table. Methods are added while the class body
/// executes and the table is frozen once the declaration completes.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub methods: RefCell<HashMap<String, Rc<Closure>>>,
}

impl Class {
    pub fn new(name: &str) -> Self {
        Class {
            name: name.to_string(),
            methods: RefCell::new(HashMap::new()),
        }
    }

    pub fn method(&self, name: &str) -> Option<Rc<Closure>> {
        self.methods.borrow().get(name).cloned()
    }
}

/// An instance of a class; fields are created on first assignment.
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Instance {
            class,
            fields: RefCell::new(HashMap::new()),
        }
    }
}

/// A method closure bound to the instance it was accessed through.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Rc<Instance>,
    pub method: Rc<Closure>,
}

/// A host-provided callable registered in the global table. Indistinguishable
/// from user-defined globals at the call site.
#[derive(Clone)]
pub struct NativeFunction(pub Rc<dyn Fn(&[Value]) -> Result<Value, String>>);

impl NativeFunction {
    pub fn new(f: impl Fn(&[Value]) -> Result<Value, String> + 'static) -> Self {
        NativeFunction(Rc::new(f))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<native fn>")
    }
}

/// An open file, surfaced to programs only through host natives.
#[derive(Debug)]
pub struct FileHandle {
    pub path: String,
    file: RefCell<Option<std::fs::File>>,
}

impl FileHandle {
    /// Opens `path` with mode "r" (existing), "w" (create/truncate), or
    /// "a" (append).
    pub fn open(path: &str, mode: &str) -> Result<FileHandle, String> {
        let mut options = std::fs::OpenOptions::new();
        match mode {
            "r" => options.read(true),
            "w" => options.write(true).create(true).truncate(true),
            "a" => options.append(true).create(true),
            other => return Err(format!("Unsupported file mode '{other}'.")),
        };
        let file = options
            .open(path)
            .map_err(|e| format!("Cannot open '{path}': {e}."))?;
        Ok(FileHandle {
            path: path.to_string(),
            file: RefCell::new(Some(file)),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.borrow().is_some()
    }

    pub fn read_all(&self) -> Result<String, String> {
        let mut guard = self.file.borrow_mut();
        let Some(file) = guard.as_mut() else {
            return Ok(String::new());
        };
        file.rewind().map_err(|e| e.to_string())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| e.to_string())?;
        Ok(contents)
    }

    pub fn write_all(&self, data: &str) -> Result<(), String> {
        let mut guard = self.file.borrow_mut();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        file.write_all(data.as_bytes()).map_err(|e| e.to_string())
    }

    pub fn close(&self) {
        self.file.borrow_mut().take();
    }
}

/// The runtime value model: a closed sum type so every kind-dependent
/// operation (printing, equality, truthiness, coercion) is matched
/// exhaustively.
#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Null,
    Str(Rc<String>),
    Function(Rc<Function>),
    Native(NativeFunction),
    Closure(Rc<Closure>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
    Array(Rc<RefCell<Vec<Value>>>),
    File(Rc<FileHandle>),
}

impl Value {
    /// Only `false` and `null` are falsey; `0` and `""` are truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    /// Language-level equality: numbers, strings, booleans, and null compare
    /// by value; classes, instances, arrays, natives, and files by identity.
    /// Function-like values are never equal to anything, themselves included.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            // Functions, closures, and bound methods never compare equal.
            _ => false,
        }
    }

    /// The canonical textual form of a number, shared by `print` and the
    /// string-concatenation coercion.
    pub fn format_number(n: f64) -> String {
        if n == (n as i64) as f64 {
            format!("{}", n as i64)
        } else {
            format!("{n}")
        }
    }
}

/// Structural equality for tests and constant handling; identity for heap
/// kinds. Distinct from `eq_value`, which carries the language's rules.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::new(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::new(s))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", Value::format_number(*n)),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Function(func) => write!(f, "{func}"),
            Value::Native(_) => write!(f, "<native fn>"),
            Value::Closure(closure) => write!(f, "{}", closure.function),
            Value::Class(class) => write!(f, "{}", class.name),
            Value::Instance(instance) => write!(f, "{} instance", instance.class.name),
            Value::BoundMethod(bound) => write!(f, "{}", bound.method.function),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::File(handle) => write!(f, "path: {}", handle.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::Null.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::from("").is_falsey());
    }

    #[test]
    fn value_equality_by_value() {
        assert!(Value::Number(3.0).eq_value(&Value::Number(3.0)));
        assert!(Value::from("ab").eq_value(&Value::from("ab")));
        assert!(Value::Null.eq_value(&Value::Null));
        assert!(!Value::Number(0.0).eq_value(&Value::Bool(false)));
    }

    #[test]
    fn functions_are_never_equal_even_to_themselves() {
        let func = Rc::new(Function::new("f"));
        let a = Value::Function(Rc::clone(&func));
        let b = Value::Function(func);
        assert!(!a.eq_value(&b));
        assert!(!a.eq_value(&a));

        let closure = Value::Closure(Rc::new(Closure::new(Rc::new(Function::new("g")))));
        assert!(!closure.eq_value(&closure));
    }

    #[test]
    fn heap_kinds_compare_by_identity() {
        let class = Rc::new(Class::new("Point"));
        let a = Value::Class(Rc::clone(&class));
        let b = Value::Class(class);
        assert!(a.eq_value(&b));
        assert!(!a.eq_value(&Value::Class(Rc::new(Class::new("Point")))));

        let arr = Rc::new(RefCell::new(vec![Value::Number(1.0)]));
        let x = Value::Array(Rc::clone(&arr));
        let y = Value::Array(arr);
        assert!(x.eq_value(&y));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Function(Rc::new(Function::new(""))).to_string(), "<script>");
        assert_eq!(Value::Function(Rc::new(Function::new("f"))).to_string(), "<fn f>");
        let arr = Value::Array(Rc::new(RefCell::new(vec![
            Value::Number(1.0),
            Value::from("a"),
        ])));
        assert_eq!(arr.to_string(), "[1, a]");
    }

    #[test]
    fn upvalue_open_slot_check() {
        let open = Upvalue::Open(7);
        assert!(open.is_open_at(7));
        assert!(!open.is_open_at(6));
        assert!(!Upvalue::Closed(Value::Null).is_open_at(7));
    }
}
