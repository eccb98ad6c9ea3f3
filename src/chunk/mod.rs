use crate::value::Value;

/// One-byte opcodes for the VM. Some are followed by operand bytes:
/// a constant/slot/count byte, a 16-bit big-endian jump offset, or
/// (for `Closure`) one `(is_local, index)` pair per captured upvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Const,
    Null,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Sub,
    Mul,
    Div,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
    BuildArray,
    IndexArray,
    StoreArray,
}

impl OpCode {
    /// Decodes a raw code byte. The compiler only ever emits valid opcodes,
    /// so `None` means the chunk is corrupt.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        if byte <= OpCode::StoreArray as u8 {
            // Contiguous discriminants starting at zero.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One function's compiled instruction stream, its constant pool, and a
/// parallel line table (one entry per code byte, diagnostics only).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<u32>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Appends a raw byte to the instruction stream.
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Appends an opcode to the instruction stream.
    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op.as_byte(), line);
    }

    /// Rewrites an already-emitted byte (jump back-patching).
    pub fn set_code(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    pub fn code(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    /// Appends a constant and returns its pool index. The 256-entry cap is
    /// enforced by the compiler, which owns the error report.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn constant(&self, index: usize) -> &Value {
        &self.constants[index]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn line(&self, offset: usize) -> u32 {
        self.lines[offset]
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
