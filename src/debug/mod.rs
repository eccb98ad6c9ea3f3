//! Human-readable and JSON views of compiled bytecode, used by the
//! `--dump-bytecode` host flag and by hand when debugging the compiler.

use serde::Serialize;

use crate::chunk::{Chunk, OpCode};
use crate::value::{Function, Value};

/// Renders one function's chunk as a disassembly listing.
pub fn disassemble(function: &Function) -> String {
    let name = if function.name.is_empty() {
        "<script>".to_string()
    } else {
        format!("<fn {}>", function.name)
    };

    let mut text = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < function.chunk.len() {
        let (line, next) = instruction_at(&function.chunk, offset);
        text.push_str(&line);
        text.push('\n');
        offset = next;
    }
    text
}

/// A whole compilation unit rendered for JSON output: this function plus
/// every function nested in its constant pool.
#[derive(Debug, Serialize)]
pub struct FunctionDump {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: usize,
    pub constants: Vec<String>,
    pub instructions: Vec<String>,
    pub functions: Vec<FunctionDump>,
}

pub fn dump(function: &Function) -> FunctionDump {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < function.chunk.len() {
        let (line, next) = instruction_at(&function.chunk, offset);
        instructions.push(line);
        offset = next;
    }

    let nested = function
        .chunk
        .constants()
        .iter()
        .filter_map(|value| match value {
            Value::Function(inner) => Some(dump(inner)),
            _ => None,
        })
        .collect();

    FunctionDump {
        name: function.name.clone(),
        arity: function.arity,
        upvalue_count: function.upvalue_count,
        constants: function
            .chunk
            .constants()
            .iter()
            .map(|v| v.to_string())
            .collect(),
        instructions,
        functions: nested,
    }
}

/// Formats the instruction at `offset`; returns the text and the offset
/// of the next instruction.
fn instruction_at(chunk: &Chunk, offset: usize) -> (String, usize) {
    let line = chunk.line(offset);
    let line_column = if offset > 0 && chunk.line(offset - 1) == line {
        "   |".to_string()
    } else {
        format!("{line:4}")
    };
    let prefix = format!("{offset:04} {line_column} ");

    let Some(op) = OpCode::from_byte(chunk.code(offset)) else {
        return (format!("{prefix}Unknown {:#04x}", chunk.code(offset)), offset + 1);
    };

    match op {
        // Constant-pool operand
        OpCode::Const
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let index = chunk.code(offset + 1) as usize;
            (
                format!("{prefix}{op:?} {index} '{}'", chunk.constant(index)),
                offset + 2,
            )
        }

        // Raw byte operand
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::BuildArray => {
            let operand = chunk.code(offset + 1);
            (format!("{prefix}{op:?} {operand}"), offset + 2)
        }

        // Constant plus argument count
        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code(offset + 1) as usize;
            let arg_count = chunk.code(offset + 2);
            (
                format!(
                    "{prefix}{op:?} ({arg_count} args) {index} '{}'",
                    chunk.constant(index)
                ),
                offset + 3,
            )
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let operand =
                ((chunk.code(offset + 1) as usize) << 8) | chunk.code(offset + 2) as usize;
            let target = if op == OpCode::Loop {
                offset + 3 - operand
            } else {
                offset + 3 + operand
            };
            (format!("{prefix}{op:?} {offset} -> {target}"), offset + 3)
        }

        OpCode::Closure => {
            let index = chunk.code(offset + 1) as usize;
            let mut text = format!("{prefix}{op:?} {index} '{}'", chunk.constant(index));
            let mut next = offset + 2;

            if let Value::Function(function) = chunk.constant(index) {
                for _ in 0..function.upvalue_count {
                    let is_local = chunk.code(next) == 1;
                    let target = chunk.code(next + 1);
                    let kind = if is_local { "local" } else { "upvalue" };
                    text.push_str(&format!(
                        "\n{next:04}    |   capture {kind} {target}"
                    ));
                    next += 2;
                }
            }

            (text, next)
        }

        _ => (format!("{prefix}{op:?}"), offset + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    #[test]
    fn disassembles_a_print_statement() {
        let function = compiler::compile("print 1;").unwrap();
        let text = disassemble(&function);
        assert!(text.starts_with("== <script> ==\n"));
        assert!(text.contains("Const 0 '1'"));
        assert!(text.contains("Print"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let function = compiler::compile("while (true) { print 1; }").unwrap();
        let text = disassemble(&function);
        assert!(text.contains("JumpIfFalse"));
        assert!(text.contains("Loop"));
        assert!(text.contains("-> 0"));
    }

    #[test]
    fn closures_list_their_captures() {
        let function = compiler::compile(
            "func outer() { var x = 1; func inner() { print x; } }",
        )
        .unwrap();
        let dumped = dump(&function);
        let outer = &dumped.functions[0];
        assert_eq!(outer.name, "outer");
        assert_eq!(outer.functions[0].name, "inner");
        assert_eq!(outer.functions[0].upvalue_count, 1);
        assert!(outer
            .instructions
            .iter()
            .any(|i| i.contains("capture local")));
    }

    #[test]
    fn dump_serializes_to_json() {
        let function = compiler::compile("var a = 1;").unwrap();
        let json = serde_json::to_string(&dump(&function)).unwrap();
        assert!(json.contains("\"instructions\""));
        assert!(json.contains("DefineGlobal"));
    }
}
