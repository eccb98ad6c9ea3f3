use crate::value::{Function, UINT8_COUNT};

/// What kind of function body is being compiled. Drives the reserved
/// slot-zero name, implicit returns, and `return` legality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot. `depth == -1` marks a declared-but-uninitialized
/// variable, which makes `var a = a;` a compile error instead of a rebind.
#[derive(Debug)]
pub struct Local {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
}

/// A captured variable as the compiler sees it: either a local slot of the
/// enclosing function or an index into the enclosing function's upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueRef {
    pub index: u8,
    pub is_local: bool,
}

/// Outcome of a local-variable lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSlot {
    NotFound,
    Found(u8),
    /// The name resolved to a slot whose initializer is still running.
    Uninitialized(u8),
}

/// Per-function symbol bookkeeping: the locals stack, the upvalue table,
/// and the current scope depth. One of these exists per function being
/// compiled; they form a stack that mirrors function nesting.
#[derive(Debug)]
pub struct FunctionResolver {
    pub function: Function,
    pub kind: FunctionKind,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueRef>,
    pub scope_depth: i32,
}

impl FunctionResolver {
    pub fn new(kind: FunctionKind, name: &str) -> Self {
        // Slot zero is reserved: methods see the receiver there as "this",
        // plain functions get an unnameable placeholder.
        let slot_zero = if kind == FunctionKind::Function || kind == FunctionKind::Script {
            ""
        } else {
            "this"
        };

        FunctionResolver {
            function: Function::new(name),
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    pub fn is_local_scope(&self) -> bool {
        self.scope_depth > 0
    }

    /// Appends an uninitialized local. Errors once the one-byte slot space
    /// is exhausted.
    pub fn add_local(&mut self, name: &str) -> Result<(), String> {
        if self.locals.len() == UINT8_COUNT {
            return Err(format!(
                "Function exceeds maximum number of local variables. Max number is {}.",
                UINT8_COUNT - 1
            ));
        }

        self.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    /// Declares a variable in the current scope. Globals are late-bound by
    /// name and skip local bookkeeping entirely.
    pub fn declare_variable(&mut self, name: &str) -> Result<(), String> {
        if self.scope_depth == 0 {
            return Ok(());
        }

        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                break;
            }
            if local.name == name {
                return Err(format!(
                    "Redefinition error. Variable '{name}' already exists in this scope."
                ));
            }
        }

        self.add_local(name)
    }

    /// Completes the newest local's declaration, making it resolvable.
    pub fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }

    /// Looks a name up in this function's locals, innermost first.
    pub fn resolve_local(&self, name: &str) -> LocalSlot {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                return if local.depth == -1 {
                    LocalSlot::Uninitialized(i as u8)
                } else {
                    LocalSlot::Found(i as u8)
                };
            }
        }
        LocalSlot::NotFound
    }

    /// Registers an upvalue, reusing an existing entry for the same target.
    /// Returns its index in this function's upvalue table.
    pub fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, String> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() == UINT8_COUNT {
            return Err(format!(
                "Closures can handle at most {UINT8_COUNT} variables."
            ));
        }

        self.upvalues.push(UpvalueRef { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Leaves the current scope, removing its locals. Returns one
    /// `is_captured` flag per removed local, in pop order, so the caller
    /// can emit the matching close-or-pop instruction for each.
    pub fn end_scope(&mut self) -> Vec<bool> {
        self.scope_depth -= 1;

        let mut popped = Vec::new();
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            popped.push(local.is_captured);
            self.locals.pop();
        }
        popped
    }
}
