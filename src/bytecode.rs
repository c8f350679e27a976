//! Register bytecode data model

use crate::scrambler::OpcodeMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Real instruction kinds understood by the generated VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpCode {
    Move,
    LoadK,
    LoadBool,
    LoadNil,
    GetUpval,
    GetGlobal,
    GetTable,
    SetGlobal,
    SetUpval,
    SetTable,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    Return,
    ForLoop,
    ForPrep,
    TForLoop,
    SetList,
    Closure,
    Close,
    Vararg,
}

impl OpCode {
    /// Every real opcode, in identifier order
    pub const ALL: [OpCode; 38] = [
        OpCode::Move,
        OpCode::LoadK,
        OpCode::LoadBool,
        OpCode::LoadNil,
        OpCode::GetUpval,
        OpCode::GetGlobal,
        OpCode::GetTable,
        OpCode::SetGlobal,
        OpCode::SetUpval,
        OpCode::SetTable,
        OpCode::NewTable,
        OpCode::SelfOp,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::IDiv,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Unm,
        OpCode::Not,
        OpCode::Len,
        OpCode::Concat,
        OpCode::Jmp,
        OpCode::Eq,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Test,
        OpCode::TestSet,
        OpCode::Call,
        OpCode::Return,
        OpCode::ForLoop,
        OpCode::ForPrep,
        OpCode::TForLoop,
        OpCode::SetList,
        OpCode::Closure,
        OpCode::Close,
        OpCode::Vararg,
    ];

    /// Position in [`OpCode::ALL`]
    pub fn id(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Closure => "CLOSURE",
            OpCode::Close => "CLOSE",
            OpCode::Vararg => "VARARG",
        }
    }
}

/// One `(opcode, A, B, C)` instruction
///
/// `Bx` and `sBx` operands span the B and C bytes, low byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instruction {
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        Self { op, a, b, c }
    }

    pub fn abx(op: OpCode, a: u8, bx: u16) -> Self {
        let [b, c] = bx.to_le_bytes();
        Self { op, a, b, c }
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i16) -> Self {
        Self::abx(op, a, sbx as u16)
    }

    pub fn bx(&self) -> u16 {
        u16::from_le_bytes([self.b, self.c])
    }

    pub fn sbx(&self) -> i16 {
        self.bx() as i16
    }

    pub fn set_sbx(&mut self, sbx: i16) {
        let [b, c] = (sbx as u16).to_le_bytes();
        self.b = b;
        self.c = c;
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Closure | OpCode::SetList => {
                write!(f, "{:<9} {} {}", self.op.name(), self.a, self.bx())
            }
            OpCode::Jmp | OpCode::ForPrep | OpCode::ForLoop => {
                write!(f, "{:<9} {} {}", self.op.name(), self.a, self.sbx())
            }
            _ => write!(f, "{:<9} {} {} {}", self.op.name(), self.a, self.b, self.c),
        }
    }
}

/// Constant pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Integer(i64),
    Float(f64),
    String(Vec<u8>),
}

impl Constant {
    /// Identity used for pool deduplication; floats compare by bit pattern
    fn same(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Integer(a), Constant::Integer(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        }
    }

    /// Render as a Lua literal expression
    pub fn to_lua(&self) -> String {
        match self {
            Constant::Integer(i) if *i == i64::MIN => "(math.mininteger or -9223372036854775807-1)".to_string(),
            Constant::Integer(i) => i.to_string(),
            Constant::Float(v) if v.is_nan() => "(0/0)".to_string(),
            Constant::Float(v) if v.is_infinite() => {
                if *v > 0.0 { "(1/0)" } else { "(-1/0)" }.to_string()
            }
            // {:?} always keeps a fractional part or exponent, so the value stays a float
            Constant::Float(v) => format!("{v:?}"),
            Constant::String(bytes) => lua_string_literal(bytes),
        }
    }
}

/// Quote bytes as a Lua string literal using decimal escapes for anything unprintable
pub fn lua_string_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(byte as char),
            _ => {
                // Pad to three digits when a digit follows so the escape stays unambiguous
                if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    out.push_str(&format!("\\{byte:03}"));
                } else {
                    out.push_str(&format!("\\{byte}"));
                }
            }
        }
    }
    out.push('"');
    out
}

/// Where a closure finds a captured variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalueDesc {
    /// `true` for a register of the enclosing function, `false` for one of its upvalues
    pub is_local: bool,
    pub index: u8,
}

/// A compiled function
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Chunk>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: usize,
}

impl Chunk {
    /// Intern a constant, returning its pool index
    pub fn add_constant(&mut self, value: Constant) -> usize {
        if let Some(index) = self.constants.iter().position(|c| c.same(&value)) {
            return index;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Intern an upvalue descriptor, returning its index
    pub fn add_upvalue(&mut self, desc: UpvalueDesc) -> usize {
        if let Some(index) = self.upvalues.iter().position(|u| *u == desc) {
            return index;
        }
        self.upvalues.push(desc);
        self.upvalues.len() - 1
    }

    /// Flatten to `[code(op), A, B, C]` per instruction
    pub fn flatten(&self, map: &OpcodeMap) -> Vec<u8> {
        self.code
            .iter()
            .flat_map(|ins| [map.code(ins.op), ins.a, ins.b, ins.c])
            .collect()
    }

    /// Total number of chunks in this tree, including self
    pub fn count(&self) -> usize {
        1 + self.protos.iter().map(Chunk::count).sum::<usize>()
    }

    /// Human readable listing of the chunk tree
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, "main");
        out
    }

    fn disassemble_into(&self, out: &mut String, label: &str) {
        out.push_str(&format!(
            "function <{label}> params={} vararg={} stack={} upvalues={}\n",
            self.num_params,
            self.is_vararg,
            self.max_stack,
            self.upvalues.len()
        ));
        for (pc, ins) in self.code.iter().enumerate() {
            out.push_str(&format!("  [{pc:>3}] {ins}\n"));
        }
        for (i, k) in self.constants.iter().enumerate() {
            out.push_str(&format!("  K{i} = {}\n", k.to_lua()));
        }
        for (i, proto) in self.protos.iter().enumerate() {
            proto.disassemble_into(out, &format!("{label}.{i}"));
        }
    }
}
