//! Reference interpreter for protected chunk trees
//!
//! Decrypts every chunk with the same context the generator used, maps codes
//! back through the inverse opcode map, and executes the register semantics
//! the emitted Lua VM implements. Printed lines are collected instead of
//! written to stdout.

#![allow(dead_code)]

use luavm_protect::bytecode::{Constant, OpCode, UpvalueDesc};
use luavm_protect::compiler::compile;
use luavm_protect::crypto::{CipherContext, EncryptedChunk};
use luavm_protect::parser::parse;
use luavm_protect::scrambler::OpcodeMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type Regs = Rc<RefCell<Vec<Value>>>;
type Native = fn(&mut Interp, Vec<Value>) -> Result<Vec<Value>, String>;

/// Decrypted chunk ready to run
#[derive(Debug)]
pub struct Proto {
    pub code: Vec<(OpCode, u8, u8, u8)>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: usize,
    pub is_vararg: bool,
}

/// A captured variable: a live register until its scope closes, then a value of its own
pub enum Slot {
    Open { regs: Regs, index: usize },
    Closed(Value),
}

pub type UpCell = Rc<RefCell<Slot>>;

pub enum Func {
    Lua { proto: Rc<Proto>, upvals: Vec<UpCell> },
    Native(&'static str, Native),
}

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(Rc<Vec<u8>>),
    Table(Rc<RefCell<Table>>),
    Function(Rc<Func>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Int(i64),
    Num(u64),
    Str(Vec<u8>),
    Bool(bool),
    Ref(usize),
}

#[derive(Default)]
pub struct Table {
    entries: HashMap<Key, Value>,
}

impl Table {
    fn key(value: &Value) -> Result<Key, String> {
        Ok(match value {
            Value::Nil => return Err("table index is nil".to_string()),
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Num(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Key::Int(*f as i64),
            Value::Num(f) => Key::Num(f.to_bits()),
            Value::Str(s) => Key::Str(s.as_ref().clone()),
            Value::Table(t) => Key::Ref(Rc::as_ptr(t) as *const u8 as usize),
            Value::Function(f) => Key::Ref(Rc::as_ptr(f) as *const u8 as usize),
        })
    }

    pub fn get(&self, key: &Value) -> Value {
        Self::key(key)
            .ok()
            .and_then(|k| self.entries.get(&k).cloned())
            .unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: &Value, value: Value) -> Result<(), String> {
        let key = Self::key(key)?;
        if matches!(value, Value::Nil) {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    pub fn border(&self) -> i64 {
        let mut n = 0;
        while self.entries.contains_key(&Key::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    fn from_constant(k: &Constant) -> Value {
        match k {
            Constant::Integer(i) => Value::Int(*i),
            Constant::Float(f) => Value::Num(*f),
            Constant::String(s) => Value::Str(Rc::new(s.clone())),
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Num(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
        }
    }

    pub fn to_display(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Num(f) if f.fract() == 0.0 && f.is_finite() => format!("{f:.1}"),
            Value::Num(f) => f.to_string(),
            Value::Str(s) => String::from_utf8_lossy(s).into_owned(),
            Value::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
            Value::Function(f) => format!("function: {:p}", Rc::as_ptr(f)),
        }
    }

    fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

fn compare(op: OpCode, x: &Value, y: &Value) -> Result<bool, String> {
    if op == OpCode::Eq {
        return Ok(x.raw_eq(y));
    }
    let ordering = match (x, y) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        _ => match (x.number(), y.number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| "comparison with NaN".to_string())?,
            _ => {
                return Err(format!(
                    "attempt to compare {} with {}",
                    x.type_name(),
                    y.type_name()
                ))
            }
        },
    };
    Ok(match op {
        OpCode::Lt => ordering.is_lt(),
        _ => ordering.is_le(),
    })
}

fn concat_part(v: &Value) -> Result<Vec<u8>, String> {
    match v {
        Value::Str(s) => Ok(s.as_ref().clone()),
        Value::Int(_) | Value::Num(_) => Ok(v.to_display().into_bytes()),
        other => Err(format!("attempt to concatenate a {} value", other.type_name())),
    }
}

fn arith(op: OpCode, x: &Value, y: &Value) -> Result<Value, String> {
    if op == OpCode::Concat {
        let mut bytes = concat_part(x)?;
        bytes.extend(concat_part(y)?);
        return Ok(Value::Str(Rc::new(bytes)));
    }
    if let (Value::Int(a), Value::Int(b)) = (x, y) {
        let (a, b) = (*a, *b);
        match op {
            OpCode::Add => return Ok(Value::Int(a.wrapping_add(b))),
            OpCode::Sub => return Ok(Value::Int(a.wrapping_sub(b))),
            OpCode::Mul => return Ok(Value::Int(a.wrapping_mul(b))),
            OpCode::Mod if b != 0 => {
                let r = a.wrapping_rem(b);
                return Ok(Value::Int(if r != 0 && (r ^ b) < 0 { r + b } else { r }));
            }
            _ => {}
        }
    }
    let (a, b) = match (x.number(), y.number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(format!(
                "attempt to perform arithmetic on a {} value",
                if x.number().is_none() { x.type_name() } else { y.type_name() }
            ))
        }
    };
    Ok(match op {
        OpCode::Add => Value::Num(a + b),
        OpCode::Sub => Value::Num(a - b),
        OpCode::Mul => Value::Num(a * b),
        OpCode::Div => Value::Num(a / b),
        OpCode::Mod => Value::Num(a - (a / b).floor() * b),
        OpCode::Pow => Value::Num(a.powf(b)),
        OpCode::IDiv => {
            let q = (a / b).floor();
            if q.is_finite() && q.abs() < 9.0e15 {
                Value::Int(q as i64)
            } else {
                Value::Num(q)
            }
        }
        other => return Err(format!("{} is not arithmetic", other.name())),
    })
}

/// Decrypt a whole chunk tree
pub fn decode_tree(
    chunk: &EncryptedChunk,
    map: &OpcodeMap,
    ctx: &CipherContext,
) -> Result<Rc<Proto>, String> {
    let bytes = chunk.decrypt_code(ctx).map_err(|e| e.to_string())?;
    let code = bytes
        .chunks(4)
        .map(|ins| {
            map.opcode(ins[0])
                .map(|op| (op, ins[1], ins[2], ins[3]))
                .ok_or_else(|| format!("unknown code {}", ins[0]))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let protos = chunk
        .protos
        .iter()
        .map(|p| decode_tree(p, map, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Rc::new(Proto {
        code,
        constants: chunk.constants.clone(),
        protos,
        upvalues: chunk.upvalues.clone(),
        num_params: chunk.num_params as usize,
        is_vararg: chunk.is_vararg,
    }))
}

pub struct Interp {
    globals: Rc<RefCell<Table>>,
    pub output: Vec<String>,
}

fn native(name: &'static str, f: Native) -> Value {
    Value::Function(Rc::new(Func::Native(name, f)))
}

fn str_value(s: &str) -> Value {
    Value::Str(Rc::new(s.as_bytes().to_vec()))
}

fn lua_print(interp: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    let line: Vec<String> = args.iter().map(Value::to_display).collect();
    interp.output.push(line.join("\t"));
    Ok(vec![])
}

fn lua_ipairs_step(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    let Some(Value::Table(t)) = args.first() else {
        return Err("bad argument #1 to 'ipairs' iterator".to_string());
    };
    let i = match args.get(1) {
        Some(Value::Int(i)) => *i + 1,
        _ => 1,
    };
    let value = t.borrow().get(&Value::Int(i));
    if matches!(value, Value::Nil) {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Int(i), value])
    }
}

fn lua_ipairs(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    let table = args.into_iter().next().unwrap_or(Value::Nil);
    Ok(vec![native("ipairs_step", lua_ipairs_step), table, Value::Int(0)])
}

fn lua_tostring(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    let text = args.first().map(Value::to_display).unwrap_or_else(|| "nil".to_string());
    Ok(vec![str_value(&text)])
}

fn lua_type(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    let name = args.first().map(Value::type_name).unwrap_or("nil");
    Ok(vec![str_value(name)])
}

fn lua_select(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    match args.first().cloned() {
        Some(Value::Str(s)) if s.as_slice() == b"#" => Ok(vec![Value::Int(args.len() as i64 - 1)]),
        Some(Value::Int(n)) if n >= 1 => Ok(args.into_iter().skip(n as usize).collect()),
        _ => Err("bad argument #1 to 'select'".to_string()),
    }
}

fn lua_error(_: &mut Interp, args: Vec<Value>) -> Result<Vec<Value>, String> {
    Err(args.first().map(Value::to_display).unwrap_or_default())
}

impl Interp {
    pub fn new() -> Self {
        let mut globals = Table::default();
        let builtins: [(&'static str, Native); 6] = [
            ("print", lua_print),
            ("ipairs", lua_ipairs),
            ("tostring", lua_tostring),
            ("type", lua_type),
            ("select", lua_select),
            ("error", lua_error),
        ];
        for (name, f) in builtins {
            // Keys are never nil here
            let _ = globals.set(&str_value(name), native(name, f));
        }
        Self {
            globals: Rc::new(RefCell::new(globals)),
            output: Vec::new(),
        }
    }

    pub fn call(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>, String> {
        match f {
            Value::Function(func) => match func.as_ref() {
                Func::Native(_, native) => native(self, args),
                Func::Lua { proto, upvals } => self.execute(proto, args, upvals),
            },
            other => Err(format!("attempt to call a {} value", other.type_name())),
        }
    }

    /// Run a chunk; the root gets no upvalues
    pub fn execute(
        &mut self,
        proto: &Rc<Proto>,
        args: Vec<Value>,
        upvals: &[UpCell],
    ) -> Result<Vec<Value>, String> {
        let regs: Regs = Rc::new(RefCell::new(vec![Value::Nil; 256]));
        let np = proto.num_params;
        for (i, arg) in args.iter().take(np).enumerate() {
            regs.borrow_mut()[i] = arg.clone();
        }
        let varargs: Vec<Value> = args.iter().skip(np).cloned().collect();

        let get = |i: usize| regs.borrow().get(i).cloned().unwrap_or(Value::Nil);
        let set = |i: usize, v: Value| {
            let mut r = regs.borrow_mut();
            if i >= r.len() {
                r.resize(i + 1, Value::Nil);
            }
            r[i] = v;
        };

        let mut open: HashMap<usize, UpCell> = HashMap::new();
        let mut pc: isize = 0;
        let mut top: usize = 0;
        loop {
            let &(op, a, b, c) = proto
                .code
                .get(pc as usize)
                .ok_or_else(|| format!("pc {pc} out of range"))?;
            pc += 1;
            let (a, b, c) = (a as usize, b as usize, c as usize);
            let bx = b + c * 256;
            let sbx = bx as u16 as i16 as isize;
            let constant = |i: usize| -> Result<Value, String> {
                proto
                    .constants
                    .get(i)
                    .map(Value::from_constant)
                    .ok_or_else(|| format!("missing constant {i}"))
            };

            match op {
                OpCode::Move => set(a, get(b)),
                OpCode::LoadK => set(a, constant(bx)?),
                OpCode::LoadBool => {
                    set(a, Value::Bool(b != 0));
                    if c != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for i in a..=a + b {
                        set(i, Value::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let value = match &*upcell(upvals, b)?.borrow() {
                        Slot::Open { regs, index } => regs.borrow()[*index].clone(),
                        Slot::Closed(value) => value.clone(),
                    };
                    set(a, value);
                }
                OpCode::SetUpval => {
                    let value = get(a);
                    match &mut *upcell(upvals, b)?.borrow_mut() {
                        Slot::Open { regs, index } => regs.borrow_mut()[*index] = value,
                        Slot::Closed(slot) => *slot = value,
                    }
                }
                OpCode::GetGlobal => {
                    let value = self.globals.borrow().get(&constant(bx)?);
                    set(a, value);
                }
                OpCode::SetGlobal => {
                    self.globals.borrow_mut().set(&constant(bx)?, get(a))?;
                }
                OpCode::GetTable => {
                    let value = index(&get(b), &get(c))?;
                    set(a, value);
                }
                OpCode::SetTable => match get(a) {
                    Value::Table(t) => t.borrow_mut().set(&get(b), get(c))?,
                    other => return Err(format!("attempt to index a {} value", other.type_name())),
                },
                OpCode::NewTable => set(a, Value::Table(Rc::new(RefCell::new(Table::default())))),
                OpCode::SelfOp => {
                    let obj = get(b);
                    set(a + 1, obj.clone());
                    set(a, index(&obj, &get(c))?);
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Concat => set(a, arith(op, &get(b), &get(c))?),
                OpCode::Unm => {
                    let value = match get(b) {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        other => Value::Num(-other.number().ok_or("attempt to negate")?),
                    };
                    set(a, value);
                }
                OpCode::Not => set(a, Value::Bool(!get(b).truthy())),
                OpCode::Len => {
                    let value = match get(b) {
                        Value::Str(s) => Value::Int(s.len() as i64),
                        Value::Table(t) => Value::Int(t.borrow().border()),
                        other => return Err(format!("attempt to get length of a {} value", other.type_name())),
                    };
                    set(a, value);
                }
                OpCode::Jmp => pc += sbx,
                OpCode::Eq | OpCode::Lt | OpCode::Le => {
                    if compare(op, &get(b), &get(c))? != (a != 0) {
                        pc += 1;
                    }
                }
                OpCode::Test => {
                    if get(a).truthy() != (c != 0) {
                        pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let value = get(b);
                    if value.truthy() == (c != 0) {
                        set(a, value);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Call => {
                    let f = get(a);
                    let n = if b == 0 { top - a - 1 } else { b - 1 };
                    let args: Vec<Value> = (0..n).map(|i| get(a + 1 + i)).collect();
                    let results = self.call(&f, args)?;
                    if c == 0 {
                        top = a + results.len();
                        for (i, v) in results.into_iter().enumerate() {
                            set(a + i, v);
                        }
                    } else {
                        for i in 0..c - 1 {
                            set(a + i, results.get(i).cloned().unwrap_or(Value::Nil));
                        }
                    }
                }
                OpCode::Return => {
                    let n = if b == 0 { top - a } else { b - 1 };
                    return Ok((0..n).map(|i| get(a + i)).collect());
                }
                OpCode::ForPrep => {
                    set(a, arith(OpCode::Sub, &get(a), &get(a + 2))?);
                    pc += sbx;
                }
                OpCode::ForLoop => {
                    let step = get(a + 2);
                    let value = arith(OpCode::Add, &get(a), &step)?;
                    set(a, value.clone());
                    let positive = step.number().is_some_and(|s| s > 0.0);
                    let limit = get(a + 1);
                    let in_range = if positive {
                        compare(OpCode::Le, &value, &limit)?
                    } else {
                        compare(OpCode::Le, &limit, &value)?
                    };
                    if in_range {
                        pc += sbx;
                        set(a + 3, value);
                    }
                }
                OpCode::TForLoop => {
                    let results = self.call(&get(a), vec![get(a + 1), get(a + 2)])?;
                    for i in 0..c {
                        set(a + 3 + i, results.get(i).cloned().unwrap_or(Value::Nil));
                    }
                    let control = get(a + 3);
                    if matches!(control, Value::Nil) {
                        pc += 1;
                    } else {
                        set(a + 2, control);
                    }
                }
                OpCode::SetList => {
                    let Value::Table(t) = get(a) else {
                        return Err("SETLIST on a non-table".to_string());
                    };
                    for i in a + 1..top {
                        let key = Value::Int((bx + i - a - 1) as i64);
                        t.borrow_mut().set(&key, get(i))?;
                    }
                }
                OpCode::Closure => {
                    let child = proto
                        .protos
                        .get(bx)
                        .cloned()
                        .ok_or_else(|| format!("missing proto {bx}"))?;
                    let mut cells = Vec::with_capacity(child.upvalues.len());
                    for desc in &child.upvalues {
                        if desc.is_local {
                            let index = desc.index as usize;
                            let cell = open.entry(index).or_insert_with(|| {
                                Rc::new(RefCell::new(Slot::Open {
                                    regs: regs.clone(),
                                    index,
                                }))
                            });
                            cells.push(cell.clone());
                        } else {
                            cells.push(upcell(upvals, desc.index as usize)?.clone());
                        }
                    }
                    set(
                        a,
                        Value::Function(Rc::new(Func::Lua {
                            proto: child,
                            upvals: cells,
                        })),
                    );
                }
                OpCode::Close => {
                    let closing: Vec<usize> = open.keys().copied().filter(|&k| k >= a).collect();
                    for k in closing {
                        if let Some(cell) = open.remove(&k) {
                            *cell.borrow_mut() = Slot::Closed(get(k));
                        }
                    }
                }
                OpCode::Vararg => {
                    if b == 0 {
                        for (i, v) in varargs.iter().enumerate() {
                            set(a + i, v.clone());
                        }
                        top = a + varargs.len();
                    } else {
                        for i in 0..b - 1 {
                            set(a + i, varargs.get(i).cloned().unwrap_or(Value::Nil));
                        }
                    }
                }
            }
        }
    }
}

fn upcell(upvals: &[UpCell], i: usize) -> Result<&UpCell, String> {
    upvals.get(i).ok_or_else(|| format!("missing upvalue {i}"))
}

fn index(obj: &Value, key: &Value) -> Result<Value, String> {
    match obj {
        Value::Table(t) => Ok(t.borrow().get(key)),
        other => Err(format!("attempt to index a {} value", other.type_name())),
    }
}

/// A full protect run short of text generation
pub struct Protected {
    pub root: EncryptedChunk,
    pub map: OpcodeMap,
    pub ctx: CipherContext,
}

pub fn protect(source: &str, seed: u64) -> Protected {
    let mut rng = StdRng::seed_from_u64(seed);
    let chunk = compile(&parse(source).expect("parse")).expect("compile");
    let map = OpcodeMap::scramble(&mut rng);
    let ctx = CipherContext::generate(&mut rng);
    let root = EncryptedChunk::encrypt(&chunk, &map, &ctx);
    Protected { root, map, ctx }
}

/// Protect `source`, decrypt it again, run it, and return the printed lines
pub fn run(source: &str, seed: u64) -> Result<Vec<String>, String> {
    let protected = protect(source, seed);
    let root = decode_tree(&protected.root, &protected.map, &protected.ctx)?;
    let mut interp = Interp::new();
    interp.execute(&root, vec![], &[])?;
    Ok(interp.output)
}

/// Run `source` and return the values of its final `return`
pub fn eval(source: &str, seed: u64) -> Result<Vec<String>, String> {
    let protected = protect(source, seed);
    let root = decode_tree(&protected.root, &protected.map, &protected.ctx)?;
    let mut interp = Interp::new();
    let values = interp.execute(&root, vec![], &[])?;
    Ok(values.iter().map(Value::to_display).collect())
}
