//! AST to register bytecode
//!
//! Single pass over the tree. Each function under construction has a
//! [`FunctionState`]; the enclosing states are kept on a stack so upvalue
//! lookups can walk outwards by level without any parent pointers.
//!
//! Register discipline: locals occupy the bottom registers of a function in
//! declaration order, and temporaries are allocated above them. After every
//! statement the free register is reset to the number of active locals.
//! `expr_to_reg` is only ever asked to write a register that does not hold a
//! live local, so an expression can read any local while it is evaluated.

use crate::ast::{BinOp, Block, Expr, Field, FuncBody, FuncName, Number, Stat, UnOp};
use crate::bytecode::{Chunk, Constant, Instruction, OpCode, UpvalueDesc};
use crate::{ProtectError, ProtectResult};

/// Registers are addressed by one byte
const MAX_REGISTERS: usize = 256;

/// Upvalue indices are addressed by one byte
const MAX_UPVALUES: usize = 256;

const MAX_PROTOS: usize = 256;

/// Compile a parsed chunk into its root function
pub fn compile(block: &Block) -> ProtectResult<Chunk> {
    let mut compiler = Compiler {
        current: FunctionState::new(0, true),
        enclosing: Vec::new(),
    };
    compiler.current.open_scope(false);
    compiler.statements(&block.stats)?;
    compiler.current.close_scope();
    let chunk = compiler.current.finish()?;
    tracing::debug!(
        functions = chunk.count(),
        instructions = chunk.code.len(),
        "Compiled chunk tree"
    );
    Ok(chunk)
}

#[derive(Debug)]
struct LocalVar {
    name: String,
    reg: u8,
    /// Set once a nested function refers to this local
    captured: bool,
}

#[derive(Debug, Default)]
struct Scope {
    locals: Vec<LocalVar>,
    /// `Some` for loop bodies: pending `break` jumps
    breaks: Option<Vec<usize>>,
}

#[derive(Debug)]
struct FunctionState {
    chunk: Chunk,
    scopes: Vec<Scope>,
    /// Parallel to `chunk.upvalues`
    upvalue_names: Vec<String>,
    free_reg: usize,
}

/// How an identifier resolves in the current function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Local(u8),
    Upvalue(u8),
    Global,
}

/// Resolved left-hand side of an assignment
#[derive(Debug, Clone, Copy)]
enum Target {
    Local(u8),
    Upvalue(u8),
    Global(u16),
    Index(u8, u8),
}

impl FunctionState {
    fn new(num_params: u8, is_vararg: bool) -> Self {
        Self {
            chunk: Chunk {
                num_params,
                is_vararg,
                ..Chunk::default()
            },
            scopes: Vec::new(),
            upvalue_names: Vec::new(),
            free_reg: 0,
        }
    }

    fn pc(&self) -> usize {
        self.chunk.code.len()
    }

    fn emit(&mut self, ins: Instruction) -> usize {
        self.chunk.code.push(ins);
        self.chunk.code.len() - 1
    }

    fn emit_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8) -> usize {
        self.emit(Instruction::abc(op, a, b, c))
    }

    fn set_free_reg(&mut self, reg: usize) -> ProtectResult<()> {
        if reg > MAX_REGISTERS {
            return Err(ProtectError::Compile(
                "function or expression needs more than 255 registers".to_string(),
            ));
        }
        self.free_reg = reg;
        self.chunk.max_stack = self.chunk.max_stack.max(reg);
        Ok(())
    }

    /// Reserve `n` consecutive registers, returning the first
    fn reserve(&mut self, n: usize) -> ProtectResult<u8> {
        let base = self.free_reg;
        self.set_free_reg(base + n)?;
        // set_free_reg bounds base + n by 256, so a reserved base fits a byte
        Ok(base.min(u8::MAX as usize) as u8)
    }

    fn active_count(&self) -> usize {
        self.scopes.iter().map(|s| s.locals.len()).sum()
    }

    fn open_scope(&mut self, is_loop: bool) {
        self.scopes.push(Scope {
            locals: Vec::new(),
            breaks: is_loop.then(Vec::new),
        });
    }

    /// Lowest captured register among the given scopes
    fn first_captured<'a>(scopes: impl Iterator<Item = &'a Scope>) -> Option<u8> {
        scopes
            .flat_map(|scope| scope.locals.iter())
            .filter(|local| local.captured)
            .map(|local| local.reg)
            .min()
    }

    /// First register the innermost scope must close on exit
    fn block_needs_close(&self) -> Option<u8> {
        Self::first_captured(self.scopes.last().into_iter())
    }

    /// First register a `break` must close, scanning out to the innermost loop
    fn break_needs_close(&self) -> Option<u8> {
        let loop_depth = self.scopes.iter().rposition(|s| s.breaks.is_some())?;
        Self::first_captured(self.scopes[loop_depth..].iter())
    }

    /// Detach captured locals of the innermost scope from their registers
    fn close_upvalues(&mut self) {
        if let Some(reg) = self.block_needs_close() {
            self.emit_abc(OpCode::Close, reg, 0, 0);
        }
    }

    fn mark_captured(&mut self, name: &str) {
        if let Some(local) = self
            .scopes
            .iter_mut()
            .rev()
            .flat_map(|scope| scope.locals.iter_mut().rev())
            .find(|local| local.name == name)
        {
            local.captured = true;
        }
    }

    /// Pop the innermost scope, returning its pending breaks
    fn close_scope(&mut self) -> Vec<usize> {
        let scope = self.scopes.pop().unwrap_or_default();
        self.free_reg = self.active_count();
        scope.breaks.unwrap_or_default()
    }

    fn declare(&mut self, name: &str, reg: u8) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.locals.push(LocalVar {
                name: name.to_string(),
                reg,
                captured: false,
            });
        }
    }

    /// Innermost-first lookup through every active scope
    fn find_local(&self, name: &str) -> Option<u8> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.locals.iter().rev())
            .find(|local| local.name == name)
            .map(|local| local.reg)
    }

    fn constant(&mut self, value: Constant) -> ProtectResult<u16> {
        let index = self.chunk.add_constant(value);
        u16::try_from(index)
            .map_err(|_| ProtectError::Compile("too many constants in one function".to_string()))
    }

    fn emit_jump(&mut self) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0))
    }

    fn offset(from: usize, target: usize) -> ProtectResult<i16> {
        let delta = target as i64 - (from as i64 + 1);
        i16::try_from(delta)
            .map_err(|_| ProtectError::Compile("control structure too long".to_string()))
    }

    fn patch_jump(&mut self, pc: usize, target: usize) -> ProtectResult<()> {
        let offset = Self::offset(pc, target)?;
        if let Some(ins) = self.chunk.code.get_mut(pc) {
            ins.set_sbx(offset);
        }
        Ok(())
    }

    fn patch_here(&mut self, pc: usize) -> ProtectResult<()> {
        let target = self.pc();
        self.patch_jump(pc, target)
    }

    fn jump_to(&mut self, target: usize) -> ProtectResult<()> {
        let offset = Self::offset(self.pc(), target)?;
        self.emit(Instruction::asbx(OpCode::Jmp, 0, offset));
        Ok(())
    }

    /// Whether control can reach past the last instruction
    fn falls_off_end(&self) -> bool {
        let len = self.chunk.code.len() as i64;
        if !matches!(self.chunk.code.last(), Some(ins) if ins.op == OpCode::Return) {
            return true;
        }
        self.chunk.code.iter().enumerate().any(|(pc, ins)| {
            matches!(ins.op, OpCode::Jmp | OpCode::ForPrep | OpCode::ForLoop)
                && pc as i64 + 1 + ins.sbx() as i64 == len
        })
    }

    fn finish(mut self) -> ProtectResult<Chunk> {
        if self.falls_off_end() {
            self.emit_abc(OpCode::Return, 0, 1, 0);
        }
        Ok(self.chunk)
    }
}

struct Compiler {
    current: FunctionState,
    /// Enclosing functions, outermost first
    enclosing: Vec<FunctionState>,
}

impl Compiler {
    fn fs(&mut self) -> &mut FunctionState {
        &mut self.current
    }

    fn state_at(&mut self, level: usize) -> &mut FunctionState {
        if level >= self.enclosing.len() {
            &mut self.current
        } else {
            &mut self.enclosing[level]
        }
    }

    // ========================================================================
    // Name resolution
    // ========================================================================

    fn resolve(&mut self, name: &str) -> ProtectResult<Var> {
        if let Some(reg) = self.current.find_local(name) {
            return Ok(Var::Local(reg));
        }
        let level = self.enclosing.len();
        Ok(match self.resolve_upvalue(level, name)? {
            Some(index) => Var::Upvalue(index),
            None => Var::Global,
        })
    }

    /// Find or create the upvalue for `name` in the function at `level`
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> ProtectResult<Option<u8>> {
        if level == 0 {
            return Ok(None);
        }
        if let Some(index) = self
            .state_at(level)
            .upvalue_names
            .iter()
            .position(|n| n == name)
        {
            return Ok(Some(index as u8));
        }

        let parent = level - 1;
        let desc = if let Some(reg) = self.state_at(parent).find_local(name) {
            self.state_at(parent).mark_captured(name);
            UpvalueDesc {
                is_local: true,
                index: reg,
            }
        } else if let Some(index) = self.resolve_upvalue(parent, name)? {
            UpvalueDesc {
                is_local: false,
                index,
            }
        } else {
            return Ok(None);
        };

        let state = self.state_at(level);
        if state.chunk.upvalues.len() >= MAX_UPVALUES {
            return Err(ProtectError::Compile(format!(
                "too many upvalues (capturing '{name}')"
            )));
        }
        let index = state.chunk.add_upvalue(desc);
        if index == state.upvalue_names.len() {
            state.upvalue_names.push(name.to_string());
        }
        Ok(Some(index as u8))
    }

    fn store_var(&mut self, name: &str, src: u8) -> ProtectResult<()> {
        let target = match self.resolve(name)? {
            Var::Local(reg) => Target::Local(reg),
            Var::Upvalue(index) => Target::Upvalue(index),
            Var::Global => Target::Global(self.fs().constant(Constant::String(name.as_bytes().to_vec()))?),
        };
        self.store(target, src);
        Ok(())
    }

    fn store(&mut self, target: Target, src: u8) {
        let fs = self.fs();
        match target {
            Target::Local(reg) => {
                if reg != src {
                    fs.emit_abc(OpCode::Move, reg, src, 0);
                }
            }
            Target::Upvalue(index) => {
                fs.emit_abc(OpCode::SetUpval, src, index, 0);
            }
            Target::Global(k) => {
                fs.emit(Instruction::abx(OpCode::SetGlobal, src, k));
            }
            Target::Index(obj, key) => {
                fs.emit_abc(OpCode::SetTable, obj, key, src);
            }
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn statements(&mut self, stats: &[Stat]) -> ProtectResult<()> {
        for stat in stats {
            self.statement(stat)?;
            let active = self.current.active_count();
            self.current.free_reg = active;
        }
        Ok(())
    }

    /// Compile a block in its own scope, returning pending breaks for loops
    fn scoped_block(&mut self, block: &Block, is_loop: bool) -> ProtectResult<Vec<usize>> {
        self.fs().open_scope(is_loop);
        self.statements(&block.stats)?;
        self.fs().close_upvalues();
        Ok(self.fs().close_scope())
    }

    fn statement(&mut self, stat: &Stat) -> ProtectResult<()> {
        match stat {
            Stat::Local { names, exprs } => self.local(names, exprs),
            Stat::Assign { targets, exprs } => self.assign(targets, exprs),
            Stat::Call(call) => {
                let base = self.fs().reserve(1)?;
                self.call(call, base, Some(0))
            }
            Stat::If {
                clauses,
                else_block,
            } => self.if_stat(clauses, else_block.as_ref()),
            Stat::While { cond, body } => self.while_stat(cond, body),
            Stat::Repeat { body, cond } => self.repeat_stat(body, cond),
            Stat::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => self.numeric_for(var, start, limit, step.as_ref(), body),
            Stat::GenericFor { vars, exprs, body } => self.generic_for(vars, exprs, body),
            Stat::Function { name, body } => self.function_stat(name, body),
            Stat::LocalFunction { name, body } => {
                let reg = self.fs().reserve(1)?;
                self.fs().declare(name, reg);
                let index = self.function(body)?;
                self.fs().emit(Instruction::abx(OpCode::Closure, reg, index));
                Ok(())
            }
            Stat::Do(block) => {
                self.scoped_block(block, false)?;
                Ok(())
            }
            Stat::Return(exprs) => {
                let base = self.fs().free_reg as u8;
                let b = match self.explist(exprs, None)? {
                    None => 0,
                    Some(n) => count_operand(n)?,
                };
                self.fs().emit_abc(OpCode::Return, base, b, 0);
                Ok(())
            }
            Stat::Break => {
                let fs = self.fs();
                if !fs.scopes.iter().any(|s| s.breaks.is_some()) {
                    tracing::warn!("'break' outside a loop, skipped");
                    return Ok(());
                }
                if let Some(reg) = fs.break_needs_close() {
                    fs.emit_abc(OpCode::Close, reg, 0, 0);
                }
                let jump = fs.emit_jump();
                if let Some(breaks) = fs.scopes.iter_mut().rev().find_map(|s| s.breaks.as_mut()) {
                    breaks.push(jump);
                }
                Ok(())
            }
            Stat::Unhandled(kind) => {
                tracing::warn!(construct = *kind, "Unsupported statement skipped");
                Ok(())
            }
        }
    }

    fn local(&mut self, names: &[String], exprs: &[Expr]) -> ProtectResult<()> {
        let base = self.fs().free_reg;
        self.explist(exprs, Some(names.len()))?;
        self.fs().set_free_reg(base + names.len())?;
        // Bound only after evaluation so `local x = x` reads the outer x
        for (i, name) in names.iter().enumerate() {
            self.fs().declare(name, (base + i) as u8);
        }
        Ok(())
    }

    fn assign(&mut self, targets: &[Expr], exprs: &[Expr]) -> ProtectResult<()> {
        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let target = match target {
                Expr::Name(name) => match self.resolve(name)? {
                    Var::Local(reg) => Target::Local(reg),
                    Var::Upvalue(index) => Target::Upvalue(index),
                    Var::Global => Target::Global(
                        self.fs()
                            .constant(Constant::String(name.as_bytes().to_vec()))?,
                    ),
                },
                Expr::Index { obj, key } => {
                    let obj = self.expr_to_any_reg(obj)?;
                    let key = self.expr_to_any_reg(key)?;
                    Target::Index(obj, key)
                }
                other => {
                    tracing::warn!(expr = ?other, "Invalid assignment target skipped");
                    return Ok(());
                }
            };
            resolved.push(target);
        }

        // Every value is computed before the first store, so `a, b = b, a` swaps
        let base = self.fs().free_reg;
        self.explist(exprs, Some(resolved.len()))?;
        for (i, target) in resolved.into_iter().enumerate() {
            self.store(target, (base + i) as u8);
        }
        Ok(())
    }

    fn if_stat(&mut self, clauses: &[(Expr, Block)], else_block: Option<&Block>) -> ProtectResult<()> {
        let mut end_jumps = Vec::new();
        for (i, (cond, body)) in clauses.iter().enumerate() {
            let next_clause = self.condition_jump(cond)?;
            self.scoped_block(body, false)?;
            if i + 1 < clauses.len() || else_block.is_some() {
                end_jumps.push(self.fs().emit_jump());
            }
            self.fs().patch_here(next_clause)?;
        }
        if let Some(block) = else_block {
            self.scoped_block(block, false)?;
        }
        for jump in end_jumps {
            self.fs().patch_here(jump)?;
        }
        Ok(())
    }

    /// Evaluate `cond` and emit a jump taken when it is falsy
    fn condition_jump(&mut self, cond: &Expr) -> ProtectResult<usize> {
        let reg = self.expr_to_any_reg(cond)?;
        let fs = self.fs();
        fs.emit_abc(OpCode::Test, reg, 0, 0);
        let jump = fs.emit_jump();
        fs.free_reg = fs.active_count();
        Ok(jump)
    }

    fn while_stat(&mut self, cond: &Expr, body: &Block) -> ProtectResult<()> {
        let start = self.fs().pc();
        let exit = self.condition_jump(cond)?;
        let breaks = self.scoped_block(body, true)?;
        self.fs().jump_to(start)?;
        self.fs().patch_here(exit)?;
        for jump in breaks {
            self.fs().patch_here(jump)?;
        }
        Ok(())
    }

    fn repeat_stat(&mut self, body: &Block, cond: &Expr) -> ProtectResult<()> {
        let start = self.fs().pc();
        self.fs().open_scope(true);
        self.statements(&body.stats)?;
        // The condition sees the body's locals
        let reg = self.expr_to_any_reg(cond)?;
        // Closed before the test so both the exit and the next iteration get fresh cells
        self.fs().close_upvalues();
        self.fs().emit_abc(OpCode::Test, reg, 0, 0);
        self.fs().jump_to(start)?;
        let breaks = self.fs().close_scope();
        for jump in breaks {
            self.fs().patch_here(jump)?;
        }
        Ok(())
    }

    fn numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> ProtectResult<()> {
        self.fs().open_scope(false);
        let base = self.expr_to_next_reg(start)?;
        self.expr_to_next_reg(limit)?;
        match step {
            Some(step) => {
                self.expr_to_next_reg(step)?;
            }
            None => {
                self.constant_to_next_reg(Constant::Integer(1))?;
            }
        }
        self.fs().declare("(for index)", base);
        self.fs().declare("(for limit)", base + 1);
        self.fs().declare("(for step)", base + 2);

        let prep = self.fs().emit(Instruction::asbx(OpCode::ForPrep, base, 0));
        self.fs().open_scope(true);
        let var_reg = self.fs().reserve(1)?;
        self.fs().declare(var, var_reg);
        self.statements(&body.stats)?;
        self.fs().close_upvalues();
        let breaks = self.fs().close_scope();

        let fs = self.fs();
        let loop_pc = fs.pc();
        fs.emit(Instruction::asbx(
            OpCode::ForLoop,
            base,
            FunctionState::offset(loop_pc, prep + 1)?,
        ));
        fs.patch_jump(prep, loop_pc)?;
        for jump in breaks {
            fs.patch_here(jump)?;
        }
        fs.close_scope();
        Ok(())
    }

    fn generic_for(&mut self, vars: &[String], exprs: &[Expr], body: &Block) -> ProtectResult<()> {
        self.fs().open_scope(false);
        let base = self.fs().free_reg;
        self.explist(exprs, Some(3))?;
        self.fs().set_free_reg(base + 3)?;
        let base = base as u8;
        self.fs().declare("(for generator)", base);
        self.fs().declare("(for state)", base + 1);
        self.fs().declare("(for control)", base + 2);

        let to_test = self.fs().emit_jump();
        self.fs().open_scope(true);
        let first_var = self.fs().reserve(vars.len())?;
        for (i, var) in vars.iter().enumerate() {
            self.fs().declare(var, first_var + i as u8);
        }
        let body_start = self.fs().pc();
        self.statements(&body.stats)?;
        self.fs().close_upvalues();
        let breaks = self.fs().close_scope();

        let fs = self.fs();
        fs.patch_here(to_test)?;
        fs.emit_abc(OpCode::TForLoop, base, 0, count_operand(vars.len() - 1)?);
        fs.jump_to(body_start)?;
        for jump in breaks {
            fs.patch_here(jump)?;
        }
        fs.close_scope();
        Ok(())
    }

    fn function_stat(&mut self, name: &FuncName, body: &FuncBody) -> ProtectResult<()> {
        let mut keys: Vec<&String> = name.fields.iter().collect();
        keys.extend(name.method.as_ref());

        let Some((last, path)) = keys.split_last() else {
            let reg = self.fs().reserve(1)?;
            let index = self.function(body)?;
            self.fs().emit(Instruction::abx(OpCode::Closure, reg, index));
            return self.store_var(&name.base, reg);
        };

        let mut obj = Expr::Name(name.base.clone());
        for key in path {
            obj = Expr::Index {
                obj: Box::new(obj),
                key: Box::new(Expr::String(key.as_bytes().to_vec())),
            };
        }
        let obj = self.expr_to_any_reg(&obj)?;
        let key = self.constant_to_next_reg(Constant::String(last.as_bytes().to_vec()))?;
        let value = self.fs().reserve(1)?;
        let index = self.function(body)?;
        let fs = self.fs();
        fs.emit(Instruction::abx(OpCode::Closure, value, index));
        fs.emit_abc(OpCode::SetTable, obj, key, value);
        Ok(())
    }

    /// Compile a function body into a new prototype of the current function
    fn function(&mut self, body: &FuncBody) -> ProtectResult<u16> {
        let num_params = u8::try_from(body.params.len())
            .map_err(|_| ProtectError::Compile("too many parameters".to_string()))?;
        let child = FunctionState::new(num_params, body.is_vararg);
        let parent = std::mem::replace(&mut self.current, child);
        self.enclosing.push(parent);

        let result = self.function_body(body);

        let parent = self
            .enclosing
            .pop()
            .ok_or_else(|| ProtectError::Compile("function nesting underflow".to_string()))?;
        let child = std::mem::replace(&mut self.current, parent);
        result?;
        let chunk = child.finish()?;

        let protos = &mut self.current.chunk.protos;
        if protos.len() >= MAX_PROTOS {
            return Err(ProtectError::Compile(
                "too many nested functions in one function".to_string(),
            ));
        }
        protos.push(chunk);
        Ok((protos.len() - 1) as u16)
    }

    fn function_body(&mut self, body: &FuncBody) -> ProtectResult<()> {
        self.fs().open_scope(false);
        for param in &body.params {
            let reg = self.fs().reserve(1)?;
            self.fs().declare(param, reg);
        }
        self.statements(&body.body.stats)?;
        self.fs().close_scope();
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Place values of `exprs` in consecutive registers from the free register
    ///
    /// With `want`, exactly that many values are produced (padding with nil).
    /// Without it, a trailing call or `...` stays open and `None` is returned.
    fn explist(&mut self, exprs: &[Expr], want: Option<usize>) -> ProtectResult<Option<usize>> {
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() && expr.is_multi() {
                return match want {
                    None => {
                        self.multi(expr, None)?;
                        Ok(None)
                    }
                    Some(n) => {
                        self.multi(expr, Some(n.saturating_sub(i)))?;
                        Ok(Some(n))
                    }
                };
            }
            self.expr_to_next_reg(expr)?;
        }
        match want {
            Some(n) if exprs.len() < n => {
                let missing = n - exprs.len();
                let reg = self.fs().reserve(missing)?;
                self.fs().emit_abc(OpCode::LoadNil, reg, (missing - 1) as u8, 0);
                Ok(Some(n))
            }
            Some(n) => Ok(Some(n)),
            None => Ok(Some(exprs.len())),
        }
    }

    /// Evaluate a call or `...` into registers from the free register
    ///
    /// `Some(n)` keeps exactly n results; `None` leaves them open up to `top`.
    fn multi(&mut self, expr: &Expr, count: Option<usize>) -> ProtectResult<()> {
        let base = self.fs().reserve(1)?;
        match expr {
            Expr::Vararg => {
                self.check_vararg()?;
                let b = match count {
                    Some(n) => count_operand(n)?,
                    None => 0,
                };
                self.fs().emit_abc(OpCode::Vararg, base, b, 0);
            }
            _ => self.call(expr, base, count)?,
        }
        let end = base as usize + count.unwrap_or(0);
        self.fs().set_free_reg(end)
    }

    fn check_vararg(&mut self) -> ProtectResult<()> {
        if self.current.chunk.is_vararg {
            Ok(())
        } else {
            Err(ProtectError::Compile(
                "cannot use '...' outside a vararg function".to_string(),
            ))
        }
    }

    /// Compile a call with the callee in `base`, which must be the last reserved register
    fn call(&mut self, expr: &Expr, base: u8, results: Option<usize>) -> ProtectResult<()> {
        let b = match expr {
            Expr::Call { func, args } => {
                self.expr_to_reg(func, base)?;
                match self.explist(args, None)? {
                    None => 0,
                    Some(n) => count_operand(n)?,
                }
            }
            Expr::MethodCall { obj, method, args } => {
                self.fs().reserve(1)?;
                let save = self.fs().free_reg;
                let obj = self.expr_to_any_reg(obj)?;
                let key = self.constant_to_next_reg(Constant::String(method.as_bytes().to_vec()))?;
                self.fs().emit_abc(OpCode::SelfOp, base, obj, key);
                self.fs().free_reg = save;
                match self.explist(args, None)? {
                    None => 0,
                    Some(n) => count_operand(n + 1)?,
                }
            }
            other => {
                tracing::warn!(expr = ?other, "Non-call expression in call position");
                self.fs().emit_abc(OpCode::LoadNil, base, 0, 0);
                return Ok(());
            }
        };
        let c = match results {
            Some(n) => count_operand(n)?,
            None => 0,
        };
        self.fs().emit_abc(OpCode::Call, base, b, c);
        self.fs().free_reg = base as usize + 1;
        Ok(())
    }

    fn expr_to_next_reg(&mut self, expr: &Expr) -> ProtectResult<u8> {
        let reg = self.fs().reserve(1)?;
        self.expr_to_reg(expr, reg)?;
        Ok(reg)
    }

    /// A register holding the value of `expr`: the local itself when possible
    fn expr_to_any_reg(&mut self, expr: &Expr) -> ProtectResult<u8> {
        if let Expr::Name(name) = expr {
            if let Some(reg) = self.current.find_local(name) {
                return Ok(reg);
            }
        }
        self.expr_to_next_reg(expr)
    }

    fn constant_to_next_reg(&mut self, value: Constant) -> ProtectResult<u8> {
        let reg = self.fs().reserve(1)?;
        let k = self.fs().constant(value)?;
        self.fs().emit(Instruction::abx(OpCode::LoadK, reg, k));
        Ok(reg)
    }

    /// Evaluate `expr` to exactly one value in `dest`
    fn expr_to_reg(&mut self, expr: &Expr, dest: u8) -> ProtectResult<()> {
        let save = self.fs().free_reg;
        match expr {
            Expr::Nil => {
                self.fs().emit_abc(OpCode::LoadNil, dest, 0, 0);
            }
            Expr::True => {
                self.fs().emit_abc(OpCode::LoadBool, dest, 1, 0);
            }
            Expr::False => {
                self.fs().emit_abc(OpCode::LoadBool, dest, 0, 0);
            }
            Expr::Number(number) => {
                let value = match *number {
                    Number::Integer(i) => Constant::Integer(i),
                    Number::Float(f) => Constant::Float(f),
                };
                let k = self.fs().constant(value)?;
                self.fs().emit(Instruction::abx(OpCode::LoadK, dest, k));
            }
            Expr::String(bytes) => {
                let k = self.fs().constant(Constant::String(bytes.clone()))?;
                self.fs().emit(Instruction::abx(OpCode::LoadK, dest, k));
            }
            Expr::Vararg => {
                self.check_vararg()?;
                self.fs().emit_abc(OpCode::Vararg, dest, 2, 0);
            }
            Expr::Function(body) => {
                let index = self.function(body)?;
                self.fs().emit(Instruction::abx(OpCode::Closure, dest, index));
            }
            Expr::Table(fields) => self.table(fields, dest)?,
            Expr::Name(name) => match self.resolve(name)? {
                Var::Local(reg) => {
                    if reg != dest {
                        self.fs().emit_abc(OpCode::Move, dest, reg, 0);
                    }
                }
                Var::Upvalue(index) => {
                    self.fs().emit_abc(OpCode::GetUpval, dest, index, 0);
                }
                Var::Global => {
                    let k = self.fs().constant(Constant::String(name.as_bytes().to_vec()))?;
                    self.fs().emit(Instruction::abx(OpCode::GetGlobal, dest, k));
                }
            },
            Expr::Index { obj, key } => {
                let obj = self.expr_to_any_reg(obj)?;
                let key = self.expr_to_any_reg(key)?;
                self.fs().emit_abc(OpCode::GetTable, dest, obj, key);
            }
            Expr::Call { .. } | Expr::MethodCall { .. } => {
                if dest as usize + 1 == save {
                    self.call(expr, dest, Some(1))?;
                } else {
                    let base = self.fs().reserve(1)?;
                    self.call(expr, base, Some(1))?;
                    self.fs().emit_abc(OpCode::Move, dest, base, 0);
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, dest)?,
            Expr::Unary { op, operand } => {
                let opcode = match op {
                    UnOp::Neg => OpCode::Unm,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                    UnOp::BNot => {
                        tracing::warn!("Bitwise not is not supported; value replaced by nil");
                        self.fs().emit_abc(OpCode::LoadNil, dest, 0, 0);
                        self.fs().free_reg = save;
                        return Ok(());
                    }
                };
                let reg = self.expr_to_any_reg(operand)?;
                self.fs().emit_abc(opcode, dest, reg, 0);
            }
            Expr::Paren(inner) => self.expr_to_reg(inner, dest)?,
        }
        self.fs().free_reg = save;
        Ok(())
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, dest: u8) -> ProtectResult<()> {
        let arith = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::IDiv => OpCode::IDiv,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Concat => OpCode::Concat,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                return self.compare(op, lhs, rhs, dest);
            }
            BinOp::And | BinOp::Or => return self.logical(op, lhs, rhs, dest),
            BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
                tracing::warn!(op = ?op, "Bitwise operator is not supported; value replaced by nil");
                self.fs().emit_abc(OpCode::LoadNil, dest, 0, 0);
                return Ok(());
            }
        };
        let l = self.expr_to_any_reg(lhs)?;
        let r = self.expr_to_any_reg(rhs)?;
        self.fs().emit_abc(arith, dest, l, r);
        Ok(())
    }

    /// `CMP sense l r; JMP +1; LOADBOOL d 0 1; LOADBOOL d 1 0`
    fn compare(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, dest: u8) -> ProtectResult<()> {
        let (opcode, sense, swap) = match op {
            BinOp::Eq => (OpCode::Eq, 1, false),
            BinOp::Ne => (OpCode::Eq, 0, false),
            BinOp::Lt => (OpCode::Lt, 1, false),
            BinOp::Le => (OpCode::Le, 1, false),
            BinOp::Gt => (OpCode::Lt, 1, true),
            _ => (OpCode::Le, 1, true),
        };
        let l = self.expr_to_any_reg(lhs)?;
        let r = self.expr_to_any_reg(rhs)?;
        let (b, c) = if swap { (r, l) } else { (l, r) };

        let fs = self.fs();
        fs.emit_abc(opcode, sense, b, c);
        let to_true = fs.emit_jump();
        fs.emit_abc(OpCode::LoadBool, dest, 0, 1);
        let load_true = fs.emit_abc(OpCode::LoadBool, dest, 1, 0);
        fs.patch_jump(to_true, load_true)
    }

    /// Short-circuit `and`/`or` through `TESTSET`
    fn logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, dest: u8) -> ProtectResult<()> {
        let save = self.fs().free_reg;
        let l = self.expr_to_any_reg(lhs)?;
        let keep_when_truthy = u8::from(op == BinOp::Or);
        self.fs().emit_abc(OpCode::TestSet, dest, l, keep_when_truthy);
        let to_end = self.fs().emit_jump();
        self.fs().free_reg = save;
        self.expr_to_reg(rhs, dest)?;
        self.fs().patch_here(to_end)
    }

    fn table(&mut self, fields: &[Field], dest: u8) -> ProtectResult<()> {
        // SETLIST reads values directly above the table register
        let table = if self.fs().free_reg == dest as usize + 1 {
            dest
        } else {
            self.fs().reserve(1)?
        };
        self.fs().emit_abc(OpCode::NewTable, table, 0, 0);

        let mut array_index: i64 = 0;
        for (i, field) in fields.iter().enumerate() {
            let save = self.fs().free_reg;
            match field {
                Field::Named(name, value) => {
                    let key = self.constant_to_next_reg(Constant::String(name.as_bytes().to_vec()))?;
                    let value = self.expr_to_any_reg(value)?;
                    self.fs().emit_abc(OpCode::SetTable, table, key, value);
                }
                Field::Keyed(key, value) => {
                    let key = self.expr_to_any_reg(key)?;
                    let value = self.expr_to_any_reg(value)?;
                    self.fs().emit_abc(OpCode::SetTable, table, key, value);
                }
                Field::Positional(value) => {
                    array_index += 1;
                    if i + 1 == fields.len() && value.is_multi() {
                        self.multi(value, None)?;
                        let start = u16::try_from(array_index).map_err(|_| {
                            ProtectError::Compile("table constructor too long".to_string())
                        })?;
                        self.fs().emit(Instruction::abx(OpCode::SetList, table, start));
                    } else {
                        let key = self.constant_to_next_reg(Constant::Integer(array_index))?;
                        let value = self.expr_to_any_reg(value)?;
                        self.fs().emit_abc(OpCode::SetTable, table, key, value);
                    }
                }
            }
            self.fs().free_reg = save;
        }

        if table != dest {
            self.fs().emit_abc(OpCode::Move, dest, table, 0);
        }
        Ok(())
    }
}

/// Encode a value count as a `B`/`C` operand (count + 1)
fn count_operand(n: usize) -> ProtectResult<u8> {
    u8::try_from(n + 1)
        .map_err(|_| ProtectError::Compile(format!("too many values ({n}) in one list")))
}
