//! Abstract syntax tree for the supported Lua subset
//!
//! The tree is closed: every construct the parser accepts has a variant here,
//! and the compiler matches on it exhaustively. Syntax that parses but has no
//! bytecode lowering (labels, `goto`, bitwise operators) is still represented
//! so the compiler can log it and degrade instead of failing.

/// A sequence of statements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub stats: Vec<Stat>,
}

/// Numeric literal, keeping Lua's integer/float distinction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stat {
    /// `local a, b = e1, e2`
    Local { names: Vec<String>, exprs: Vec<Expr> },
    /// `t.x, y = e1, e2`
    Assign { targets: Vec<Expr>, exprs: Vec<Expr> },
    /// Function call used as a statement
    Call(Expr),
    /// `if c then .. elseif c then .. else .. end`
    If {
        clauses: Vec<(Expr, Block)>,
        else_block: Option<Block>,
    },
    While { cond: Expr, body: Block },
    Repeat { body: Block, cond: Expr },
    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        vars: Vec<String>,
        exprs: Vec<Expr>,
        body: Block,
    },
    /// `function a.b.c:m(...) end`
    Function { name: FuncName, body: FuncBody },
    /// `local function f(...) end`
    LocalFunction { name: String, body: FuncBody },
    Do(Block),
    Return(Vec<Expr>),
    Break,
    /// Parsed but not lowered (`goto`, `::label::`)
    Unhandled(&'static str),
}

/// Dotted name of a function statement
#[derive(Debug, Clone, PartialEq)]
pub struct FuncName {
    pub base: String,
    pub fields: Vec<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    Number(Number),
    String(Vec<u8>),
    Vararg,
    Function(Box<FuncBody>),
    Table(Vec<Field>),
    Name(String),
    /// `obj[key]`; `obj.name` is parsed with a string key
    Index { obj: Box<Expr>, key: Box<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr> },
    MethodCall {
        obj: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnOp, operand: Box<Expr> },
    /// Parenthesized expression; truncates multiple results to one
    Paren(Box<Expr>),
}

impl Expr {
    /// Whether the expression can produce a variable number of values
    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Vararg
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `name = value`
    Named(String, Expr),
    /// `[key] = value`
    Keyed(Expr, Expr),
    /// `value`
    Positional(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl BinOp {
    /// Left and right binding power, following the Lua 5.4 reference manual
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::BAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            // right associative
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            // right associative
            BinOp::Pow => (14, 13),
        }
    }
}

/// Binding power of unary operators
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}
