//! Identifier, opaque predicate, and dead code generation for the emitted VM

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// Lua reserved words
pub const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Globals the generated program reads; random names must never shadow them
const RESERVED_GLOBALS: &[&str] = &[
    "_G", "_ENV", "_VERSION", "assert", "collectgarbage", "coroutine", "debug", "dofile", "error",
    "getfenv", "getmetatable", "io", "ipairs", "load", "loadfile", "loadstring", "math", "module",
    "next", "os", "package", "pairs", "pcall", "print", "rawequal", "rawget", "rawlen", "rawset",
    "require", "select", "setfenv", "setmetatable", "string", "table", "tonumber", "tostring",
    "type", "unpack", "utf8", "xpcall",
];

const FIRST_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_";
const REST_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_0123456789";

/// Whether `name` can't be used for a generated identifier
pub fn is_reserved(name: &str) -> bool {
    LUA_KEYWORDS.contains(&name) || RESERVED_GLOBALS.contains(&name)
}

// ============================================================================
// Names
// ============================================================================

/// Random identifier source with per-role stable names
#[derive(Debug, Default)]
pub struct NameGenerator {
    /// Role to generated name
    name_map: HashMap<String, String>,
    /// Every name handed out so far
    used: HashSet<String>,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh identifier of 6 to 13 characters, unique within this generator
    pub fn fresh<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        loop {
            let len = rng.gen_range(6..14);
            let mut name = String::with_capacity(len);
            name.push(FIRST_CHARS[rng.gen_range(0..FIRST_CHARS.len())] as char);
            for _ in 1..len {
                name.push(REST_CHARS[rng.gen_range(0..REST_CHARS.len())] as char);
            }
            if !is_reserved(&name) && self.used.insert(name.clone()) {
                return name;
            }
        }
    }

    /// The identifier bound to `role`, generated on first use
    pub fn name<R: Rng + ?Sized>(&mut self, role: &str, rng: &mut R) -> String {
        if let Some(name) = self.name_map.get(role) {
            return name.clone();
        }
        let name = self.fresh(rng);
        self.name_map.insert(role.to_string(), name.clone());
        name
    }

    /// Get the role mapping
    pub fn get_mapping(&self) -> &HashMap<String, String> {
        &self.name_map
    }
}

// ============================================================================
// Opaque predicates
// ============================================================================

/// Local aliases an opaque predicate may call
#[derive(Debug, Clone)]
pub struct PredicateAliases {
    pub type_fn: String,
    pub floor_fn: String,
}

/// Always-true expressions over a numeric variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaquePredicate {
    MulZero,
    SelfSub,
    Trichotomy,
    SameType,
    Square,
    Parity,
    AddSub,
    Reflexive,
}

impl OpaquePredicate {
    pub const ALL: [OpaquePredicate; 8] = [
        OpaquePredicate::MulZero,
        OpaquePredicate::SelfSub,
        OpaquePredicate::Trichotomy,
        OpaquePredicate::SameType,
        OpaquePredicate::Square,
        OpaquePredicate::Parity,
        OpaquePredicate::AddSub,
        OpaquePredicate::Reflexive,
    ];

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    /// Render over `v`, which must hold a finite number
    pub fn render(self, v: &str, aliases: &PredicateAliases) -> String {
        let t = &aliases.type_fn;
        let f = &aliases.floor_fn;
        match self {
            OpaquePredicate::MulZero => format!("(({v}*0+1)==1)"),
            OpaquePredicate::SelfSub => format!("(({v}-{v})==0)"),
            OpaquePredicate::Trichotomy => format!("(({v}>=0)or({v}<0))"),
            OpaquePredicate::SameType => format!("({t}({v})=={t}({v}))"),
            OpaquePredicate::Square => format!("(({v}*{v})>=0)"),
            OpaquePredicate::Parity => format!("(({f}({v})%2==0)or({f}({v})%2==1))"),
            OpaquePredicate::AddSub => format!("((({v}+7)-7)=={v})"),
            OpaquePredicate::Reflexive => format!("(not ({v}~={v}))"),
        }
    }
}

// ============================================================================
// Dead code
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadCodeKind {
    UnusedBinding,
    ZeroLoop,
    UnreachableIf,
    UnusedTable,
    WhileFalse,
}

impl DeadCodeKind {
    pub const ALL: [DeadCodeKind; 5] = [
        DeadCodeKind::UnusedBinding,
        DeadCodeKind::ZeroLoop,
        DeadCodeKind::UnreachableIf,
        DeadCodeKind::UnusedTable,
        DeadCodeKind::WhileFalse,
    ];
}

/// Dead code over a fixed set of numeric junk locals
///
/// Snippets are safe to execute: they only read the junk locals, and any
/// write sits behind a condition that never holds.
#[derive(Debug, Clone)]
pub struct DeadCode {
    junk: Vec<String>,
}

impl DeadCode {
    pub fn new(junk: Vec<String>) -> Self {
        Self { junk }
    }

    fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        self.junk.choose(rng).map(String::as_str).unwrap_or("0")
    }

    pub fn render<R: Rng + ?Sized>(
        &self,
        kind: DeadCodeKind,
        rng: &mut R,
        names: &mut NameGenerator,
    ) -> String {
        match kind {
            DeadCodeKind::UnusedBinding => {
                let name = names.fresh(rng);
                format!("local {name}={}+{}", self.pick(rng), self.pick(rng))
            }
            DeadCodeKind::ZeroLoop => {
                let name = names.fresh(rng);
                let target = self.pick(rng);
                format!("for {name}=1,0 do {target}={target}+{} end", self.pick(rng))
            }
            DeadCodeKind::UnreachableIf => {
                let target = self.pick(rng);
                format!("if false then {target}={}*3 end", self.pick(rng))
            }
            DeadCodeKind::UnusedTable => {
                let name = names.fresh(rng);
                let label = names.fresh(rng);
                format!(
                    "local {name}={{{},{:.6},\"{label}\"}}",
                    self.pick(rng),
                    rng.gen::<f64>()
                )
            }
            DeadCodeKind::WhileFalse => {
                let target = self.pick(rng);
                format!("while false do {target}={target}-1 end")
            }
        }
    }

    /// A snippet of a random kind
    pub fn snippet<R: Rng + ?Sized>(&self, rng: &mut R, names: &mut NameGenerator) -> String {
        let kind = DeadCodeKind::ALL[rng.gen_range(0..DeadCodeKind::ALL.len())];
        self.render(kind, rng, names)
    }
}
