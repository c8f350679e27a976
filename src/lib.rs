//! LuaVM Protect - Lua Script Protection
//!
//! Turns a Lua script into a self-contained program that carries its own
//! virtual machine. The original source never appears in the output.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Protect Time (Dev Machine)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  .lua ──► lexer/parser ──► AST ──► compiler ──► chunk tree      │
//! │                                                   │             │
//! │                                                   ▼             │
//! │              opcode scramble (fresh map + 30 decoy codes)       │
//! │                                                   │             │
//! │                                                   ▼             │
//! │         keys (16/8/4) ──► polynomial ──► LFSR  + checksum       │
//! │                                                   │             │
//! │                                                   ▼             │
//! │        runtime generator ──► protected .lua (VM + data)         │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Runtime (any Lua 5.1+)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. verify checksum + length ──► error("Tampered") on mismatch  │
//! │                                                                 │
//! │  2. LFSR ──► polynomial ──► keys (reverse) ──► instruction bytes│
//! │                                                                 │
//! │  3. shuffled dispatcher executes the register bytecode          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use luavm_protect::{Protector, ProtectConfig};
//!
//! let program = luavm_protect::obfuscate("print('hello')")?;
//!
//! let protector = Protector::new(ProtectConfig::new().check_balance(true));
//! let summary = protector.protect_directory("src".as_ref(), "dist".as_ref())?;
//! ```

pub mod ast;
pub mod balance;
pub mod bytecode;
pub mod compiler;
mod config;
pub mod crypto;
mod error;
pub mod lexer;
pub mod obfuscator;
pub mod parser;
mod protector;
mod runtime_gen;
pub mod scrambler;

pub use balance::{check_balance, BalanceReport};
pub use bytecode::{Chunk, Constant, Instruction, OpCode, UpvalueDesc};
pub use config::ProtectConfig;
pub use crypto::{CipherContext, EncryptedChunk};
pub use error::{ProtectError, ProtectResult};
pub use protector::{ProtectOutput, ProtectSummary, Protector};
pub use runtime_gen::RuntimeGenerator;
pub use scrambler::OpcodeMap;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Obfuscate Lua source with the default configuration
///
/// Fails with [`ProtectError::Parse`] on malformed input and never returns a
/// partial program. Every call draws fresh keys, opcode codes, and names.
pub fn obfuscate(source: &str) -> ProtectResult<String> {
    Protector::new(ProtectConfig::default()).obfuscate(source)
}
