//! Per-call opcode randomization with decoy codes

use crate::bytecode::OpCode;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

/// Number of decoy codes mixed into the dispatcher
pub const DECOY_COUNT: u8 = 30;

/// First decoy identifier; decoys occupy `DECOY_BASE..DECOY_BASE + DECOY_COUNT`
const DECOY_BASE: u8 = 100;

/// Bijection from real opcodes to byte codes, plus decoys that map to nothing
#[derive(Debug, Clone)]
pub struct OpcodeMap {
    codes: [u8; OpCode::ALL.len()],
    decoys: Vec<u8>,
    inverse: HashMap<u8, OpCode>,
}

impl OpcodeMap {
    /// Shuffle the real identifiers together with the decoy identifiers and
    /// hand the first slots to real opcodes
    pub fn scramble<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let real = OpCode::ALL.len() as u8;
        let mut pool: Vec<u8> = (0..real)
            .chain(DECOY_BASE..DECOY_BASE + DECOY_COUNT)
            .collect();
        pool.shuffle(rng);

        let mut codes = [0u8; OpCode::ALL.len()];
        codes.copy_from_slice(&pool[..OpCode::ALL.len()]);
        let decoys = pool[OpCode::ALL.len()..].to_vec();
        let inverse = OpCode::ALL
            .iter()
            .map(|&op| (codes[op.id()], op))
            .collect();

        tracing::debug!(decoys = decoys.len(), "Scrambled opcode map");
        Self {
            codes,
            decoys,
            inverse,
        }
    }

    /// Byte code assigned to a real opcode
    pub fn code(&self, op: OpCode) -> u8 {
        self.codes[op.id()]
    }

    pub fn decoys(&self) -> &[u8] {
        &self.decoys
    }

    /// Real opcode behind a byte code, `None` for decoys and unused codes
    pub fn opcode(&self, code: u8) -> Option<OpCode> {
        self.inverse.get(&code).copied()
    }
}
