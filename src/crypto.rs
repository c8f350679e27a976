//! Layered byte cipher for compiled instruction streams
//!
//! Every chunk's flattened code goes through three reversible stages:
//! - **Keys**: additive layer over three cyclic keys (16, 8, then 4 bytes)
//! - **Polynomial**: adds a cubic over an evolving state and the position
//! - **LFSR**: XOR with the low byte of a 16-bit Galois LFSR
//!
//! The checksum and length of the encrypted bytes travel with the chunk and
//! are verified before anything is decoded. The stages deter casual reading
//! of the emitted data; they are not a cryptographic construction.

use crate::bytecode::{Chunk, Constant, UpvalueDesc};
use crate::scrambler::OpcodeMap;
use crate::{ProtectError, ProtectResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Lengths of the additive keys, in the order they are applied
pub const KEY_LENGTHS: [usize; 3] = [16, 8, 4];

/// Galois tap mask of the 16-bit LFSR
pub const LFSR_TAPS: u16 = 0xB400;

/// Checksums are taken modulo this value
pub const CHECKSUM_MODULUS: u32 = 65536;

// ============================================================================
// Cipher Context
// ============================================================================

/// Coefficients of `f = (a·x³ + b·y² + c·z + d) mod 256`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolyCoefficients {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    /// Initial value of the evolving state `x`
    pub seed: u32,
}

impl PolyCoefficients {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            a: rng.gen_range(3..=19),
            b: rng.gen_range(5..=27),
            c: rng.gen_range(7..=37),
            d: rng.gen_range(11..=51),
            seed: rng.gen_range(0..=255),
        }
    }
}

/// Random key material shared by every chunk of one obfuscation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherContext {
    pub keys: [Vec<u8>; 3],
    pub poly: PolyCoefficients,
    /// Never zero: a zero LFSR state stays zero
    pub lfsr_seed: u16,
}

impl CipherContext {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let keys: [Vec<u8>; 3] = KEY_LENGTHS.map(|len| (0..len).map(|_| rng.gen::<u8>()).collect());
        Self {
            keys,
            poly: PolyCoefficients::generate(rng),
            lfsr_seed: rng.gen_range(1..=u16::MAX),
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

fn add_keys(data: &mut [u8], keys: &[Vec<u8>]) {
    for key in keys.iter().filter(|k| !k.is_empty()) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = byte.wrapping_add(key[i % key.len()]);
        }
    }
}

fn sub_keys(data: &mut [u8], keys: &[Vec<u8>]) {
    for key in keys.iter().rev().filter(|k| !k.is_empty()) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = byte.wrapping_sub(key[i % key.len()]);
        }
    }
}

/// The value added at each position by the polynomial layer
fn poly_stream(poly: &PolyCoefficients, len: usize) -> impl Iterator<Item = u8> + '_ {
    let mut x = poly.seed % 256;
    (0..len).map(move |i| {
        let i = i as u32;
        let y = (i.wrapping_mul(7) + 13) % 256;
        let z = (i.wrapping_mul(11) + 17) % 256;
        let f = (poly.a * x * x * x + poly.b * y * y + poly.c * z + poly.d) % 256;
        x = (x * 17 + i + 31) % 256;
        f as u8
    })
}

fn poly_encrypt(data: &mut [u8], poly: &PolyCoefficients) {
    let len = data.len();
    for (byte, f) in data.iter_mut().zip(poly_stream(poly, len)) {
        *byte = byte.wrapping_add(f);
    }
}

fn poly_decrypt(data: &mut [u8], poly: &PolyCoefficients) {
    let len = data.len();
    for (byte, f) in data.iter_mut().zip(poly_stream(poly, len)) {
        *byte = byte.wrapping_sub(f);
    }
}

/// Self-inverse: shift once, then XOR with the low byte
fn lfsr_xor(data: &mut [u8], seed: u16) {
    let mut state = seed;
    for byte in data.iter_mut() {
        let lsb = state & 1;
        state >>= 1;
        if lsb == 1 {
            state ^= LFSR_TAPS;
        }
        *byte ^= (state & 0xFF) as u8;
    }
}

/// Sum of the bytes modulo 65536
pub fn checksum(data: &[u8]) -> u16 {
    (data.iter().map(|&b| b as u32).sum::<u32>() % CHECKSUM_MODULUS) as u16
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Apply keys, polynomial, then LFSR
pub fn encode(bytes: &[u8], ctx: &CipherContext) -> Vec<u8> {
    let mut data = bytes.to_vec();
    add_keys(&mut data, &ctx.keys);
    poly_encrypt(&mut data, &ctx.poly);
    lfsr_xor(&mut data, ctx.lfsr_seed);
    data
}

/// Verify length and checksum, then undo the stages in reverse order
pub fn decode(
    bytes: &[u8],
    ctx: &CipherContext,
    expected_checksum: u16,
    expected_len: usize,
) -> ProtectResult<Vec<u8>> {
    if bytes.len() != expected_len {
        return Err(ProtectError::Integrity(format!(
            "length {} does not match recorded length {}",
            bytes.len(),
            expected_len
        )));
    }
    let actual = checksum(bytes);
    if actual != expected_checksum {
        return Err(ProtectError::Integrity(format!(
            "checksum {actual} does not match recorded checksum {expected_checksum}"
        )));
    }

    let mut data = bytes.to_vec();
    lfsr_xor(&mut data, ctx.lfsr_seed);
    poly_decrypt(&mut data, &ctx.poly);
    sub_keys(&mut data, &ctx.keys);
    Ok(data)
}

// ============================================================================
// Encrypted Chunk Format
// ============================================================================

/// A chunk tree with every instruction stream encrypted
///
/// Constants, prototypes, and upvalue descriptors stay in the clear; they are
/// written out as literal tables next to the encrypted code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    /// Encrypted `[code(op), A, B, C]` stream
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub protos: Vec<EncryptedChunk>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub checksum: u16,
    pub len: usize,
}

impl EncryptedChunk {
    /// Flatten through the opcode map and encrypt the whole tree
    pub fn encrypt(chunk: &Chunk, map: &OpcodeMap, ctx: &CipherContext) -> Self {
        let code = encode(&chunk.flatten(map), ctx);
        Self {
            checksum: checksum(&code),
            len: code.len(),
            code,
            constants: chunk.constants.clone(),
            protos: chunk
                .protos
                .iter()
                .map(|proto| Self::encrypt(proto, map, ctx))
                .collect(),
            upvalues: chunk.upvalues.clone(),
            num_params: chunk.num_params,
            is_vararg: chunk.is_vararg,
        }
    }

    /// Recover the flattened stream of this chunk alone
    pub fn decrypt_code(&self, ctx: &CipherContext) -> ProtectResult<Vec<u8>> {
        decode(&self.code, ctx, self.checksum, self.len)
    }

    /// Total encrypted bytes in this tree
    pub fn total_bytes(&self) -> usize {
        self.code.len() + self.protos.iter().map(Self::total_bytes).sum::<usize>()
    }
}

// ============================================================================
// Tests
// ============================================================================
