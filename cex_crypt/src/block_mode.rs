//! Block cipher chaining modes with a deterministic parallel decomposition.
//!
//! The engine produces byte-identical output whether a transform runs on the
//! calling thread or across the worker pool. Parallelizable combinations are
//! CTR (both directions), CBC decrypt, and CFB decrypt; everything else runs
//! serially regardless of the parallel toggle.
//!
//! Work is decomposed by contiguous block ranges: a parallel unit of
//! `parallel_block_size` bytes is cut into `thread_count` chunks of equal
//! block count, the last chunk absorbing any remainder. In CTR each chunk
//! seeds its own counter at `base + start_block`; in CBC/CFB decrypt each
//! chunk reads its predecessor block straight out of the ciphertext. Bytes
//! past the last full unit are processed serially at the advanced position.

use crate::keyed_material::KeyMaterial;
use crate::misc::CryptError;
pub use crate::registry::Direction;
use crate::registry::{self, BlockCipher};
use cex_types::crypto::{CipherDescription, CipherEngine, CipherMode};
use rayon::prelude::*;
use zeroize::Zeroizing;

/// Ceiling for one spawn-and-join unit
pub const PARALLEL_MAX_SIZE: usize = 100 * 1024 * 1024;

const DEFAULT_BYTES_PER_THREAD: usize = 64 * 1024;

/// Worker-count ceiling; a power of two so that common power-of-two unit
/// sizes stay multiples of `parallel_min_size`
const MAX_PARALLEL_THREADS: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum EngineState {
    Init,
    Ready,
}

/// CTR/CBC/CFB/OFB over a [BlockCipher]
pub struct BlockModeEngine {
    mode: CipherMode,
    cipher: Box<dyn BlockCipher>,
    state: EngineState,
    direction: Direction,
    chain: Zeroizing<Vec<u8>>,
    counter: u128,
    parallel: bool,
    parallel_block_size: usize,
    thread_count: usize,
}

impl BlockModeEngine {
    pub fn new(mode: CipherMode, cipher: Box<dyn BlockCipher>) -> Self {
        let hardware = rayon::current_num_threads().max(1);
        let thread_count = hardware
            .checked_next_power_of_two()
            .map(|next| if next == hardware { next } else { next / 2 })
            .unwrap_or(1)
            .clamp(1, MAX_PARALLEL_THREADS);

        Self {
            mode,
            cipher,
            state: EngineState::Init,
            direction: Direction::Encrypt,
            chain: Zeroizing::new(Vec::new()),
            counter: 0,
            parallel: true,
            parallel_block_size: thread_count * DEFAULT_BYTES_PER_THREAD,
            thread_count,
        }
    }

    /// Builds the engine described by `description` via the registry
    pub fn from_description(description: &CipherDescription) -> Result<Self, CryptError> {
        match description.engine {
            CipherEngine::Block(kind) => Ok(Self::new(
                description.mode,
                registry::block_cipher_of(kind)?,
            )),
            CipherEngine::Stream(_) => Err(CryptError::Unsupported(
                "stream engines do not run under a block mode",
            )),
        }
    }

    /// Keys the engine. Must precede any transform. The IV length must
    /// equal the cipher block size.
    pub fn init(&mut self, direction: Direction, key: &KeyMaterial) -> Result<(), CryptError> {
        let bs = self.cipher.block_size();
        if key.iv().len() != bs {
            return Err(CryptError::InvalidParameter(format!(
                "iv must equal the {bs}-byte block size, got {}",
                key.iv().len()
            )));
        }

        if self.mode == CipherMode::Ctr && bs != 16 {
            return Err(CryptError::Unsupported(
                "counter mode requires a 128-bit block",
            ));
        }

        // CTR/CFB/OFB only ever run the raw cipher forward
        let cipher_direction = match self.mode {
            CipherMode::Cbc => direction,
            _ => Direction::Encrypt,
        };
        self.cipher.init(cipher_direction, key)?;

        self.direction = direction;
        self.chain = Zeroizing::new(key.iv().to_vec());
        if self.mode == CipherMode::Ctr {
            let mut ctr = [0u8; 16];
            ctr.copy_from_slice(key.iv());
            self.counter = u128::from_be_bytes(ctr);
        }
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    /// The smallest valid parallel unit: one block per worker
    pub fn parallel_min_size(&self) -> usize {
        self.block_size() * self.thread_count
    }

    pub fn parallel_max_size(&self) -> usize {
        PARALLEL_MAX_SIZE
    }

    pub fn parallel_block_size(&self) -> usize {
        self.parallel_block_size
    }

    /// Sets the spawn-and-join unit size; must be a multiple of
    /// [Self::parallel_min_size] within `[min, max]`
    pub fn set_parallel_block_size(&mut self, size: usize) -> Result<(), CryptError> {
        let min = self.parallel_min_size();
        if size < min || size > self.parallel_max_size() || size % min != 0 {
            return Err(CryptError::InvalidParameter(format!(
                "parallel block size {size} must be a multiple of {min} within [{min}, {}]",
                self.parallel_max_size()
            )));
        }

        self.parallel_block_size = size;
        Ok(())
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    /// Transforms exactly one block at the given offsets
    pub fn transform_block(
        &mut self,
        in_buf: &[u8],
        in_off: usize,
        out_buf: &mut [u8],
        out_off: usize,
    ) -> Result<(), CryptError> {
        let bs = self.block_size();
        if in_off + bs > in_buf.len() || out_off + bs > out_buf.len() {
            return Err(CryptError::InvalidParameter(
                "block offset out of bounds".to_string(),
            ));
        }

        self.ensure_ready()?;
        self.transform_serial(&in_buf[in_off..in_off + bs], &mut out_buf[out_off..out_off + bs])
    }

    /// Transforms `input` into `output` (equal lengths). CTR accepts any
    /// length; the chained modes require whole blocks.
    pub fn transform(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError> {
        self.ensure_ready()?;
        if input.len() != output.len() {
            return Err(CryptError::InvalidParameter(
                "input and output lengths differ".to_string(),
            ));
        }

        let bs = self.block_size();
        if self.mode != CipherMode::Ctr && input.len() % bs != 0 {
            return Err(CryptError::InvalidParameter(format!(
                "{:?} input must be a multiple of the {bs}-byte block size",
                self.mode
            )));
        }

        let unit = self.parallel_block_size;
        let mut offset = 0;
        if self.parallel_path_available() {
            while input.len() - offset >= unit {
                self.transform_unit_parallel(
                    &input[offset..offset + unit],
                    &mut output[offset..offset + unit],
                )?;
                offset += unit;
            }
        }

        if offset < input.len() {
            self.transform_serial(&input[offset..], &mut output[offset..])?;
        }

        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), CryptError> {
        if self.state != EngineState::Ready {
            return Err(CryptError::NotInitialized);
        }
        Ok(())
    }

    fn parallel_path_available(&self) -> bool {
        self.parallel
            && matches!(
                (self.mode, self.direction),
                (CipherMode::Ctr, _)
                    | (CipherMode::Cbc, Direction::Decrypt)
                    | (CipherMode::Cfb, Direction::Decrypt)
            )
    }

    /// One whole parallel unit; `input.len()` is a multiple of
    /// `parallel_min_size`
    fn transform_unit_parallel(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptError> {
        let bs = self.block_size();
        let total_blocks = input.len() / bs;
        let chunks = split_output_chunks(output, bs, total_blocks, self.thread_count);

        match (self.mode, self.direction) {
            (CipherMode::Ctr, _) => {
                let base = self.counter;
                chunks.into_par_iter().try_for_each(|(start_block, out)| {
                    let cipher = self.cipher.clone_instance();
                    let mut counter = base.wrapping_add(start_block as u128);
                    let mut keystream = [0u8; 16];
                    let in_chunk = &input[start_block * bs..start_block * bs + out.len()];
                    for (in_block, out_block) in in_chunk.chunks(bs).zip(out.chunks_mut(bs)) {
                        cipher.transform_block(&counter.to_be_bytes(), &mut keystream)?;
                        for (dst, (src, ks)) in
                            out_block.iter_mut().zip(in_block.iter().zip(&keystream))
                        {
                            *dst = src ^ ks;
                        }
                        counter = counter.wrapping_add(1);
                    }
                    Ok::<(), CryptError>(())
                })?;
                self.counter = self.counter.wrapping_add(total_blocks as u128);
            }
            (CipherMode::Cbc, Direction::Decrypt) | (CipherMode::Cfb, Direction::Decrypt) => {
                let chain = &self.chain;
                let cfb = self.mode == CipherMode::Cfb;
                chunks.into_par_iter().try_for_each(|(start_block, out)| {
                    let cipher = self.cipher.clone_instance();
                    let mut scratch = vec![0u8; bs];
                    let scratch = &mut scratch[..];
                    for (idx, out_block) in out.chunks_mut(bs).enumerate() {
                        let block = start_block + idx;
                        let prev: &[u8] = if block == 0 {
                            chain
                        } else {
                            &input[(block - 1) * bs..block * bs]
                        };
                        let cur = &input[block * bs..(block + 1) * bs];
                        if cfb {
                            // p_i = E(c_{i-1}) ^ c_i
                            cipher.transform_block(prev, scratch)?;
                            for (dst, (ks, src)) in
                                out_block.iter_mut().zip(scratch.iter().zip(cur))
                            {
                                *dst = ks ^ src;
                            }
                        } else {
                            // p_i = D(c_i) ^ c_{i-1}
                            cipher.transform_block(cur, scratch)?;
                            for (dst, (dec, prv)) in
                                out_block.iter_mut().zip(scratch.iter().zip(prev))
                            {
                                *dst = dec ^ prv;
                            }
                        }
                    }
                    Ok::<(), CryptError>(())
                })?;
                self.chain
                    .copy_from_slice(&input[(total_blocks - 1) * bs..total_blocks * bs]);
            }
            _ => unreachable!("serial-only combination routed to the parallel path"),
        }

        Ok(())
    }

    fn transform_serial(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError> {
        let bs = self.block_size();
        match (self.mode, self.direction) {
            (CipherMode::Ctr, _) => {
                let mut keystream = [0u8; 16];
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    self.cipher
                        .transform_block(&self.counter.to_be_bytes(), &mut keystream)?;
                    for (dst, (src, ks)) in
                        out_block.iter_mut().zip(in_block.iter().zip(&keystream))
                    {
                        *dst = src ^ ks;
                    }
                    self.counter = self.counter.wrapping_add(1);
                }
            }
            (CipherMode::Cbc, Direction::Encrypt) => {
                let mut mixed = Zeroizing::new(vec![0u8; bs]);
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    for (dst, (src, chained)) in
                        mixed.iter_mut().zip(in_block.iter().zip(self.chain.iter()))
                    {
                        *dst = src ^ chained;
                    }
                    self.cipher.transform_block(&mixed, out_block)?;
                    self.chain.copy_from_slice(out_block);
                }
            }
            (CipherMode::Cbc, Direction::Decrypt) => {
                let mut decrypted = Zeroizing::new(vec![0u8; bs]);
                let mut next_chain = vec![0u8; bs];
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    next_chain.copy_from_slice(in_block);
                    self.cipher.transform_block(in_block, &mut decrypted)?;
                    for (dst, (dec, chained)) in out_block
                        .iter_mut()
                        .zip(decrypted.iter().zip(self.chain.iter()))
                    {
                        *dst = dec ^ chained;
                    }
                    self.chain.copy_from_slice(&next_chain);
                }
            }
            (CipherMode::Cfb, Direction::Encrypt) => {
                let mut keystream = Zeroizing::new(vec![0u8; bs]);
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    self.cipher.transform_block(&self.chain, &mut keystream)?;
                    for (dst, (src, ks)) in
                        out_block.iter_mut().zip(in_block.iter().zip(keystream.iter()))
                    {
                        *dst = src ^ ks;
                    }
                    self.chain.copy_from_slice(out_block);
                }
            }
            (CipherMode::Cfb, Direction::Decrypt) => {
                let mut keystream = Zeroizing::new(vec![0u8; bs]);
                let mut next_chain = vec![0u8; bs];
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    next_chain.copy_from_slice(in_block);
                    self.cipher.transform_block(&self.chain, &mut keystream)?;
                    for (dst, (src, ks)) in
                        out_block.iter_mut().zip(in_block.iter().zip(keystream.iter()))
                    {
                        *dst = src ^ ks;
                    }
                    self.chain.copy_from_slice(&next_chain);
                }
            }
            (CipherMode::Ofb, _) => {
                let mut next = vec![0u8; bs];
                for (in_block, out_block) in input.chunks(bs).zip(output.chunks_mut(bs)) {
                    self.cipher.transform_block(&self.chain, &mut next)?;
                    self.chain.copy_from_slice(&next);
                    for (dst, (src, ks)) in
                        out_block.iter_mut().zip(in_block.iter().zip(self.chain.iter()))
                    {
                        *dst = src ^ ks;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Cuts `output` into `thread_count` contiguous chunks of equal block count,
/// the last absorbing the remainder. Returns (start block, slice) pairs.
fn split_output_chunks(
    output: &mut [u8],
    block_size: usize,
    total_blocks: usize,
    thread_count: usize,
) -> Vec<(usize, &mut [u8])> {
    let blocks_per_chunk = total_blocks / thread_count;
    let mut chunks = Vec::with_capacity(thread_count);
    let mut rest = output;
    let mut start_block = 0;

    for idx in 0..thread_count {
        let count = if idx == thread_count - 1 {
            total_blocks - start_block
        } else {
            blocks_per_chunk
        };
        let (chunk, tail) = rest.split_at_mut(count * block_size);
        chunks.push((start_block, chunk));
        rest = tail;
        start_block += count;
    }

    chunks
}
