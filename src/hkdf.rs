//! # HKDF Key Expansion
//!
//! HMAC-based extract-and-expand key derivation (the RFC 5869 construction)
//! exposed as a lazy byte stream. One shared secret feeds a [`HkdfStream`],
//! and callers pull as many key bytes as they need, in whatever read sizes
//! they like; the session layer uses this to derive a cipher key and IV from
//! a single expander without agreeing on offsets.
//!
//! ## Construction
//!
//! - **Extract**: `prk = HMAC(salt, ikm)`, where an absent or empty salt is
//!   replaced by `HashLen` zero bytes.
//! - **Expand**: `T(i) = HMAC(prk, T(i-1) || info || i)` for `i` in `1..=255`,
//!   with `T(0)` empty. The stream is the concatenation of the blocks.
//!
//! The total output is capped at `255 * HashLen` bytes; a read that would
//! cross the cap fails with [`ExpansionExhausted`] without consuming any
//! stream state. Reads are partition-independent: pulling `N` bytes one at a
//! time yields exactly the same bytes as one `N`-byte read.

use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::{Digest, Output};
use hmac::{Mac, SimpleHmac};

/// Maximum number of expansion blocks the construction permits.
const MAX_BLOCKS: usize = 255;

/// Returned when a read would push the cumulative output of an expander
/// past the `255 * HashLen` limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpansionExhausted {
    /// Size of the rejected read request.
    pub requested: usize,
    /// Bytes that were still available under the cap.
    pub remaining: usize,
}

impl std::fmt::Display for ExpansionExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "key expansion exhausted: {} bytes requested, {} remaining under the 255-block cap",
            self.requested, self.remaining
        )
    }
}

impl std::error::Error for ExpansionExhausted {}

/// Lazy extract-and-expand stream over hash `D`.
pub struct HkdfStream<D: Digest + BlockSizeUser + Clone> {
    prk: Output<D>,
    info: Vec<u8>,
    block: Output<D>,
    /// Consumed bytes of the current block; `HashLen` forces the next block.
    pos: usize,
    /// Index of the most recently generated block, zero before the first.
    counter: u8,
}

impl<D: Digest + BlockSizeUser + Clone> HkdfStream<D> {
    /// Extracts a pseudorandom key from `ikm` and prepares lazy expansion.
    ///
    /// `None` and `Some(&[])` salts are interchangeable: both select the
    /// zero-filled default key.
    pub fn new(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Self {
        let zeros = Output::<D>::default();
        let salt = match salt {
            Some(s) if !s.is_empty() => s,
            _ => zeros.as_slice(),
        };
        let mut mac =
            SimpleHmac::<D>::new_from_slice(salt).expect("HMAC accepts any key size per RFC 2104");
        mac.update(ikm);
        let prk = mac.finalize().into_bytes();

        HkdfStream {
            prk,
            info: info.to_vec(),
            block: Output::<D>::default(),
            pos: Self::hash_len(),
            counter: 0,
        }
    }

    fn hash_len() -> usize {
        <D as Digest>::output_size()
    }

    /// Bytes still extractable before the expansion cap.
    pub fn remaining(&self) -> usize {
        let produced = match self.counter {
            0 => 0,
            n => (n as usize - 1) * Self::hash_len() + self.pos,
        };
        MAX_BLOCKS * Self::hash_len() - produced
    }

    /// Fills `buf` with the next `buf.len()` bytes of the stream.
    ///
    /// Fails without consuming any output if the request exceeds
    /// [`remaining`](Self::remaining).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ExpansionExhausted> {
        if buf.len() > self.remaining() {
            return Err(ExpansionExhausted {
                requested: buf.len(),
                remaining: self.remaining(),
            });
        }
        let mut written = 0;
        while written < buf.len() {
            if self.pos == Self::hash_len() {
                self.next_block();
            }
            let n = (buf.len() - written).min(Self::hash_len() - self.pos);
            buf[written..written + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        Ok(written)
    }

    /// Convenience wrapper allocating and filling a `len`-byte vector.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, ExpansionExhausted> {
        let mut out = vec![0u8; len];
        self.read(&mut out)?;
        Ok(out)
    }

    fn next_block(&mut self) {
        let mut mac = SimpleHmac::<D>::new_from_slice(&self.prk)
            .expect("HMAC accepts any key size per RFC 2104");
        if self.counter > 0 {
            mac.update(&self.block);
        }
        mac.update(&self.info);
        // The remaining() guard keeps counter strictly below 255 here.
        self.counter += 1;
        mac.update(&[self.counter]);
        self.block = mac.finalize().into_bytes();
        self.pos = 0;
    }
}
