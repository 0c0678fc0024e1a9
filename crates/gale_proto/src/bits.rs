//! Bit-granularity wire codec.
//!
//! All gale packets are serialized through [`BitWriter`] and parsed through
//! [`BitReader`]. Values are packed least-significant-bit first into a 64-bit
//! scratch word; whole bytes are flushed to (or fetched from) the underlying
//! buffer as the scratch fills or drains. This lets headers carry sub-byte
//! fields (a 1-bit keepalive flag, ranged integers) without padding every
//! field to a byte.
//!
//! Encoding is deterministic: equal inputs always produce byte-identical
//! output, and decoding what was encoded yields the original value for every
//! in-range input.

/// Number of bits needed to represent every value in `min..=max`.
///
/// A degenerate range with `min == max` needs 0 bits.
///
/// # Examples
///
/// ```
/// # use gale_proto::bits::bits_required;
/// assert_eq!(bits_required(0, 0), 0);
/// assert_eq!(bits_required(0, 1), 1);
/// assert_eq!(bits_required(0, 255), 8);
/// assert_eq!(bits_required(0, 256), 9);
/// assert_eq!(bits_required(100, 355), 8);
/// assert_eq!(bits_required(0, u32::MAX), 32);
/// ```
#[must_use]
pub const fn bits_required(min: u32, max: u32) -> u32 {
    assert!(min <= max);
    let diff = max - min;
    32 - diff.leading_zeros()
}

const fn mask(bits: u32) -> u64 {
    debug_assert!(bits <= 32);
    (1u64 << bits) - 1
}

/// Error when a value cannot be encoded or decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitsError {
    /// Ran out of buffered bits while reading.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// Value lies outside the range it was declared to be in.
    #[error("value {value} out of range {min}..={max}")]
    OutOfRange {
        /// Value passed in.
        value: u32,
        /// Inclusive range minimum.
        min: u32,
        /// Inclusive range maximum.
        max: u32,
    },
}

/// Appends values to a byte buffer at bit granularity.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
}

impl BitWriter {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            scratch: 0,
            scratch_bits: 0,
        }
    }

    /// Creates an empty writer with space for `cap` bytes pre-allocated.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(cap),
            scratch: 0,
            scratch_bits: 0,
        }
    }

    /// Number of bits written so far, including bits still in the scratch
    /// word.
    #[must_use]
    pub const fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.scratch_bits as usize
    }

    /// Writes the low `bits` bits of `value`.
    ///
    /// Bits above `bits` in `value` are ignored. `bits` must be at most 32;
    /// writing 0 bits is a no-op.
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return;
        }
        self.scratch |= (u64::from(value) & mask(bits)) << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 8 {
            #[expect(clippy::cast_possible_truncation, reason = "masked to one byte")]
            self.bytes.push((self.scratch & 0xff) as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    /// Writes an unsigned integer known to lie in `min..=max`, using
    /// [`bits_required`] bits.
    ///
    /// # Errors
    ///
    /// Errors if `value` lies outside `min..=max`; nothing is written.
    pub fn write_range(&mut self, value: u32, min: u32, max: u32) -> Result<(), BitsError> {
        if value < min || value > max {
            return Err(BitsError::OutOfRange { value, min, max });
        }
        self.write_bits(value - min, bits_required(min, max));
        Ok(())
    }

    /// Writes a signed integer via its zig-zag mapping, so small magnitudes
    /// of either sign stay small on the wire.
    pub fn write_signed(&mut self, value: i32, bits: u32) {
        #[expect(clippy::cast_sign_loss, reason = "zig-zag mapping is bit-exact")]
        let zigzag = ((value << 1) ^ (value >> 31)) as u32;
        self.write_bits(zigzag, bits);
    }

    /// Writes an `f32` as its raw IEEE-754 bits.
    pub fn write_f32(&mut self, value: f32) {
        self.write_bits(value.to_bits(), 32);
    }

    /// Writes an `f64` as its raw IEEE-754 bits.
    pub fn write_f64(&mut self, value: f64) {
        let raw = value.to_bits();
        #[expect(clippy::cast_possible_truncation, reason = "split into halves")]
        self.write_bits(raw as u32, 32);
        self.write_bits((raw >> 32) as u32, 32);
    }

    /// Writes a float in `min..=max` quantized to steps of `resolution`.
    ///
    /// Out-of-range values are clamped. The matching read is
    /// [`BitReader::read_quantized`] with the same parameters.
    pub fn write_quantized(&mut self, value: f32, min: f32, max: f32, resolution: f32) {
        debug_assert!(max > min && resolution > 0.0);
        let steps = ((max - min) / resolution).ceil();
        let normalized = ((value.clamp(min, max) - min) / (max - min)).clamp(0.0, 1.0);
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "clamped")]
        let quantized = (normalized * steps).round() as u32;
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "clamped")]
        self.write_bits(quantized, bits_required(0, steps as u32));
    }

    /// Writes raw bytes through the bit cursor, without a length prefix.
    ///
    /// When the cursor is byte-aligned this is a plain copy.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.scratch_bits == 0 {
            self.bytes.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.write_bits(u32::from(b), 8);
            }
        }
    }

    /// Pads the scratch word with zero bits up to the next byte boundary and
    /// flushes it.
    pub fn flush(&mut self) {
        if self.scratch_bits > 0 {
            #[expect(clippy::cast_possible_truncation, reason = "under one byte remains")]
            self.bytes.push((self.scratch & 0xff) as u8);
            self.scratch = 0;
            self.scratch_bits = 0;
        }
    }

    /// Flushes and returns the written bytes.
    #[must_use]
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.flush();
        self.bytes
    }
}

/// Pulls values off a byte slice at bit granularity; the inverse of
/// [`BitWriter`].
#[derive(Debug)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    /// Index of the next byte to fetch into the scratch word.
    next: usize,
    scratch: u64,
    scratch_bits: u32,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `bytes`, positioned at the first bit.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            next: 0,
            scratch: 0,
            scratch_bits: 0,
        }
    }

    /// Number of bits left to read.
    #[must_use]
    pub const fn bits_remaining(&self) -> usize {
        (self.bytes.len() - self.next) * 8 + self.scratch_bits as usize
    }

    /// Reads `bits` bits as an unsigned integer. `bits` must be at most 32;
    /// reading 0 bits yields 0.
    ///
    /// # Errors
    ///
    /// Errors if fewer than `bits` bits remain.
    pub fn read_bits(&mut self, bits: u32) -> Result<u32, BitsError> {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return Ok(0);
        }
        while self.scratch_bits < bits {
            let Some(&byte) = self.bytes.get(self.next) else {
                return Err(BitsError::UnexpectedEnd);
            };
            self.next += 1;
            self.scratch |= u64::from(byte) << self.scratch_bits;
            self.scratch_bits += 8;
        }
        #[expect(clippy::cast_possible_truncation, reason = "masked to at most 32 bits")]
        let value = (self.scratch & mask(bits)) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        Ok(value)
    }

    /// Reads an unsigned integer previously written with
    /// [`BitWriter::write_range`].
    ///
    /// # Errors
    ///
    /// Errors if the input ends early.
    pub fn read_range(&mut self, min: u32, max: u32) -> Result<u32, BitsError> {
        let raw = self.read_bits(bits_required(min, max))?;
        // the raw value may still land past `max` if the range is not an
        // exact power of two; that input could never have been produced by
        // the writer
        let value = min.checked_add(raw).ok_or(BitsError::OutOfRange {
            value: raw,
            min,
            max,
        })?;
        if value > max {
            return Err(BitsError::OutOfRange { value, min, max });
        }
        Ok(value)
    }

    /// Reads a zig-zag signed integer previously written with
    /// [`BitWriter::write_signed`].
    ///
    /// # Errors
    ///
    /// Errors if the input ends early.
    pub fn read_signed(&mut self, bits: u32) -> Result<i32, BitsError> {
        let zigzag = self.read_bits(bits)?;
        #[expect(clippy::cast_possible_wrap, reason = "zig-zag mapping is bit-exact")]
        Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32))
    }

    /// Reads an `f32` from its raw IEEE-754 bits.
    ///
    /// # Errors
    ///
    /// Errors if the input ends early.
    pub fn read_f32(&mut self) -> Result<f32, BitsError> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    /// Reads an `f64` from its raw IEEE-754 bits.
    ///
    /// # Errors
    ///
    /// Errors if the input ends early.
    pub fn read_f64(&mut self) -> Result<f64, BitsError> {
        let lo = u64::from(self.read_bits(32)?);
        let hi = u64::from(self.read_bits(32)?);
        Ok(f64::from_bits(lo | (hi << 32)))
    }

    /// Reads a float previously written with [`BitWriter::write_quantized`]
    /// using the same parameters.
    ///
    /// # Errors
    ///
    /// Errors if the input ends early.
    pub fn read_quantized(&mut self, min: f32, max: f32, resolution: f32) -> Result<f32, BitsError> {
        debug_assert!(max > min && resolution > 0.0);
        let steps = ((max - min) / resolution).ceil();
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "clamped")]
        let quantized = self.read_bits(bits_required(0, steps as u32))?;
        #[expect(clippy::cast_precision_loss, reason = "step count is small")]
        let normalized = quantized as f32 / steps;
        Ok(min + normalized * (max - min))
    }

    /// Reads `len` raw bytes into `out`, which must be empty.
    ///
    /// When the cursor is byte-aligned this is a plain copy.
    ///
    /// # Errors
    ///
    /// Errors if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize, out: &mut Vec<u8>) -> Result<(), BitsError> {
        debug_assert!(out.is_empty());
        if self.bits_remaining() < len * 8 {
            return Err(BitsError::UnexpectedEnd);
        }
        if self.scratch_bits == 0 {
            out.extend_from_slice(&self.bytes[self.next..self.next + len]);
            self.next += len;
        } else {
            out.reserve(len);
            for _ in 0..len {
                #[expect(clippy::cast_possible_truncation, reason = "one byte read")]
                out.push(self.read_bits(8)? as u8);
            }
        }
        Ok(())
    }

    /// Discards bits up to the next byte boundary.
    pub const fn align(&mut self) {
        let partial = self.scratch_bits % 8;
        self.scratch >>= partial;
        self.scratch_bits -= partial;
    }
}
