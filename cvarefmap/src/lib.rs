#![allow(clippy::new_without_default)]

//! Reference maps for short-lived machine frames.
//!
//! A [RefMap] records which 8-byte slots of a frame hold object references at a given stop point.
//! Bit `i` describes the slot `i * 8` bytes above the frame's stack pointer. Small maps (which are
//! the overwhelmingly common case) are stored inline; larger maps spill to a heap-allocated byte
//! array.
//!
//! Garbage collectors consume reference maps through the [ReferenceMapPreparer] trait, which
//! translates stack addresses into indices of the collector's own bitmap.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// The number of slots that can be described by an inline reference map.
pub const INLINE_SLOTS: usize = 32;

/// The size in bytes of the slot described by one bit of a [RefMap].
pub const SLOT_SIZE: usize = 8;

/// An immutable set of frame slots holding references.
#[derive(Clone, Eq, PartialEq)]
pub enum RefMap {
    /// A map of at most [INLINE_SLOTS] slots.
    Inline { bits: u32, len: u8 },
    /// A map of more than [INLINE_SLOTS] slots, stored little-endian with bit `i` in byte `i / 8`.
    External { bytes: Box<[u8]>, len: usize },
}

impl RefMap {
    /// An empty reference map describing `len` slots.
    pub fn empty(len: usize) -> Self {
        RefMapBuilder::new(len).build()
    }

    /// How many slots does this map describe?
    pub fn len(&self) -> usize {
        match self {
            RefMap::Inline { len, .. } => usize::from(*len),
            RefMap::External { len, .. } => *len,
        }
    }

    /// Does this map describe zero slots?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is this map stored inline?
    pub fn is_inline(&self) -> bool {
        matches!(self, RefMap::Inline { .. })
    }

    /// Does slot `idx` hold a reference?
    ///
    /// # Panics
    ///
    /// If `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len(), "slot {idx} out of bounds for {} slots", self.len());
        match self {
            RefMap::Inline { bits, .. } => bits & (1 << idx) != 0,
            RefMap::External { bytes, .. } => bytes[idx / 8] & (1 << (idx % 8)) != 0,
        }
    }

    /// How many slots hold references?
    pub fn count_ones(&self) -> usize {
        match self {
            RefMap::Inline { bits, .. } => bits.count_ones() as usize,
            RefMap::External { bytes, .. } => bytes.iter().map(|b| b.count_ones() as usize).sum(),
        }
    }

    /// Iterate over the indices of slots holding references, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|i| self.get(*i))
    }

    /// The number of bytes needed to represent this map as a byte array.
    pub fn byte_len(&self) -> usize {
        self.len().div_ceil(8)
    }

    /// Byte `idx` of this map's little-endian byte representation.
    pub fn byte(&self, idx: usize) -> u8 {
        assert!(idx < self.byte_len());
        match self {
            RefMap::Inline { bits, .. } => {
                let mut buf = [0; 4];
                LittleEndian::write_u32(&mut buf, *bits);
                buf[idx]
            }
            RefMap::External { bytes, .. } => bytes[idx],
        }
    }

    /// Copy the set bits of this map into `preparer`, where this map's bit 0 corresponds to the
    /// preparer's bit `base`.
    pub fn apply(&self, base: usize, preparer: &mut dyn ReferenceMapPreparer) {
        for i in 0..self.byte_len() {
            let b = self.byte(i);
            if b != 0 {
                preparer.set_bits(base + i * 8, b);
            }
        }
    }
}

impl fmt::Debug for RefMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, idx) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, "}}/{}", self.len())
    }
}

/// Incrementally build a [RefMap].
pub struct RefMapBuilder {
    bytes: Vec<u8>,
    len: usize,
}

impl RefMapBuilder {
    /// Create a builder for a map of `len` slots, none of which hold references.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Record that slot `idx` holds a reference.
    ///
    /// # Panics
    ///
    /// If `idx` is out of bounds.
    pub fn set(&mut self, idx: usize) -> &mut Self {
        assert!(idx < self.len, "slot {idx} out of bounds for {} slots", self.len);
        self.bytes[idx / 8] |= 1 << (idx % 8);
        self
    }

    pub fn build(self) -> RefMap {
        if self.len <= INLINE_SLOTS {
            let mut buf = [0; 4];
            buf[..self.bytes.len()].copy_from_slice(&self.bytes);
            RefMap::Inline {
                bits: LittleEndian::read_u32(&buf),
                // Cannot fail as `self.len <= INLINE_SLOTS`.
                len: u8::try_from(self.len).unwrap(),
            }
        } else {
            RefMap::External {
                bytes: self.bytes.into_boxed_slice(),
                len: self.len,
            }
        }
    }
}

/// The interface a garbage collector exposes so that stack walkers can hand it reference maps.
pub trait ReferenceMapPreparer {
    /// The index of the bit describing the stack slot at `addr`.
    fn bit_index(&self, addr: usize) -> usize;

    /// OR the 8 bits of `bits` into this preparer's bitmap, starting at bit `idx`.
    fn set_bits(&mut self, idx: usize, bits: u8);
}

/// A [ReferenceMapPreparer] covering a contiguous range of stack memory, one bit per 8-byte slot.
#[derive(Debug)]
pub struct StackBitmap {
    /// The lowest address described by this bitmap.
    base: usize,
    bits: Vec<u8>,
}

impl StackBitmap {
    /// Create a bitmap covering `len` bytes upwards from `base`.
    ///
    /// # Panics
    ///
    /// If `base` is not aligned to [SLOT_SIZE].
    pub fn new(base: usize, len: usize) -> Self {
        assert_eq!(base % SLOT_SIZE, 0);
        Self {
            base,
            bits: vec![0; len.div_ceil(SLOT_SIZE).div_ceil(8)],
        }
    }

    /// Is the slot at `addr` marked as holding a reference?
    pub fn is_set(&self, addr: usize) -> bool {
        let idx = self.bit_index(addr);
        self.bits
            .get(idx / 8)
            .is_some_and(|b| b & (1 << (idx % 8)) != 0)
    }

    /// Iterate over the addresses of all slots marked as holding references.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits.len() * 8)
            .filter(|i| self.bits[i / 8] & (1 << (i % 8)) != 0)
            .map(|i| self.base + i * SLOT_SIZE)
    }
}

impl ReferenceMapPreparer for StackBitmap {
    fn bit_index(&self, addr: usize) -> usize {
        assert!(addr >= self.base);
        (addr - self.base) / SLOT_SIZE
    }

    /// # Panics
    ///
    /// If any set bit in `bits` describes a slot beyond the end of this bitmap.
    fn set_bits(&mut self, idx: usize, bits: u8) {
        let lo = idx / 8;
        let spread = u16::from(bits) << (idx % 8);
        for (i, b) in spread.to_le_bytes().into_iter().enumerate() {
            if b != 0 {
                let len = self.bits.len();
                let byte = self.bits.get_mut(lo + i).unwrap_or_else(|| {
                    panic!("reference bits {bits:#04x} at bit {idx} overflow a {len} byte bitmap")
                });
                *byte |= b;
            }
        }
    }
}
