//! Value stream writer and reader.
//!
//! Primitives use fixed little-endian encodings. Strings are never inlined:
//! the stream holds an `i32` index into the frame's string table (0 = absent).
//! Objects are written as an `i32` header:
//!
//! - `0`: absent
//! - `> 0`: first sight; the header is the string-table index of the type
//!   signature and the object's fields follow
//! - `< 0`: back-reference `-(index + 1)` to an object already in this stream
//!
//! Collections are an `i32` length (`-1` = absent) followed by their items.
//! Before a reader allocates a collection it claims the length against a
//! budget of one slot per value-stream byte and per string-table entry, so a
//! hostile length cannot force allocation beyond what was actually received.
//! Decoded strings share the table's storage, and first-sight objects may
//! nest at most [`DEFAULT_MAX_DEPTH`] levels unless the reader is configured
//! otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::object::{lock_object, ObjectRef, TypeRegistry, TypeResolver};
use crate::strings::{StringTable, NULL_STRING};
use crate::wire::{decode_wire_frame, encode_wire_frame};

const NULL_LENGTH: i32 = -1;
const NULL_OBJECT: i32 = 0;

/// Nesting limit for first-sight objects in one value stream.
pub const DEFAULT_MAX_DEPTH: usize = 128;

fn empty_resolver() -> Arc<dyn TypeResolver> {
    Arc::new(TypeRegistry::new())
}

/// Builds one frame's value stream.
pub struct ValueWriter {
    buf: BytesMut,
    flags: u8,
    strings: StringTable,
    objects: HashMap<usize, i32>,
    // Keeps written objects alive so their addresses stay unique keys.
    retained: Vec<ObjectRef>,
    resolver: Arc<dyn TypeResolver>,
}

impl ValueWriter {
    /// A writer for streams without objects.
    pub fn new() -> Self {
        Self::with_resolver(empty_resolver())
    }

    /// A writer that resolves object signatures through `resolver`.
    pub fn with_resolver(resolver: Arc<dyn TypeResolver>) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            flags: 0,
            strings: StringTable::new(),
            objects: HashMap::new(),
            retained: Vec::new(),
            resolver,
        }
    }

    /// Set frame flag bits.
    pub fn set_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Bytes written to the value stream so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The string table accumulated so far.
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Written as raw IEEE-754 bits, so NaN payloads survive.
    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_u32_le(value.to_bits());
    }

    /// Written as raw IEEE-754 bits, so NaN payloads survive.
    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_u64_le(value.to_bits());
    }

    /// A unicode scalar as one fixed-width 32-bit code unit.
    pub fn write_char(&mut self, value: char) {
        self.buf.put_u32_le(u32::from(value));
    }

    pub fn write_str(&mut self, value: &str) {
        let idx = self.strings.intern(value);
        self.buf.put_u32_le(idx);
    }

    pub fn write_opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => self.write_str(value),
            None => self.buf.put_u32_le(NULL_STRING),
        }
    }

    /// A length-prefixed byte array; `None` writes the absent marker.
    pub fn write_bytes(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(bytes) => {
                self.write_len(bytes.len())?;
                self.buf.put_slice(bytes);
            }
            None => self.write_i32(NULL_LENGTH),
        }
        Ok(())
    }

    /// A length-prefixed list, each item written by `write_item`.
    pub fn write_list<T>(
        &mut self,
        items: Option<&[T]>,
        mut write_item: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        let Some(items) = items else {
            self.write_i32(NULL_LENGTH);
            return Ok(());
        };
        self.write_len(items.len())?;
        for item in items {
            write_item(self, item)?;
        }
        Ok(())
    }

    /// Write an object by identity.
    ///
    /// The first time a given allocation is written its signature and fields
    /// go into the stream; later writes emit a back-reference.
    pub fn write_object(&mut self, object: Option<&ObjectRef>) -> Result<()> {
        let Some(object) = object else {
            self.write_i32(NULL_OBJECT);
            return Ok(());
        };

        let key = Arc::as_ptr(object) as *const () as usize;
        if let Some(&idx) = self.objects.get(&key) {
            self.write_i32(-idx - 1);
            return Ok(());
        }

        let idx = i32::try_from(self.retained.len()).map_err(|_| {
            FrameError::Malformed("too many objects in one stream".to_string())
        })?;
        self.objects.insert(key, idx);
        self.retained.push(Arc::clone(object));

        let guard = lock_object(object);
        let signature = self.resolver.signature_of(&*guard)?;
        let token = self.strings.intern(&signature);
        let token = i32::try_from(token).map_err(|_| {
            FrameError::Malformed("string table exceeds i32 indices".to_string())
        })?;
        self.write_i32(token);
        guard.write_fields(self)
    }

    /// Finish the stream and encode the complete wire frame.
    pub fn finish(self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        encode_wire_frame(self.flags, &self.buf, &self.strings, &mut out)?;
        Ok(out.freeze())
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
            size: len,
            max: i32::MAX as usize,
        })?;
        self.write_i32(len);
        Ok(())
    }
}

impl Default for ValueWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ValueWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueWriter")
            .field("flags", &self.flags)
            .field("len", &self.buf.len())
            .field("strings", &self.strings.len())
            .field("objects", &self.retained.len())
            .finish()
    }
}

/// Remaining allocation slots for one value stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimBudget {
    remaining: usize,
}

impl ClaimBudget {
    pub fn new(slots: usize) -> Self {
        Self { remaining: slots }
    }

    /// Reserve `n` slots or fail without side effects.
    pub fn claim(&mut self, n: usize) -> Result<()> {
        if n > self.remaining {
            return Err(FrameError::ClaimExceeded {
                requested: n,
                remaining: self.remaining,
            });
        }
        self.remaining -= n;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// A read cursor over one decoded frame.
pub struct ValueReader {
    values: Bytes,
    flags: u8,
    strings: Vec<Arc<str>>,
    objects: Vec<ObjectRef>,
    budget: ClaimBudget,
    depth: usize,
    max_depth: usize,
    resolver: Arc<dyn TypeResolver>,
}

impl ValueReader {
    /// Decode a frame whose stream holds no objects.
    pub fn decode(frame: Bytes) -> Result<Self> {
        Self::decode_with_resolver(frame, empty_resolver())
    }

    /// Decode a frame, instantiating objects through `resolver`.
    pub fn decode_with_resolver(frame: Bytes, resolver: Arc<dyn TypeResolver>) -> Result<Self> {
        let frame = decode_wire_frame(frame)?;
        let budget = ClaimBudget::new(frame.values.len() + frame.strings.len());
        Ok(Self {
            values: frame.values,
            flags: frame.flags,
            strings: frame.strings,
            objects: Vec::new(),
            budget,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            resolver,
        })
    }

    /// Limit how deeply first-sight objects may nest.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Unread bytes in the value stream.
    pub fn remaining(&self) -> usize {
        self.values.remaining()
    }

    /// The frame's string table, index 1 first.
    pub fn strings(&self) -> &[Arc<str>] {
        &self.strings
    }

    /// Allocation slots still available for collections.
    pub fn budget(&self) -> ClaimBudget {
        self.budget
    }

    /// Claim `n` slots before allocating a collection of that length.
    pub fn claim(&mut self, n: usize) -> Result<()> {
        self.budget.claim(n)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.need(1)?;
        match self.values.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameError::Malformed(format!("bool byte {other}"))),
        }
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.need(1)?;
        Ok(self.values.get_i8())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.values.get_i16_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.values.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.values.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(f32::from_bits(self.values.get_u32_le()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(f64::from_bits(self.values.get_u64_le()))
    }

    pub fn read_char(&mut self) -> Result<char> {
        self.need(4)?;
        let raw = self.values.get_u32_le();
        char::from_u32(raw).ok_or(FrameError::InvalidChar(raw))
    }

    /// Read a string that must be present.
    ///
    /// The result shares the string table entry; repeated references do not
    /// copy it.
    pub fn read_string(&mut self) -> Result<Arc<str>> {
        self.read_opt_string()?
            .ok_or_else(|| FrameError::Malformed("required string is absent".to_string()))
    }

    pub fn read_opt_string(&mut self) -> Result<Option<Arc<str>>> {
        self.need(4)?;
        let idx = self.values.get_u32_le();
        if idx == NULL_STRING {
            return Ok(None);
        }
        self.string_at(i64::from(idx)).map(|s| Some(Arc::clone(s)))
    }

    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_len()? else {
            return Ok(None);
        };
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.values.copy_to_slice(&mut out);
        Ok(Some(out))
    }

    /// Read a length-prefixed list, claiming its length first.
    pub fn read_list<T>(
        &mut self,
        mut read_item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Option<Vec<T>>> {
        let Some(len) = self.read_len()? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(read_item(self)?);
        }
        Ok(Some(out))
    }

    /// Read an object, resolving back-references to the shared instance.
    ///
    /// A new object is registered before its fields are read, so a field
    /// that refers back to the object under construction resolves to it.
    /// `read_fields` implementations must not lock objects they receive
    /// from the reader while they are being read.
    pub fn read_object(&mut self) -> Result<Option<ObjectRef>> {
        let token = self.read_i32()?;
        if token == NULL_OBJECT {
            return Ok(None);
        }

        if token < 0 {
            let idx = -i64::from(token) - 1;
            return usize::try_from(idx)
                .ok()
                .and_then(|i| self.objects.get(i))
                .cloned()
                .map(Some)
                .ok_or(FrameError::InvalidBackReference {
                    index: idx,
                    len: self.objects.len(),
                });
        }

        if self.depth >= self.max_depth {
            return Err(FrameError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        let signature = Arc::clone(self.string_at(i64::from(token))?);
        let object = self.resolver.instantiate(&signature)?;
        self.objects.push(Arc::clone(&object));
        self.depth += 1;
        let fields = {
            let mut guard = lock_object(&object);
            guard.read_fields(self)
        };
        self.depth -= 1;
        fields?;
        Ok(Some(object))
    }

    /// Read a collection length and claim it. `-1` means absent.
    pub fn read_len(&mut self) -> Result<Option<usize>> {
        let raw = self.read_i32()?;
        if raw == NULL_LENGTH {
            return Ok(None);
        }
        let len = usize::try_from(raw)
            .map_err(|_| FrameError::Malformed(format!("negative collection length {raw}")))?;
        self.claim(len)?;
        Ok(Some(len))
    }

    /// Fail if any value-stream bytes are left unread.
    pub fn expect_end(&self) -> Result<()> {
        if self.values.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{} unread bytes after last value",
                self.values.remaining()
            )));
        }
        Ok(())
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.values.remaining() < n {
            return Err(FrameError::Truncated {
                needed: n,
                remaining: self.values.remaining(),
            });
        }
        Ok(())
    }

    fn string_at(&self, index: i64) -> Result<&Arc<str>> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i >= 1)
            .and_then(|i| self.strings.get(i - 1))
            .ok_or(FrameError::InvalidStringIndex {
                index,
                len: self.strings.len(),
            })
    }
}

impl fmt::Debug for ValueReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueReader")
            .field("flags", &self.flags)
            .field("remaining", &self.values.remaining())
            .field("strings", &self.strings.len())
            .field("objects", &self.objects.len())
            .field("depth", &self.depth)
            .field("budget", &self.budget.remaining())
            .finish()
    }
}
