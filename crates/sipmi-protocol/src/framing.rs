//! Reassembly of back-to-back JSON documents from a byte stream.
//!
//! Events arrive as concatenated JSON values with no length prefix or
//! delimiter. A single read may carry several documents, or only part of
//! one:
//!
//! ```text
//! read 1: {"event":"E_A","params":{}}{"event":"E_
//! read 2: B","params":{}}
//! ```
//!
//! [`FrameBuffer`] keeps the unconsumed tail between pushes and hands out
//! complete documents in arrival order.

use std::collections::VecDeque;

use serde_json::{Deserializer, Value};

use crate::DEFAULT_MAX_RETRIES;
use crate::error::FramingError;

/// Incremental JSON stream parser.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    ready: VecDeque<Value>,
    retries: u32,
    max_retries: u32,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Creates a buffer with the default retry ceiling.
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    /// Creates a buffer that fails after `max_retries` consecutive pushes
    /// that complete no message.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            pending: Vec::new(),
            ready: VecDeque::new(),
            retries: 0,
            max_retries,
        }
    }

    /// Appends `data` and extracts every complete document at the front.
    ///
    /// Returns the number of documents extracted by this push.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::MaxAttempts`] once more than `max_retries`
    /// consecutive pushes have completed nothing. The stream is then
    /// considered desynchronized and the buffer should be discarded.
    pub fn push(&mut self, data: &[u8]) -> Result<usize, FramingError> {
        self.pending.extend_from_slice(data);

        let extracted = self.parse();
        if extracted > 0 {
            self.retries = 0;
        } else {
            self.retries += 1;
        }

        if self.retries > self.max_retries {
            return Err(FramingError::MaxAttempts {
                attempts: self.retries,
            });
        }
        Ok(extracted)
    }

    /// Removes and returns the oldest complete document, if any.
    pub fn pop(&mut self) -> Option<Value> {
        self.ready.pop_front()
    }

    /// Number of documents waiting to be popped.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of buffered bytes that do not yet form a document.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current count of consecutive non-completing pushes.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn parse(&mut self) -> usize {
        let mut stream = Deserializer::from_slice(&self.pending).into_iter::<Value>();
        let mut consumed = 0;
        let mut extracted = 0;

        // Stop at the first error: either an incomplete tail waiting for more
        // bytes, or garbage that will keep failing until the ceiling trips.
        while let Some(Ok(value)) = stream.next() {
            consumed = stream.byte_offset();
            self.ready.push_back(value);
            extracted += 1;
        }

        if consumed > 0 {
            self.pending.drain(..consumed);
        }
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            self.pending.clear();
        }
        extracted
    }
}
