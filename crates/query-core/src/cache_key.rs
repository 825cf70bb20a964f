//! Byte-level cache key construction
//!
//! Every appended field is tagged with its kind and prefixed with its length,
//! so two different field sequences can never produce the same bytes.

const STRING_KEY: u8 = 0;
const STRING_LIST_KEY: u8 = 1;
const BOOL_KEY: u8 = 2;
const INT_KEY: u8 = 3;
const BYTES_KEY: u8 = 4;
const CACHEABLE_KEY: u8 = 5;
const CACHEABLE_LIST_KEY: u8 = 6;

/// Something that contributes bytes to a cache key
pub trait Cacheable {
    fn cache_key(&self) -> Vec<u8>;
}

/// Builder for cache key bytes
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    buf: Vec<u8>,
}

impl CacheKeyBuilder {
    /// Create a new builder whose output starts with `type_id`
    pub fn new(type_id: u8) -> Self {
        Self { buf: vec![type_id] }
    }

    pub fn append_bool(mut self, value: bool) -> Self {
        self.buf.push(BOOL_KEY);
        self.buf.push(value as u8);
        self
    }

    pub fn append_i64(mut self, value: i64) -> Self {
        self.buf.push(INT_KEY);
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn append_string(mut self, value: &str) -> Self {
        self.buf.push(STRING_KEY);
        self.put_len_prefixed(value.as_bytes());
        self
    }

    pub fn append_strings<S: AsRef<str>>(mut self, values: &[S]) -> Self {
        self.buf.push(STRING_LIST_KEY);
        self.put_len(values.len());
        for value in values {
            self.put_len_prefixed(value.as_ref().as_bytes());
        }
        self
    }

    pub fn append_bytes(mut self, value: &[u8]) -> Self {
        self.buf.push(BYTES_KEY);
        self.put_len_prefixed(value);
        self
    }

    pub fn append_cacheable<C: Cacheable + ?Sized>(mut self, value: &C) -> Self {
        self.buf.push(CACHEABLE_KEY);
        self.put_len_prefixed(&value.cache_key());
        self
    }

    pub fn append_cacheables<C: Cacheable>(mut self, values: &[C]) -> Self {
        self.buf.push(CACHEABLE_LIST_KEY);
        self.put_len(values.len());
        for value in values {
            self.put_len_prefixed(&value.cache_key());
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }

    fn put_len(&mut self, len: usize) {
        self.buf.extend_from_slice(&(len as u32).to_be_bytes());
    }

    fn put_len_prefixed(&mut self, bytes: &[u8]) {
        self.put_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }
}
