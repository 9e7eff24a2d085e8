//! Process-wide codec cache

use crate::table::TableCoder;
use crate::CoderError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SHADOW_METHOD: &str = "shadow";

/// Cache of coders keyed by `(method, key)`.
///
/// One pool is created at startup and shared by every tunnel; equal
/// `(method, key)` pairs always resolve to the same coder, so each table is
/// built at most once per process.
#[derive(Default)]
pub struct CoderPool {
    inner: Mutex<HashMap<(String, String), Arc<TableCoder>>>,
}

impl CoderPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the coder for `(method, key)`, building it on first request.
    pub fn get(&self, method: &str, key: &str) -> Result<Arc<TableCoder>, CoderError> {
        if !method.is_empty() && method != SHADOW_METHOD {
            return Err(CoderError::UnsupportedMethod(method.to_owned()));
        }
        if key.is_empty() {
            return Err(CoderError::EmptyKey);
        }

        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let coder = pool
            .entry((method.to_owned(), key.to_owned()))
            .or_insert_with(|| Arc::new(TableCoder::new(key)));
        Ok(Arc::clone(coder))
    }
}
