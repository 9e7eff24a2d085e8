//! Table construction and the byte-wise coder

use md5::{Digest, Md5};
use std::sync::{Mutex, OnceLock};
use std::thread;
use tracing::debug;

/// Size of the substitution tables (one entry per byte value).
pub const TABLE_SIZE: usize = 256;

/// Number of stable sort rounds applied while deriving the table.
const ROUNDS: u64 = 1022;

struct Tables {
    enc: [u8; TABLE_SIZE],
    dec: [u8; TABLE_SIZE],
}

/// A substitution coder backed by a pair of inverse 256-byte tables.
///
/// Construction starts a background worker that derives the tables from the
/// key; the first `encrypt`/`decrypt` call waits for the worker, after which
/// both tables are immutable and lookups are lock-free.
pub struct TableCoder {
    key: String,
    tables: OnceLock<Tables>,
    worker: Mutex<Option<thread::JoinHandle<Tables>>>,
}

impl TableCoder {
    pub(crate) fn new(key: &str) -> Self {
        let owned = key.to_owned();
        let worker = thread::spawn(move || build_tables(&owned));
        Self {
            key: key.to_owned(),
            tables: OnceLock::new(),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Substitute every byte through the encryption table, in place.
    pub fn encrypt(&self, data: &mut [u8]) {
        let tables = self.tables();
        for byte in data {
            *byte = tables.enc[*byte as usize];
        }
    }

    /// Substitute every byte through the decryption table, in place.
    pub fn decrypt(&self, data: &mut [u8]) {
        let tables = self.tables();
        for byte in data {
            *byte = tables.dec[*byte as usize];
        }
    }

    fn tables(&self) -> &Tables {
        if let Some(tables) = self.tables.get() {
            return tables;
        }

        // First use: collect the worker's result. Holding the lock makes
        // concurrent first callers wait for the join instead of rebuilding.
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            let built = handle.join().unwrap_or_else(|_| build_tables(&self.key));
            let _ = self.tables.set(built);
        }
        drop(worker);

        self.tables.get_or_init(|| build_tables(&self.key))
    }
}

fn build_tables(key: &str) -> Tables {
    debug!("building substitution table");

    let digest = Md5::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let keynum = u64::from_le_bytes(prefix);

    let mut enc: [u8; TABLE_SIZE] = std::array::from_fn(|i| i as u8);
    // Rust's slice sort is a stable merge sort, which is what keeps equal
    // sort keys in their prior order between rounds.
    for round in 1..=ROUNDS {
        enc.sort_by_key(|&value| keynum % (value as u64 + round));
    }

    let mut dec = [0u8; TABLE_SIZE];
    for (i, &value) in enc.iter().enumerate() {
        dec[value as usize] = i as u8;
    }

    debug!("substitution table ready");
    Tables { enc, dec }
}
