//! In-memory block file with fault injection.
//!
//! `MemoryFile` keeps its bytes in memory behind a shared handle, so a test
//! can close a store and "reopen" the very same bytes. Faults are injected
//! from a seeded RNG, so a given seed always produces the same sequence:
//! - read/write/sync errors
//! - partial writes (the call succeeds but only a prefix lands)

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::file::{BlockFile, FileError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability that a write silently persists only a prefix (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// No faults.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every write fails.
    #[must_use]
    pub fn failing_writes() -> Self {
        Self {
            write_error_rate: 1.0,
            ..Self::default()
        }
    }

    /// Every read fails.
    #[must_use]
    pub fn failing_reads() -> Self {
        Self {
            read_error_rate: 1.0,
            ..Self::default()
        }
    }
}

/// Statistics about memory file operations, shared by all handles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryFileStats {
    /// Number of reads.
    pub reads: u64,
    /// Number of writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

struct Shared {
    data: Vec<u8>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryFileStats,
}

impl Shared {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// An in-memory `BlockFile`.
///
/// # Thread Safety
///
/// Handles share their contents through a mutex; each handle tracks its own
/// closed state.
pub struct MemoryFile {
    shared: Arc<Mutex<Shared>>,
    closed: bool,
}

impl MemoryFile {
    /// Create an empty file with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create an empty file with the given fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                data: Vec::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryFileStats::default(),
            })),
            closed: false,
        }
    }

    /// Open a new handle over the same contents.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn reopen(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            closed: false,
        }
    }

    /// Replace the fault configuration for every handle.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.shared.lock().expect("lock poisoned").fault_config = config;
    }

    /// Snapshot of the operation counters.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn stats(&self) -> MemoryFileStats {
        self.shared.lock().expect("lock poisoned").stats.clone()
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn shared(&self) -> Result<std::sync::MutexGuard<'_, Shared>, FileError> {
        if self.closed {
            return Err(FileError::Closed);
        }
        Ok(self.shared.lock().expect("lock poisoned"))
    }
}

// Offsets are bounded by the in-memory buffer, which is addressable by usize.
#[allow(clippy::cast_possible_truncation)]
impl BlockFile for MemoryFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        let mut shared = self.shared()?;
        shared.stats.reads += 1;

        let rate = shared.fault_config.read_error_rate;
        if shared.should_inject_fault(rate) {
            shared.stats.injected_read_errors += 1;
            tracing::warn!(offset, "injecting read fault");
            return Err(FileError::InjectedFault("simulated read error".to_string()));
        }

        let start = offset as usize;
        if start >= shared.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(shared.data.len() - start);
        buf[..n].copy_from_slice(&shared.data[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), FileError> {
        let mut shared = self.shared()?;
        shared.stats.writes += 1;

        let rate = shared.fault_config.write_error_rate;
        if shared.should_inject_fault(rate) {
            shared.stats.injected_write_errors += 1;
            tracing::warn!(offset, "injecting write fault");
            return Err(FileError::InjectedFault("simulated write error".to_string()));
        }

        let mut len = buf.len();
        let rate = shared.fault_config.partial_write_rate;
        if len > 0 && shared.should_inject_fault(rate) {
            shared.stats.partial_writes += 1;
            len = shared.rng.random_range(0..len);
            tracing::warn!(offset, len, "injecting partial write");
        }

        let start = offset as usize;
        if shared.data.len() < start + buf.len() {
            shared.data.resize(start + buf.len(), 0);
        }
        shared.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FileError> {
        let mut shared = self.shared()?;
        shared.stats.syncs += 1;

        let rate = shared.fault_config.sync_error_rate;
        if shared.should_inject_fault(rate) {
            shared.stats.injected_sync_errors += 1;
            tracing::warn!("injecting sync fault");
            return Err(FileError::InjectedFault("simulated sync error".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), FileError> {
        if self.closed {
            return Err(FileError::Closed);
        }
        self.closed = true;
        Ok(())
    }

    fn len(&self) -> Result<u64, FileError> {
        Ok(self.shared()?.data.len() as u64)
    }
}
