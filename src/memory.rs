//! Available-memory guard.
//!
//! The worker pool consults a `MemoryGuard` after every completed item. Once available
//! system memory drops to the critical percentage the guard reports
//! `Error::ResourceExhausted`, and the run stops dispatching new work.
//!
//! The probe is a trait so tests (and embedders with their own accounting) can supply a
//! fixed reading instead of the real system.

use std::sync::{Arc, Mutex};

use sysinfo::System;

use crate::{Error, Result};

/// Reports available system memory as a percentage of total memory.
pub trait MemoryProbe: Send + Sync {
    fn available_percent(&self) -> f32;
}

/// `MemoryProbe` backed by `sysinfo`.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_percent(&self) -> f32 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            // Platform without memory reporting; never trip.
            return 100.0;
        }
        (system.available_memory() as f64 * 100.0 / total as f64) as f32
    }
}

/// A probe that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub f32);

impl MemoryProbe for FixedMemory {
    fn available_percent(&self) -> f32 {
        self.0
    }
}

/// Fails once available memory is at or below `critical_percent`.
#[derive(Clone)]
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    critical_percent: f32,
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("critical_percent", &self.critical_percent)
            .finish_non_exhaustive()
    }
}

impl MemoryGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>, critical_percent: f32) -> Self {
        Self {
            probe,
            critical_percent,
        }
    }

    /// Guard backed by the real system memory.
    pub fn system(critical_percent: f32) -> Self {
        Self::new(Arc::new(SystemMemory::new()), critical_percent)
    }

    pub fn critical_percent(&self) -> f32 {
        self.critical_percent
    }

    /// Sample the probe; returns the available percentage when above the threshold.
    pub fn check(&self) -> Result<f32> {
        let available = self.probe.available_percent();
        if available <= self.critical_percent {
            tracing::warn!(
                available_percent = available,
                critical_percent = self.critical_percent,
                "available memory at or below critical threshold"
            );
            return Err(Error::ResourceExhausted {
                available_percent: available,
                threshold_percent: self.critical_percent,
            });
        }
        Ok(available)
    }
}
