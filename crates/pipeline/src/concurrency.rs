//! Concurrency planning module for hlsforge
//!
//! Derives how many renditions are encoded in parallel, and how many threads
//! each encoder gets, from CPU core count and configuration.

use crate::config::Config;
use serde::Serialize;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Threads handed to each encoder process
    pub threads_per_encode: u32,
    /// Maximum number of renditions encoded at once within a job
    pub encode_pool_size: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Derives threads_per_encode: 2 below 8 cores, 4 below 32, 8 otherwise (unless explicit)
    /// - Derives encode_pool_size as target_threads / threads_per_encode (unless explicit)
    /// - Keeps encode_pool_size within 1..=total_cores
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let threads_per_encode = if cfg.encode.threads_per_encode > 0 {
            cfg.encode.threads_per_encode
        } else {
            derive_threads_per_encode(total_cores)
        };

        let encode_pool_size = if cfg.encode.max_parallel_encodes > 0 {
            cfg.encode.max_parallel_encodes
        } else {
            target_threads / threads_per_encode
        }
        .clamp(1, total_cores);

        Self {
            total_cores,
            target_threads,
            threads_per_encode,
            encode_pool_size,
        }
    }
}

/// Derive encoder thread count based on core count
fn derive_threads_per_encode(cores: u32) -> u32 {
    if cores >= 32 {
        8
    } else if cores >= 8 {
        4
    } else {
        2
    }
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
