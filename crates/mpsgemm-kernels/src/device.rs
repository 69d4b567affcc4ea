//! Device topology used by variant selection and launch validation.

use tracing::info;

/// Properties of the execution device that the dispatcher depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopology {
    pub name: String,
    pub multiprocessor_count: u32,
    pub warp_size: u32,
    pub max_threads_per_block: u32,
    pub shared_memory_per_block: u32,
}

impl DeviceTopology {
    /// NVIDIA A100 (SXM4).
    pub fn a100() -> Self {
        Self {
            name: "NVIDIA A100".into(),
            multiprocessor_count: 108,
            warp_size: 32,
            max_threads_per_block: 1024,
            shared_memory_per_block: 166_912,
        }
    }

    /// NVIDIA RTX A6000.
    pub fn rtx_a6000() -> Self {
        Self {
            name: "NVIDIA RTX A6000".into(),
            multiprocessor_count: 84,
            warp_size: 32,
            max_threads_per_block: 1024,
            shared_memory_per_block: 101_376,
        }
    }

    /// Host emulation: one multiprocessor per worker thread of the rayon pool.
    pub fn emulated() -> Self {
        let workers = rayon::current_num_threads().max(1);
        let topology = Self {
            name: "emulated tensor-core device".into(),
            multiprocessor_count: u32::try_from(workers).unwrap_or(u32::MAX),
            warp_size: 32,
            max_threads_per_block: 1024,
            shared_memory_per_block: 101_376,
        };
        info!(
            name = %topology.name,
            multiprocessors = topology.multiprocessor_count,
            "using emulated device"
        );
        topology
    }

    /// Same device with a different multiprocessor count.
    pub fn with_multiprocessor_count(mut self, count: u32) -> Self {
        self.multiprocessor_count = count;
        self
    }

    /// Number of resident blocks the occupancy heuristic aims for.
    pub fn target_blocks(&self, blocks_per_sm: u32) -> u64 {
        u64::from(self.multiprocessor_count) * u64::from(blocks_per_sm)
    }
}
