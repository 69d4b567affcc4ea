//! Kernel launch geometry.

use crate::device::DeviceTopology;
use mpsgemm_common::{MpsgemmError, Result};

/// Grid/block dimensions for a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self { grid: (1, 1, 1), block: (256, 1, 1), shared_mem_bytes: 0 }
    }
}

impl LaunchConfig {
    /// 1-D launch covering `n` threads.
    pub fn linear(n: u32, block_size: u32) -> Self {
        let grid_x = n.div_ceil(block_size).max(1);
        Self { grid: (grid_x, 1, 1), block: (block_size, 1, 1), ..Default::default() }
    }

    /// 2-D launch tiling a `rows x cols` matrix.
    pub fn grid_2d(rows: u32, cols: u32, block_x: u32, block_y: u32) -> Self {
        Self {
            grid: (cols.div_ceil(block_x).max(1), rows.div_ceil(block_y).max(1), 1),
            block: (block_x, block_y, 1),
            ..Default::default()
        }
    }

    pub fn total_blocks(&self) -> u64 {
        u64::from(self.grid.0) * u64::from(self.grid.1) * u64::from(self.grid.2)
    }

    pub fn threads_per_block(&self) -> u64 {
        u64::from(self.block.0) * u64::from(self.block.1) * u64::from(self.block.2)
    }

    /// Reject geometry the device cannot launch.
    pub fn validate(&self, device: &DeviceTopology) -> Result<()> {
        if self.total_blocks() == 0 {
            return Err(MpsgemmError::LaunchFailed(format!("empty grid {:?}", self.grid)));
        }
        let threads = self.threads_per_block();
        if threads == 0 || threads > u64::from(device.max_threads_per_block) {
            return Err(MpsgemmError::LaunchFailed(format!(
                "block {:?} has {threads} threads, device allows {}",
                self.block, device.max_threads_per_block
            )));
        }
        if self.shared_mem_bytes > device.shared_memory_per_block {
            return Err(MpsgemmError::LaunchFailed(format!(
                "{} bytes of shared memory requested, device allows {}",
                self.shared_mem_bytes, device.shared_memory_per_block
            )));
        }
        Ok(())
    }
}
