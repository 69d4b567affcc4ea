//! Kernel module table.
//!
//! Two tables (plain and strided-batched) map every [`ModuleSignature`] to
//! an ordered list of tile variants, smallest tile first. The table is
//! generated once from the stage layouts below and shared read-only by every
//! handle.

use crate::launch::LaunchConfig;
use crate::signature::{ModuleSignature, SIGNATURE_COUNT};
use mpsgemm_common::{ElementKind, MpsgemmError, PrecisionFamily, Result};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

// ---------------------------------------------------------------------------
// Variant model
// ---------------------------------------------------------------------------

/// Which of the two tables a variant lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Gemm,
    StridedBatched,
}

impl TableKind {
    const fn index(self) -> usize {
        match self {
            TableKind::Gemm => 0,
            TableKind::StridedBatched => 1,
        }
    }
}

/// Output tile computed by one block, plus the `k` step of the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl TileShape {
    pub const fn new(m: u32, n: u32, k: u32) -> Self {
        Self { m, n, k }
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// Tensor-core fragment shape of the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl FragmentShape {
    pub const fn for_family(family: PrecisionFamily) -> Self {
        match family {
            PrecisionFamily::Fp16 => Self { m: 16, n: 16, k: 16 },
            PrecisionFamily::Tf32 => Self { m: 16, n: 16, k: 8 },
        }
    }
}

/// Kernel entry point; fixes the element kind and batching of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEntry {
    RealGemm,
    RealGemmStridedBatched,
    ComplexGemm,
    ComplexGemmStridedBatched,
}

impl KernelEntry {
    pub const fn new(kind: ElementKind, batched: bool) -> Self {
        match (kind, batched) {
            (ElementKind::Real, false) => KernelEntry::RealGemm,
            (ElementKind::Real, true) => KernelEntry::RealGemmStridedBatched,
            (ElementKind::Complex, false) => KernelEntry::ComplexGemm,
            (ElementKind::Complex, true) => KernelEntry::ComplexGemmStridedBatched,
        }
    }

    pub const fn kind(self) -> ElementKind {
        match self {
            KernelEntry::RealGemm | KernelEntry::RealGemmStridedBatched => ElementKind::Real,
            KernelEntry::ComplexGemm | KernelEntry::ComplexGemmStridedBatched => ElementKind::Complex,
        }
    }

    pub const fn is_batched(self) -> bool {
        matches!(self, KernelEntry::RealGemmStridedBatched | KernelEntry::ComplexGemmStridedBatched)
    }

    pub const fn name(self) -> &'static str {
        match self {
            KernelEntry::RealGemm => "sgemm_kernel",
            KernelEntry::RealGemmStridedBatched => "sgemm_strided_batch_kernel",
            KernelEntry::ComplexGemm => "cgemm_kernel",
            KernelEntry::ComplexGemmStridedBatched => "cgemm_strided_batch_kernel",
        }
    }
}

/// One compiled kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleVariant {
    pub signature: ModuleSignature,
    pub stage: usize,
    pub tile: TileShape,
    pub fragment: FragmentShape,
    pub block_size: u32,
    pub shared_mem_bytes: u32,
    pub entry: KernelEntry,
}

impl ModuleVariant {
    /// Variant for `signature` at `stage` with the given tile.
    pub fn new(signature: ModuleSignature, stage: usize, tile: TileShape, batched: bool) -> Self {
        let family = signature.family();
        let operand_elems = tile.m * tile.k + tile.k * tile.n;
        let ec_factor = if signature.error_correction() { 2 } else { 1 };
        let complex_factor = match signature.kind() {
            ElementKind::Real => 1,
            ElementKind::Complex => 2,
        };
        Self {
            signature,
            stage,
            tile,
            fragment: FragmentShape::for_family(family),
            block_size: 128,
            shared_mem_bytes: operand_elems * family.storage_bytes() as u32 * ec_factor * complex_factor,
            entry: KernelEntry::new(signature.kind(), batched),
        }
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Blocks needed to cover one `m x n` output.
    pub fn blocks_for(&self, m: u64, n: u64) -> u64 {
        m.div_ceil(u64::from(self.tile.m)) * n.div_ceil(u64::from(self.tile.n))
    }

    /// Launch geometry for `batch` outputs of `m x n`, all in grid.x.
    pub fn launch_config(&self, m: u64, n: u64, batch: u64) -> Result<LaunchConfig> {
        let blocks = self
            .blocks_for(m, n)
            .checked_mul(batch)
            .and_then(|b| u32::try_from(b).ok())
            .ok_or_else(|| {
                MpsgemmError::LaunchFailed(format!(
                    "{m}x{n} (batch {batch}) exceeds the grid limit for tile {}",
                    self.tile
                ))
            })?;
        Ok(LaunchConfig {
            grid: (blocks, 1, 1),
            block: (self.block_size, 1, 1),
            shared_mem_bytes: self.shared_mem_bytes,
        })
    }

    pub fn name(&self) -> String {
        format!("{}_{}_s{}_{}", self.entry.name(), self.signature, self.stage, self.tile)
    }
}

// ---------------------------------------------------------------------------
// Stage specs
// ---------------------------------------------------------------------------

struct StageLayout {
    tile: TileShape,
    block_size: u32,
}

const REAL_STAGES: [StageLayout; 3] = [
    StageLayout { tile: TileShape::new(32, 32, 32), block_size: 64 },
    StageLayout { tile: TileShape::new(64, 64, 32), block_size: 128 },
    StageLayout { tile: TileShape::new(128, 128, 32), block_size: 256 },
];

const COMPLEX_STAGES: [StageLayout; 2] = [
    StageLayout { tile: TileShape::new(32, 32, 32), block_size: 128 },
    StageLayout { tile: TileShape::new(64, 64, 32), block_size: 256 },
];

fn stages_for(kind: ElementKind) -> &'static [StageLayout] {
    match kind {
        ElementKind::Real => &REAL_STAGES,
        ElementKind::Complex => &COMPLEX_STAGES,
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Collects registrations before the table is frozen.
#[derive(Debug, Clone)]
pub struct ModuleTableBuilder {
    slots: [Vec<Vec<Option<ModuleVariant>>>; 2],
}

impl Default for ModuleTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleTableBuilder {
    pub fn new() -> Self {
        Self { slots: [vec![Vec::new(); SIGNATURE_COUNT], vec![Vec::new(); SIGNATURE_COUNT]] }
    }

    /// Place `variant` at its (signature, stage) slot. A second registration
    /// for the same slot replaces the first.
    pub fn register(&mut self, table: TableKind, variant: ModuleVariant) {
        let stages = &mut self.slots[table.index()][variant.signature.slot()];
        if stages.len() <= variant.stage {
            stages.resize(variant.stage + 1, None);
        }
        stages[variant.stage] = Some(variant);
    }

    /// Freeze the registrations.
    pub fn build(self) -> ModuleTable {
        let [gemm, batched] = self.slots.map(|table| {
            table
                .into_iter()
                .map(|stages| {
                    debug_assert!(stages.iter().all(Option::is_some), "stage gap in module table");
                    stages.into_iter().flatten().collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        });
        ModuleTable { tables: [gemm, batched] }
    }
}

/// Immutable signature → stage-ordered variants mapping.
#[derive(Debug, Clone)]
pub struct ModuleTable {
    tables: [Vec<Vec<ModuleVariant>>; 2],
}

impl ModuleTable {
    /// Generate every variant from the stage layouts.
    pub fn generate() -> Self {
        let mut builder = ModuleTableBuilder::new();
        for table in [TableKind::Gemm, TableKind::StridedBatched] {
            for signature in ModuleSignature::all() {
                for (stage, layout) in stages_for(signature.kind()).iter().enumerate() {
                    let variant = ModuleVariant::new(
                        signature,
                        stage,
                        layout.tile,
                        table == TableKind::StridedBatched,
                    )
                    .with_block_size(layout.block_size);
                    builder.register(table, variant);
                }
            }
        }
        let table = builder.build();
        debug!(variants = table.variant_count(), "generated module table");
        table
    }

    /// Process-wide table, generated on first use.
    pub fn shared() -> Arc<ModuleTable> {
        static TABLE: OnceLock<Arc<ModuleTable>> = OnceLock::new();
        Arc::clone(TABLE.get_or_init(|| Arc::new(ModuleTable::generate())))
    }

    /// Variants for `signature`, smallest tile first.
    pub fn lookup(&self, table: TableKind, signature: ModuleSignature) -> &[ModuleVariant] {
        let variants = &self.tables[table.index()][signature.slot()];
        debug_assert!(variants.len() >= 2, "signature {signature} has fewer than two stages");
        variants
    }

    pub fn variant_count(&self) -> usize {
        self.tables.iter().flatten().map(Vec::len).sum()
    }
}
