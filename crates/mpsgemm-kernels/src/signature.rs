//! Module signatures: the key into the kernel module table.
//!
//! A signature packs the operand modes, precision family, error-correction
//! switch and element kind into one integer:
//!
//! | bits  | field          |
//! |-------|----------------|
//! | 0..2  | op(A)          |
//! | 2..4  | op(B)          |
//! | 4     | family (TF32)  |
//! | 5     | error-corrected|
//! | 6     | complex        |
//!
//! Bit 1 of each operation field is only set for `C`, so the pattern `11`
//! never occurs and distinct inputs always map to distinct signatures.

use mpsgemm_common::{ElementKind, Operation, PrecisionFamily, TensorCoreMode};
use std::fmt;

const OP_A_SHIFT: u32 = 0;
const OP_B_SHIFT: u32 = 2;
const FAMILY_SHIFT: u32 = 4;
const EC_SHIFT: u32 = 5;
const KIND_SHIFT: u32 = 6;

/// Number of distinct signatures per table.
pub const SIGNATURE_COUNT: usize = 3 * 3 * 2 * 2 * 2;

/// Opaque table key for one kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleSignature(u32);

/// Derive the signature of a tensor-core GEMM.
pub fn derive_signature(
    mode: TensorCoreMode,
    op_a: Operation,
    op_b: Operation,
    kind: ElementKind,
) -> ModuleSignature {
    let family = match mode.family() {
        PrecisionFamily::Fp16 => 0,
        PrecisionFamily::Tf32 => 1,
    };
    ModuleSignature(
        (op_a.index() as u32) << OP_A_SHIFT
            | (op_b.index() as u32) << OP_B_SHIFT
            | family << FAMILY_SHIFT
            | u32::from(mode.error_correction()) << EC_SHIFT
            | (kind.index() as u32) << KIND_SHIFT,
    )
}

fn op_from_bits(bits: u32) -> Operation {
    match bits & 0b11 {
        0 => Operation::N,
        1 => Operation::T,
        _ => Operation::C,
    }
}

impl ModuleSignature {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn op_a(self) -> Operation {
        op_from_bits(self.0 >> OP_A_SHIFT)
    }

    pub fn op_b(self) -> Operation {
        op_from_bits(self.0 >> OP_B_SHIFT)
    }

    pub fn family(self) -> PrecisionFamily {
        if (self.0 >> FAMILY_SHIFT) & 1 == 1 {
            PrecisionFamily::Tf32
        } else {
            PrecisionFamily::Fp16
        }
    }

    pub fn error_correction(self) -> bool {
        (self.0 >> EC_SHIFT) & 1 == 1
    }

    pub fn mode(self) -> TensorCoreMode {
        TensorCoreMode::new(self.family(), self.error_correction())
    }

    pub fn kind(self) -> ElementKind {
        if (self.0 >> KIND_SHIFT) & 1 == 1 {
            ElementKind::Complex
        } else {
            ElementKind::Real
        }
    }

    /// Dense index in `0..SIGNATURE_COUNT`.
    pub fn slot(self) -> usize {
        let outer = (self.kind().index() * 2 + self.family().index()) * 2
            + usize::from(self.error_correction());
        (outer * 3 + self.op_a().index()) * 3 + self.op_b().index()
    }

    /// Every valid signature, in slot order.
    pub fn all() -> impl Iterator<Item = ModuleSignature> {
        ElementKind::ALL.into_iter().flat_map(|kind| {
            PrecisionFamily::ALL.into_iter().flat_map(move |family| {
                [false, true].into_iter().flat_map(move |ec| {
                    Operation::ALL.into_iter().flat_map(move |op_a| {
                        Operation::ALL.into_iter().map(move |op_b| {
                            derive_signature(TensorCoreMode::new(family, ec), op_a, op_b, kind)
                        })
                    })
                })
            })
        })
    }
}

impl fmt::Display for ModuleSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}{}", self.mode(), self.kind(), self.op_a(), self.op_b())
    }
}
