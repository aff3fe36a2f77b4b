//! Segment state reconstruction.
//!
//! VMX wants every segment register of the guest and the host described by
//! its selector, base, limit and access rights. The processor only exposes the
//! selector, so the rest is recovered from the descriptor tables.
use crate::{cpu::Cpu, VmError};
use abyss::x86_64::{
    msr::{IA32_FS_BASE, IA32_GS_BASE},
    segmentation::{SegmentDescriptor, SegmentRegister, SegmentSelector},
};

/// Access-rights bit marking a segment register as unusable.
pub const UNUSABLE: u32 = 1 << 16;
/// Access-rights bits VMX defines: type, S, DPL, P, AVL, L, D/B and G.
///
/// Bits 8..11 and 17..31 are reserved.
pub const ACCESS_RIGHTS_MASK: u32 = 0xf0ff;

/// Linear base address of the segment `selector` refers to.
///
/// The null selector has base 0. A 64-bit TSS descriptor spans two slots and
/// yields a full 64-bit base; every other descriptor yields 32 bits. Selectors
/// into the local descriptor table are not supported.
pub fn segment_base(table: &[u64], selector: SegmentSelector) -> Result<u64, VmError> {
    if selector.is_null() {
        return Ok(0);
    }
    if selector.is_ldt() {
        return Err(VmError::UnsupportedSelector(selector.pack()));
    }

    let index = selector.index() as usize;
    let slot = |i: usize| {
        table
            .get(i)
            .copied()
            .ok_or(VmError::UnsupportedSelector(selector.pack()))
    };
    let desc = SegmentDescriptor::from_raw(slot(index)?);
    let mut base = desc.base();
    if desc.is_tss() {
        base |= (slot(index + 1)? & 0xffff_ffff) << 32;
    }
    Ok(base)
}

/// Access rights of `selector` in the VMCS encoding.
///
/// The null selector, and any selector whose descriptor the processor refuses
/// to report, is unusable.
pub fn segment_access_rights<C: Cpu + ?Sized>(cpu: &C, selector: SegmentSelector) -> u32 {
    if selector.is_null() {
        return UNUSABLE;
    }
    match cpu.access_rights(selector) {
        Some(ar) => (ar >> 8) & ACCESS_RIGHTS_MASK,
        None => UNUSABLE,
    }
}

/// Everything VMX records about one segment register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentState {
    /// Selector.
    pub selector: SegmentSelector,
    /// Linear base address.
    pub base: u64,
    /// Limit in bytes.
    pub limit: u32,
    /// Access rights in the VMCS encoding.
    pub access_rights: u32,
}

impl SegmentState {
    /// Capture the current state of `reg`, resolving descriptors in `gdt`.
    ///
    /// fs and gs take their bases from the base MSRs, since the descriptor
    /// only holds the low 32 bits.
    pub fn capture<C: Cpu + ?Sized>(
        cpu: &C,
        gdt: &[u64],
        reg: SegmentRegister,
    ) -> Result<Self, VmError> {
        let selector = cpu.read_selector(reg);
        let base = match reg {
            SegmentRegister::Fs => cpu.read_msr(IA32_FS_BASE as u32)?,
            SegmentRegister::Gs => cpu.read_msr(IA32_GS_BASE as u32)?,
            _ => segment_base(gdt, selector)?,
        };
        Ok(Self {
            selector,
            base,
            limit: cpu.segment_limit(selector),
            access_rights: segment_access_rights(cpu, selector),
        })
    }
}
