//! Segmentation.

use super::PrivilegeLevel;
use core::arch::asm;

bitflags::bitflags! {
    /// X86_64's access permission of segment.
    pub struct SegmentAccess: u64 {
        /// Granularity
        const G = 1 << 55;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const D_B = 1 << 54;
        /// 64-bit code segment (IA-32e mode only)
        const L = 1 << 53;
        /// Available for use by system software
        const AVL = 1 << 52;

        /// Segment present
        const P = 1 << 47;
        /// Descriptor type  (0 = system; 1 = code or data).
        const S = 1 << 44;
        /// Data or Code
        const CODE = 1 << 43;
        /// Expand_down/Conforming.
        const EC = 1 << 42;
        /// Writable/Readable.
        const WR = 1 << 41;
        /// Accessed.
        const A = 1 << 40;
    }
}

impl SegmentAccess {
    const BASE_31_24_SHIFT: u64 = 56;
    const SEG_LIMIT_SHIFT: u64 = 48;
    const DPL_SHIFT: u64 = 45;
    const TYPE_SHIFT: u64 = 40;
    const BASE_23_0_SHIFT: u64 = 16;
}

/// System descriptor type of an available 64-bit TSS.
pub const TYPE_TSS64_AVAILABLE: u8 = 0x9;
/// System descriptor type of a busy 64-bit TSS.
pub const TYPE_TSS64_BUSY: u8 = 0xb;

/// X86_64's Segment Descriptor, one 8-byte slot of a descriptor table.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// Create a null segment.
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Interpret a raw table entry.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create a new segment.
    #[inline]
    pub const fn new(base: u64, limit: u64, access: SegmentAccess, dpl: PrivilegeLevel) -> Self {
        Self(
            (limit & 0xffff)
                | (base & 0xff_ffff) << SegmentAccess::BASE_23_0_SHIFT
                | access.bits()
                | (dpl as u64) << SegmentAccess::DPL_SHIFT
                | ((limit >> 16) & 0xf) << SegmentAccess::SEG_LIMIT_SHIFT
                | ((base >> 24) & 0xff) << SegmentAccess::BASE_31_24_SHIFT,
        )
    }

    /// Create the two slots of a 64-bit system descriptor such as a TSS.
    #[inline]
    pub const fn new_system(base: u64, limit: u64, ty: u8, dpl: PrivilegeLevel) -> [Self; 2] {
        let low = Self::new(
            base,
            limit,
            SegmentAccess::from_bits_truncate(SegmentAccess::P.bits()),
            dpl,
        );
        [
            Self(low.0 | ((ty as u64 & 0xf) << SegmentAccess::TYPE_SHIFT)),
            Self(base >> 32),
        ]
    }

    /// Pack the descriptor into a quad word.
    #[inline]
    pub const fn pack(self) -> u64 {
        self.0
    }

    /// The 32-bit base address scattered across the descriptor.
    #[inline]
    pub const fn base(self) -> u64 {
        ((self.0 >> SegmentAccess::BASE_23_0_SHIFT) & 0xff_ffff)
            | ((self.0 >> SegmentAccess::BASE_31_24_SHIFT) & 0xff) << 24
    }

    /// Type field (bits 40..44).
    #[inline]
    pub const fn ty(self) -> u8 {
        ((self.0 >> SegmentAccess::TYPE_SHIFT) & 0xf) as u8
    }

    /// Whether this describes a system segment rather than code or data.
    #[inline]
    pub const fn is_system(self) -> bool {
        self.0 & SegmentAccess::S.bits() == 0
    }

    /// Whether this is the low half of a 64-bit TSS descriptor.
    #[inline]
    pub const fn is_tss(self) -> bool {
        self.is_system() && matches!(self.ty(), TYPE_TSS64_AVAILABLE | TYPE_TSS64_BUSY)
    }
}

impl core::fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentDescriptor")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("type", &self.ty())
            .field("system", &self.is_system())
            .finish()
    }
}

/// X86_64's segment selector.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl core::fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("ldt", &self.is_ldt())
            .field("rpl", &self.rpl())
            .finish()
    }
}

impl SegmentSelector {
    /// The null selector.
    pub const NULL: Self = Self(0);

    /// Create a new SegmentSelector from the index and rpl.
    #[inline]
    pub const fn new(index: u16, rpl: PrivilegeLevel) -> Self {
        Self((index << 3) | rpl as u16)
    }

    /// Interpret a raw selector value.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Pack the SegmentSelector into a word.
    #[inline]
    pub const fn pack(self) -> u16 {
        self.0
    }

    /// Get index of the SegmentSelector.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Whether the selector refers to the local descriptor table.
    #[inline]
    pub const fn is_ldt(self) -> bool {
        self.0 & 0b100 != 0
    }

    /// A selector whose table indicator and index are both zero.
    ///
    /// The requested privilege level is ignored.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 & !0b11 == 0
    }

    /// Get rpl of the SegmentSelector.
    #[inline]
    pub const fn rpl(self) -> PrivilegeLevel {
        match self.0 & 3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }
}

/// X86_64's Segment Register
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentRegister {
    /// Extra Segment.
    Es,
    /// Code Segment.
    Cs,
    /// Stack Segment.
    Ss,
    /// Data Segment.
    Ds,
    /// Extra Segment (E -> F).
    Fs,
    /// Extra Segment (F -> G).
    Gs,
    /// Local Descriptor Table.
    Ldtr,
    /// Task Register.
    Tr,
}

impl SegmentRegister {
    /// Every segment register in VMCS encoding order.
    pub const ALL: [Self; 8] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
    ];

    /// Read the selector currently held by the register.
    #[inline(always)]
    pub fn current(&self) -> SegmentSelector {
        let sel: u16;
        unsafe {
            match self {
                Self::Es => asm!("mov {:x}, es", out(reg) sel, options(nomem, nostack)),
                Self::Cs => asm!("mov {:x}, cs", out(reg) sel, options(nomem, nostack)),
                Self::Ss => asm!("mov {:x}, ss", out(reg) sel, options(nomem, nostack)),
                Self::Ds => asm!("mov {:x}, ds", out(reg) sel, options(nomem, nostack)),
                Self::Fs => asm!("mov {:x}, fs", out(reg) sel, options(nomem, nostack)),
                Self::Gs => asm!("mov {:x}, gs", out(reg) sel, options(nomem, nostack)),
                Self::Ldtr => asm!("sldt {:x}", out(reg) sel, options(nomem, nostack)),
                Self::Tr => asm!("str {:x}", out(reg) sel, options(nomem, nostack)),
            }
        }
        SegmentSelector(sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_fields() {
        let s = SegmentSelector::from_raw(0x2b);
        assert_eq!(s.index(), 5);
        assert_eq!(s.rpl(), PrivilegeLevel::Ring3);
        assert!(!s.is_ldt());
        assert!(SegmentSelector::from_raw(3).is_null());
        assert!(!SegmentSelector::from_raw(4).is_null());
    }

    #[test]
    fn descriptor_base_and_type() {
        let code = SegmentDescriptor::new(
            0xdead_beef,
            0xfffff,
            SegmentAccess::P | SegmentAccess::S | SegmentAccess::CODE,
            PrivilegeLevel::Ring0,
        );
        assert_eq!(code.base(), 0xdead_beef);
        assert!(!code.is_system());
        assert!(!code.is_tss());

        let [low, high] =
            SegmentDescriptor::new_system(0xffff_f800_1234_5678, 0x67, TYPE_TSS64_BUSY, PrivilegeLevel::Ring0);
        assert!(low.is_tss());
        assert_eq!(low.base(), 0x1234_5678);
        assert_eq!(high.pack(), 0xffff_f800);
    }
}
