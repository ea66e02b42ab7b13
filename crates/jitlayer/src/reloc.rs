//! Relocation arithmetic for x86-64 and AArch64 ELF objects.
//!
//! `S` is the target address, `A` the addend, `P` the address of the place
//! being patched and `G` the address of the target's GOT slot. `Page(x)` is
//! `x` with its low 12 bits cleared. All math is done in `i128` so overflow
//! is detected, never wrapped.

use object::elf;

use crate::mangle::Architecture;

/// Size of one call stub. Both architectures fit in 16 bytes.
pub(crate) const STUB_SIZE: usize = 16;
/// Size of one GOT slot.
pub(crate) const GOT_SLOT_SIZE: usize = 8;

/// How a relocation patches its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocKind {
    /// `S + A`, 64 bits.
    Abs64,
    /// `S + A`, zero-extended 32 bits.
    Abs32,
    /// `S + A`, sign-extended 32 bits.
    Abs32Signed,
    /// `S + A`, 32 bits either signed or unsigned (AArch64 `ABS32`).
    Abs32Any,
    /// `S + A - P`, signed 32 bits.
    Pc32,
    /// `S + A - P`, 64 bits.
    Pc64,
    /// x86-64 `PLT32`: `S + A - P`, signed 32 bits, may go through a stub.
    Branch32,
    /// `G + A - P`, signed 32 bits.
    GotPc32,
    /// AArch64 `B`/`BL`: `(S + A - P) >> 2` in the low 26 bits, may go
    /// through a stub.
    Branch26,
    /// AArch64 `ADRP`: `Page(S + A) - Page(P)` in pages, signed 21 bits.
    /// The `_NC` form skips the range check.
    Page21 { checked: bool },
    /// AArch64 `ADRP` of the GOT slot: `Page(G + A) - Page(P)`.
    GotPage21,
    /// AArch64 12-bit immediate of `ADD` or a scaled `LDR`/`STR`: bits
    /// `[11:shift]` of `S + A`.
    Lo12 { shift: u8 },
    /// AArch64 `LDR` of the GOT slot: bits `[11:3]` of `G + A`.
    GotLo12,
}

impl RelocKind {
    /// Whether an out-of-range target can be reached through a call stub.
    pub(crate) fn uses_stub(self) -> bool {
        matches!(self, Self::Branch32 | Self::Branch26)
    }

    pub(crate) fn uses_got(self) -> bool {
        matches!(self, Self::GotPc32 | Self::GotPage21 | Self::GotLo12)
    }

    /// Width of the patched field in bytes.
    pub(crate) fn width(self) -> usize {
        match self {
            Self::Abs64 | Self::Pc64 => 8,
            _ => 4,
        }
    }
}

/// Map a raw ELF relocation type to the operation it performs.
///
/// `Ok(None)` means the relocation is a no-op.
pub(crate) fn classify(arch: Architecture, r_type: u32) -> Result<Option<RelocKind>, ()> {
    let kind = match (arch, r_type) {
        (Architecture::X86_64, elf::R_X86_64_NONE) => return Ok(None),
        (Architecture::X86_64, elf::R_X86_64_64) => RelocKind::Abs64,
        (Architecture::X86_64, elf::R_X86_64_32) => RelocKind::Abs32,
        (Architecture::X86_64, elf::R_X86_64_32S) => RelocKind::Abs32Signed,
        (Architecture::X86_64, elf::R_X86_64_PC32) => RelocKind::Pc32,
        (Architecture::X86_64, elf::R_X86_64_PC64) => RelocKind::Pc64,
        (Architecture::X86_64, elf::R_X86_64_PLT32) => RelocKind::Branch32,
        (
            Architecture::X86_64,
            elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX,
        ) => RelocKind::GotPc32,
        (Architecture::Aarch64, elf::R_AARCH64_NONE) => return Ok(None),
        (Architecture::Aarch64, elf::R_AARCH64_ABS64) => RelocKind::Abs64,
        (Architecture::Aarch64, elf::R_AARCH64_ABS32) => RelocKind::Abs32Any,
        (Architecture::Aarch64, elf::R_AARCH64_PREL32) => RelocKind::Pc32,
        (Architecture::Aarch64, elf::R_AARCH64_PREL64) => RelocKind::Pc64,
        (Architecture::Aarch64, elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26) => {
            RelocKind::Branch26
        }
        (Architecture::Aarch64, elf::R_AARCH64_ADR_PREL_PG_HI21) => {
            RelocKind::Page21 { checked: true }
        }
        (Architecture::Aarch64, elf::R_AARCH64_ADR_PREL_PG_HI21_NC) => {
            RelocKind::Page21 { checked: false }
        }
        (Architecture::Aarch64, elf::R_AARCH64_ADR_GOT_PAGE) => RelocKind::GotPage21,
        (Architecture::Aarch64, elf::R_AARCH64_ADD_ABS_LO12_NC | elf::R_AARCH64_LDST8_ABS_LO12_NC) => {
            RelocKind::Lo12 { shift: 0 }
        }
        (Architecture::Aarch64, elf::R_AARCH64_LDST16_ABS_LO12_NC) => RelocKind::Lo12 { shift: 1 },
        (Architecture::Aarch64, elf::R_AARCH64_LDST32_ABS_LO12_NC) => RelocKind::Lo12 { shift: 2 },
        (Architecture::Aarch64, elf::R_AARCH64_LDST64_ABS_LO12_NC) => RelocKind::Lo12 { shift: 3 },
        (Architecture::Aarch64, elf::R_AARCH64_LDST128_ABS_LO12_NC) => RelocKind::Lo12 { shift: 4 },
        (Architecture::Aarch64, elf::R_AARCH64_LD64_GOT_LO12_NC) => RelocKind::GotLo12,
        _ => return Err(()),
    };
    Ok(Some(kind))
}

#[expect(
    clippy::arithmetic_side_effects,
    reason = "i128 cannot overflow on 64-bit operands"
)]
fn sum(target: u64, addend: i64, place: Option<u64>) -> i128 {
    let value = i128::from(target) + i128::from(addend);
    match place {
        Some(p) => value - i128::from(p),
        None => value,
    }
}

/// Compute and write one relocation. `field` starts at the place and must be
/// at least [`RelocKind::width`] bytes long.
///
/// For kinds where [`RelocKind::uses_got`] holds, `target` is the GOT slot
/// address. On overflow or a misaligned scaled offset the computed value is
/// returned so the caller can report it or retry through a stub.
pub(crate) fn apply(
    kind: RelocKind,
    field: &mut [u8],
    place: u64,
    target: u64,
    addend: i64,
) -> Result<(), i128> {
    match kind {
        RelocKind::Abs64 => {
            let value = sum(target, addend, None);
            // Wraps like the hardware would for negative addends.
            let bits = u64::try_from(value)
                .or_else(|_| i64::try_from(value).map(i64::cast_unsigned))
                .map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Abs32 => {
            let value = sum(target, addend, None);
            let bits = u32::try_from(value).map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Abs32Signed => {
            let value = sum(target, addend, None);
            let bits = i32::try_from(value).map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Abs32Any => {
            let value = sum(target, addend, None);
            let bits = u32::try_from(value)
                .or_else(|_| i32::try_from(value).map(i32::cast_unsigned))
                .map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Pc32 | RelocKind::Branch32 | RelocKind::GotPc32 => {
            let value = sum(target, addend, Some(place));
            let bits = i32::try_from(value).map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Pc64 => {
            let value = sum(target, addend, Some(place));
            let bits = i64::try_from(value).map_err(|_| value)?;
            write(field, &bits.to_le_bytes())
        }
        RelocKind::Branch26 => {
            let value = sum(target, addend, Some(place));
            // Word-aligned and within +/-128 MiB.
            if value % 4 != 0 || !(-(1i128 << 27)..(1i128 << 27)).contains(&value) {
                return Err(value);
            }
            let imm26 = u32::try_from((value >> 2) & 0x03ff_ffff).map_err(|_| value)?;
            let insn = read_u32(field).ok_or(value)?;
            let patched = (insn & 0xfc00_0000) | imm26;
            write(field, &patched.to_le_bytes())
        }
        RelocKind::Page21 { .. } | RelocKind::GotPage21 => {
            let delta = page_delta(target, addend, place);
            let checked = !matches!(kind, RelocKind::Page21 { checked: false });
            // +/-4 GiB.
            if checked && !(-(1i128 << 32)..(1i128 << 32)).contains(&delta) {
                return Err(delta);
            }
            encode_adrp(field, delta)
        }
        RelocKind::Lo12 { shift } => encode_lo12(field, sum(target, addend, None), shift),
        RelocKind::GotLo12 => encode_lo12(field, sum(target, addend, None), 3),
    }
}

#[expect(
    clippy::arithmetic_side_effects,
    reason = "i128 cannot overflow on page-aligned 64-bit operands"
)]
fn page_delta(target: u64, addend: i64, place: u64) -> i128 {
    const PAGE_MASK: i128 = !0xfff;
    (sum(target, addend, None) & PAGE_MASK) - (i128::from(place) & PAGE_MASK)
}

/// Patch the `immlo:immhi` fields of an `ADRP` with a page count.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "operands are masked to their field widths"
)]
fn encode_adrp(field: &mut [u8], delta: i128) -> Result<(), i128> {
    let pages = delta >> 12;
    let immlo = u32::try_from(pages & 0x3).map_err(|_| delta)?;
    let immhi = u32::try_from((pages >> 2) & 0x7_ffff).map_err(|_| delta)?;
    let insn = read_u32(field).ok_or(delta)?;
    let patched = (insn & 0x9f00_001f) | (immlo << 29) | (immhi << 5);
    write(field, &patched.to_le_bytes())
}

/// Patch the `imm12` field (bits `[21:10]`) with bits `[11:shift]` of
/// `value`, which must be aligned to the access size.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "operands are masked to their field widths"
)]
fn encode_lo12(field: &mut [u8], value: i128, shift: u8) -> Result<(), i128> {
    let low = u32::try_from(value & 0xfff).map_err(|_| value)?;
    if low.trailing_zeros() < u32::from(shift) {
        return Err(value);
    }
    let imm12 = low >> shift;
    let insn = read_u32(field).ok_or(value)?;
    let patched = (insn & 0xffc0_03ff) | (imm12 << 10);
    write(field, &patched.to_le_bytes())
}

fn write(field: &mut [u8], bytes: &[u8]) -> Result<(), i128> {
    field
        .get_mut(..bytes.len())
        .map(|dst| dst.copy_from_slice(bytes))
        .ok_or(0)
}

fn read_u32(field: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = field.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Read the addend stored in the place, for REL-style relocations.
pub(crate) fn implicit_addend(kind: RelocKind, field: &[u8]) -> Option<i64> {
    match kind.width() {
        8 => {
            let bytes: [u8; 8] = field.get(..8)?.try_into().ok()?;
            Some(i64::from_le_bytes(bytes))
        }
        _ => {
            let bytes: [u8; 4] = field.get(..4)?.try_into().ok()?;
            Some(i64::from(i32::from_le_bytes(bytes)))
        }
    }
}

/// Machine code for an absolute jump to `target`, padded to [`STUB_SIZE`].
pub(crate) fn stub_bytes(arch: Architecture, target: u64) -> Option<[u8; STUB_SIZE]> {
    let mut stub = [0u8; STUB_SIZE];
    let addr = target.to_le_bytes();
    match arch {
        Architecture::X86_64 => {
            // jmp qword ptr [rip + 0]; .quad target; 2 bytes of int3 padding
            stub[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
            stub[6..14].copy_from_slice(&addr);
            stub[14..].copy_from_slice(&[0xcc, 0xcc]);
        }
        Architecture::Aarch64 => {
            // ldr x16, #8; br x16; .quad target
            stub[..4].copy_from_slice(&0x5800_0050u32.to_le_bytes());
            stub[4..8].copy_from_slice(&0xd61f_0200u32.to_le_bytes());
            stub[8..].copy_from_slice(&addr);
        }
        Architecture::X86 | Architecture::Other => return None,
    }
    Some(stub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_x86_64() {
        assert_eq!(
            classify(Architecture::X86_64, elf::R_X86_64_PLT32),
            Ok(Some(RelocKind::Branch32))
        );
        assert_eq!(classify(Architecture::X86_64, elf::R_X86_64_NONE), Ok(None));
        assert_eq!(classify(Architecture::X86_64, elf::R_X86_64_TPOFF32), Err(()));
    }

    #[test]
    fn test_classify_aarch64() {
        assert_eq!(
            classify(Architecture::Aarch64, elf::R_AARCH64_CALL26),
            Ok(Some(RelocKind::Branch26))
        );
        assert_eq!(
            classify(Architecture::Aarch64, elf::R_AARCH64_ADR_PREL_PG_HI21),
            Ok(Some(RelocKind::Page21 { checked: true }))
        );
        assert_eq!(
            classify(Architecture::Aarch64, elf::R_AARCH64_LDST32_ABS_LO12_NC),
            Ok(Some(RelocKind::Lo12 { shift: 2 }))
        );
        assert!(
            classify(Architecture::Aarch64, elf::R_AARCH64_LD64_GOT_LO12_NC)
                .unwrap()
                .unwrap()
                .uses_got()
        );
        assert_eq!(
            classify(Architecture::Aarch64, elf::R_AARCH64_TLSLE_ADD_TPREL_HI12),
            Err(())
        );
    }

    #[test]
    fn test_abs64_writes_sum() {
        let mut field = [0u8; 8];
        apply(RelocKind::Abs64, &mut field, 0, 0x1000, 0x10).unwrap();
        assert_eq!(u64::from_le_bytes(field), 0x1010);
    }

    #[test]
    fn test_pc32_is_relative_to_place() {
        let mut field = [0u8; 4];
        apply(RelocKind::Pc32, &mut field, 0x2000, 0x1000, -4).unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x1000 - 4 - 0x2000);
    }

    #[test]
    fn test_pc32_overflow_reports_value() {
        let mut field = [0u8; 4];
        let err = apply(RelocKind::Branch32, &mut field, 0, 0x1_0000_0000, 0).unwrap_err();
        assert_eq!(err, 0x1_0000_0000);
        assert_eq!(field, [0u8; 4], "field must be untouched on overflow");
    }

    #[test]
    fn test_abs32_rejects_high_addresses() {
        let mut field = [0u8; 4];
        assert!(apply(RelocKind::Abs32, &mut field, 0, 0x1_0000_0000, 0).is_err());
        assert!(apply(RelocKind::Abs32Signed, &mut field, 0, 0x8000_0000, 0).is_err());
        apply(RelocKind::Abs32Signed, &mut field, 0, 0x10, -0x20).unwrap();
        assert_eq!(i32::from_le_bytes(field), -0x10);
    }

    #[test]
    fn test_branch26_patches_low_bits_only() {
        // bl #0
        let mut field = 0x9400_0000u32.to_le_bytes();
        apply(RelocKind::Branch26, &mut field, 0x1000, 0x1010, 0).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0x9400_0004);

        // Backwards branch encodes two's complement in 26 bits.
        let mut field = 0x1400_0000u32.to_le_bytes();
        apply(RelocKind::Branch26, &mut field, 0x1010, 0x1000, 0).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0x1400_0000 | 0x03ff_fffc);
    }

    #[test]
    fn test_branch26_out_of_range() {
        let mut field = 0x9400_0000u32.to_le_bytes();
        assert!(apply(RelocKind::Branch26, &mut field, 0, 1 << 28, 0).is_err());
        assert!(apply(RelocKind::Branch26, &mut field, 0, 2, 0).is_err());
    }

    #[test]
    fn test_adrp_encodes_page_delta() {
        // adrp x3, #0
        let mut field = 0x9000_0003u32.to_le_bytes();
        // Three pages forward, regardless of the low bits of either side.
        apply(RelocKind::Page21 { checked: true }, &mut field, 0x1_0ffc, 0x1_3abc, 0).unwrap();
        // immlo = 3 in bits [30:29], immhi = 0, Rd preserved.
        assert_eq!(u32::from_le_bytes(field), 0x9000_0003 | (3 << 29));

        let mut field = 0x9000_0000u32.to_le_bytes();
        apply(RelocKind::Page21 { checked: true }, &mut field, 0x5000, 0x1000, 0).unwrap();
        // -4 pages: immlo = 0, immhi = all ones.
        assert_eq!(u32::from_le_bytes(field), 0x9000_0000 | (0x7_ffff << 5));
    }

    #[test]
    fn test_adrp_range_is_checked_unless_nc() {
        let mut field = 0x9000_0000u32.to_le_bytes();
        let far = 1u64 << 33;
        assert!(apply(RelocKind::Page21 { checked: true }, &mut field, 0, far, 0).is_err());
        assert_eq!(field, 0x9000_0000u32.to_le_bytes());
        apply(RelocKind::Page21 { checked: false }, &mut field, 0, far, 0).unwrap();
    }

    #[test]
    fn test_lo12_scales_by_access_size() {
        // ldr x0, [x1]
        let mut field = 0xf940_0020u32.to_le_bytes();
        apply(RelocKind::Lo12 { shift: 3 }, &mut field, 0, 0x7_f018, 0).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0xf940_0020 | ((0x018 >> 3) << 10));

        // add x0, x0, #0
        let mut field = 0x9100_0000u32.to_le_bytes();
        apply(RelocKind::Lo12 { shift: 0 }, &mut field, 0, 0x1234, 1).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0x9100_0000 | (0x235 << 10));
    }

    #[test]
    fn test_lo12_rejects_misaligned_offsets() {
        let mut field = 0xf940_0020u32.to_le_bytes();
        assert!(apply(RelocKind::Lo12 { shift: 3 }, &mut field, 0, 0x1004, 0).is_err());
        assert!(apply(RelocKind::GotLo12, &mut field, 0, 0x1002, 0).is_err());
        assert_eq!(field, 0xf940_0020u32.to_le_bytes());
    }

    #[test]
    fn test_stub_embeds_target() {
        let stub = stub_bytes(Architecture::X86_64, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(&stub[..2], &[0xff, 0x25]);
        assert_eq!(u64::from_le_bytes(stub[6..14].try_into().unwrap()), 0x1122_3344_5566_7788);

        let stub = stub_bytes(Architecture::Aarch64, 0xdead_beef).unwrap();
        assert_eq!(u64::from_le_bytes(stub[8..].try_into().unwrap()), 0xdead_beef);
        assert!(stub_bytes(Architecture::Other, 0).is_none());
    }

    #[test]
    fn test_implicit_addend_reads_field() {
        let field = (-8i32).to_le_bytes();
        assert_eq!(implicit_addend(RelocKind::Pc32, &field), Some(-8));
    }
}
