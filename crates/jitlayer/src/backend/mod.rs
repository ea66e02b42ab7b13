//! Lowerings that generate code, as opposed to passing objects through.
//!
//! # Feature Flags
//!
//! - `cranelift` (default): [`cranelift::CraneliftLowering`], which compiles
//!   Cranelift IR modules into ELF objects for the host ISA.

#[cfg(feature = "cranelift")]
pub mod cranelift;
