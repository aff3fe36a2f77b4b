//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate collects the raw x86_64 primitives the virtualization engine is
//! built on: register images, model-specific registers, segmentation and
//! descriptor tables, and the diagnostic print macros. Everything here is a
//! thin wrapper over a single instruction or a hardware-defined bit layout.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod x86_64;
