//! Sound card arbitration and timer task scheduling
//!
//! The `domain` module holds everything that does not touch real hardware:
//! the device model, the arbitration table, the PIT-style task scheduler and
//! the startup/shutdown lifecycle tying them together.

pub mod domain;
