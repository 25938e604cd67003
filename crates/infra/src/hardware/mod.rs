//! Hardware-facing implementations
//!
//! Nothing here talks to real I/O ports. The timer is a dedicated thread
//! standing in for the PIT interrupt, and the cards are simulations that
//! answer (or refuse to answer) the same way real ones would.

pub mod cards;
pub mod timer;

pub use cards::*;
pub use timer::*;
