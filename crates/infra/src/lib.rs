//! Concrete providers for the sound core
//!
//! - [`hardware`]: the thread-driven timing source and simulated cards
//! - [`resources`]: lump providers backed by memory or a directory
//! - [`playback`]: a playback engine that only logs what it is asked to do

pub mod hardware;
pub mod playback;
pub mod resources;

pub use hardware::*;
pub use playback::*;
pub use resources::*;
