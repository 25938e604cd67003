//! Cross-crate integration tests for the sound subsystem

#[cfg(test)]
mod scheduler_integration;
#[cfg(test)]
mod sound_system_integration;
