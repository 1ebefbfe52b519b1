// Shared helpers for the integration tests; not every test uses every helper
#![allow(dead_code)]

pub mod events;
pub mod fixtures;
