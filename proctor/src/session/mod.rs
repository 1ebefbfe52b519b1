// Proctored exam session core
// Shared by the library consumers, the simulator binary and the integration tests

pub mod camera;
pub mod capture;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod handoff;
pub mod memory;
pub mod persistence;
pub mod protocol;
pub mod signal;
pub mod violations;

pub use controller::{SessionController, SubmitOutcome};
pub use error::{ProctorError, ProctorResult};
