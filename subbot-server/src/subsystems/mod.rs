pub mod admission;
pub mod auth;
pub mod heartbeat;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod supervisor;
