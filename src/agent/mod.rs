pub mod engine;
pub mod persona;
pub mod spawner;
pub mod temporal;

pub use engine::{AgentEngine, LoopStatus, MAX_ITERATIONS_SENTINEL, RunOutcome};
pub use spawner::SubAgentSpawner;
