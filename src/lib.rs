// kiln-rs: kiln firing controller core
pub mod control;
pub mod error;
pub mod oven;
pub mod profiles;
pub mod recovery;
pub mod sampler;
pub mod store;
pub mod watcher;

pub use error::KilnError;
pub use oven::{KilnHandle, Oven, OvenCommand};
pub use profiles::ProfileDirectory;
pub use recovery::{IdleReason, RecoveryDecision, recover};
pub use sampler::{SamplerHandle, SamplerStatus, TemperatureReading, TemperatureSampler};
pub use store::{JsonFileStore, MemoryStore};
pub use watcher::{SubscriberId, Watcher};

pub use kiln_shared;
