// tvrelay-core - shared foundations for the tvrelay stream engine
//
// - config/   - layered configuration (file + TVRELAY_* environment)
// - source    - source resolution contract and the static catalog resolver
// - store/    - shared state store (Redis or in-memory)

pub mod config;
pub mod error;
pub mod logging;
pub mod source;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use store::{Keys, MemoryStateStore, RedisStateStore, StateStore};
