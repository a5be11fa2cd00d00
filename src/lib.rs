pub mod adapters;
pub mod alarm;
pub mod config;
pub mod cost;
pub mod error;
pub mod notify;
pub mod sample;
pub mod scheduler;
pub mod store;

pub use adapters::{AdapterRegistry, DeviceAdapter};
pub use config::{Config, Credentials};
pub use error::{AppError, Result};
pub use sample::{FieldValue, Sample};
pub use store::{MemoryStore, TimeSeriesStore, TimescaleGateway};
