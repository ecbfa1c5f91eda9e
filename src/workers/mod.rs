//! Background worker pools draining the broker's queues.

pub mod inference;
pub mod persistence;

pub use inference::InferenceWorker;
pub use persistence::PersistenceWorker;
