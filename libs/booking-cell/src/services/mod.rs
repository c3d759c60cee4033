pub mod conflict;
pub mod idempotency;
pub mod orchestrator;
pub mod reservations;
pub mod service_resolver;
