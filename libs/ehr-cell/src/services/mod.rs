pub mod alerts;
pub mod audit;
pub mod cache;
pub mod client;
pub mod gateway;
pub mod retry;
pub mod upsert;
pub mod verification;
