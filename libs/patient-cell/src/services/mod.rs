pub mod identity;
pub mod patient;
