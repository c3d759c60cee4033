// =====================================================================================
// BOOKING CELL
// =====================================================================================
//
// The booking saga and everything strictly local to it: payer to service
// resolution, slot conflict detection, idempotency replay, reservation
// persistence, and the HTTP surface.

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
