// =====================================================================================
// EHR CELL
// =====================================================================================
//
// Everything that talks to the external EHR: the rate-limited gateway all
// traffic passes through, the HTTP client and its failure taxonomy, retry and
// propagation-verification machinery, client find-or-create, the appointment
// read cache, and the sync audit trail.

pub mod models;
pub mod services;
