// =============================================================================
// HTTP API Module
// =============================================================================
//
// Read-only JSON snapshots for an external dashboard, plus the three
// mutating control endpoints (kill, pause, resume). Everything else that
// changes engine behavior goes through configuration, not this API.

pub mod auth;
pub mod rest;
