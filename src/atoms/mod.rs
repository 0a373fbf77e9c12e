// ── Airborne Atoms Layer ───────────────────────────────────────────────────
// Pure constants, error types, core data model, and trait seams.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/, auth/, store/, or server/.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
