// ── Airborne Store Layer ───────────────────────────────────────────────────
// The shared key-value seam (Redis + in-memory twin) and the tenant-scoped
// conversation repository.

pub mod kv;
pub mod repository;

pub use kv::{MemoryKv, RedisKv};
pub use repository::TenantRepository;
