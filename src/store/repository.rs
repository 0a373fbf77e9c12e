// ── Airborne Store: Tenant-Scoped Conversation Repository ──────────────────
// Every data-access operation is scoped to a single tenant and routes to a
// tenant-prefixed table set (`<tenant>_threads`, `<tenant>_messages`).
// Prefixed tables instead of a tenant_id column: a forgotten filter
// predicate cannot leak another tenant's rows.
//
// The tenant slug is validated against the registry whitelist at
// construction; table names are never interpolated from request-supplied
// input.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::atoms::constants::DEBUG_CAPTURE_MAX_BYTES;
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    ConversationThread, ConversationTurnParams, Role, StoredMessage, ThreadStatus,
};

/// Tenant slugs are lowercase `[a-z0-9_]`, max 32 chars, and must not start
/// with a digit. This is the only shape that may ever reach a table name.
pub fn valid_tenant_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 32
        && !slug.as_bytes()[0].is_ascii_digit()
        && slug.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Thread-safe, tenant-scoped repository over a shared SQLite handle.
#[derive(Debug)]
pub struct TenantRepository {
    conn: Arc<Mutex<Connection>>,
    tenant_id: String,
    /// Persist raw upstream payloads alongside assistant messages. Off by
    /// default; payloads are sensitive.
    capture_debug: bool,
}

impl TenantRepository {
    /// Open (or create) the conversation database.
    pub fn open(path: &Path) -> GatewayResult<Arc<Mutex<Connection>>> {
        info!("[store] Opening conversation store at {path:?}");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Arc::new(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> GatewayResult<Arc<Mutex<Connection>>> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Arc::new(Mutex::new(conn)))
    }

    /// Construct a repository for one tenant, validating the slug against
    /// the caller-supplied whitelist and bootstrapping the tenant's table
    /// set idempotently.
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        tenant_id: &str,
        whitelist: &[String],
        capture_debug: bool,
    ) -> GatewayResult<Self> {
        if !valid_tenant_slug(tenant_id) {
            return Err(GatewayError::invalid(format!(
                "tenant id {tenant_id:?} is not a valid slug"
            )));
        }
        if !whitelist.iter().any(|t| t == tenant_id) {
            return Err(GatewayError::invalid(format!("unknown tenant {tenant_id:?}")));
        }

        let repo = TenantRepository {
            conn,
            tenant_id: tenant_id.to_string(),
            capture_debug,
        };
        repo.bootstrap()?;
        Ok(repo)
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn threads_table(&self) -> String {
        format!("{}_threads", self.tenant_id)
    }

    fn messages_table(&self) -> String {
        format!("{}_messages", self.tenant_id)
    }

    fn bootstrap(&self) -> GatewayResult<()> {
        let threads = self.threads_table();
        let messages = self.messages_table();
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {threads} (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'archived', 'deleted'))
            );

            CREATE TABLE IF NOT EXISTS {messages} (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                provider TEXT,
                model TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER,
                total_tokens INTEGER,
                processing_time_ms INTEGER,
                cost_usd REAL,
                cost_unknown INTEGER NOT NULL DEFAULT 0,
                response_id TEXT,
                citations_json TEXT,
                debug_request BLOB,
                debug_response BLOB,
                FOREIGN KEY (thread_id) REFERENCES {threads}(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_{messages}_thread
                ON {messages}(thread_id, created_at);
            "
        ))?;
        Ok(())
    }

    // ── Threads ────────────────────────────────────────────────────────────

    /// Fetch a thread, or create it active with zero messages.
    pub fn get_or_create_thread(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> GatewayResult<ConversationThread> {
        let threads = self.threads_table();
        let conn = self.conn.lock();
        if let Some(t) = Self::read_thread(&conn, &threads, thread_id)? {
            return Ok(t);
        }
        let now = Utc::now();
        conn.execute(
            &format!(
                "INSERT INTO {threads} (id, user_id, created_at, updated_at, message_count, status)
                 VALUES (?1, ?2, ?3, ?3, 0, 'active')"
            ),
            params![thread_id, user_id, now.to_rfc3339()],
        )?;
        Ok(ConversationThread {
            id: thread_id.to_string(),
            tenant_id: self.tenant_id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            status: ThreadStatus::Active,
        })
    }

    pub fn get_thread(&self, thread_id: &str) -> GatewayResult<Option<ConversationThread>> {
        let threads = self.threads_table();
        let conn = self.conn.lock();
        Self::read_thread(&conn, &threads, thread_id)
    }

    fn read_thread(
        conn: &Connection,
        table: &str,
        thread_id: &str,
    ) -> GatewayResult<Option<ConversationThread>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, user_id, created_at, updated_at, message_count, status
                     FROM {table} WHERE id = ?1"
                ),
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, user_id, created, updated, count, status)) => Ok(Some(ConversationThread {
                id,
                tenant_id: String::new(),
                user_id,
                created_at: parse_ts(&created)?,
                updated_at: parse_ts(&updated)?,
                message_count: count,
                status: ThreadStatus::parse(&status)
                    .ok_or_else(|| GatewayError::internal(format!("bad thread status {status}")))?,
            })),
        }
    }

    pub fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> GatewayResult<()> {
        let threads = self.threads_table();
        let conn = self.conn.lock();
        let n = conn.execute(
            &format!("UPDATE {threads} SET status = ?1, updated_at = ?2 WHERE id = ?3"),
            params![status.as_str(), Utc::now().to_rfc3339(), thread_id],
        )?;
        if n == 0 {
            return Err(GatewayError::invalid(format!("unknown thread {thread_id}")));
        }
        Ok(())
    }

    // ── Turns ──────────────────────────────────────────────────────────────

    /// Persist one conversation turn as a single transaction:
    /// user insert, assistant insert, thread touch. On any failure the
    /// transaction rolls back and both messages are absent.
    pub fn persist_turn(&self, p: &ConversationTurnParams) -> GatewayResult<(String, String)> {
        let threads = self.threads_table();
        let messages = self.messages_table();
        let now = Utc::now();

        let citations_json = if p.citations.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&p.citations)?)
        };
        let (debug_req, debug_resp) = match (&p.debug, self.capture_debug) {
            (Some(d), true) => (
                Some(cap_bytes(&d.request)),
                Some(cap_bytes(&d.response)),
            ),
            _ => (None, None),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // The thread row must exist before messages reference it.
        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT message_count FROM {threads} WHERE id = ?1"),
                params![p.thread_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            tx.execute(
                &format!(
                    "INSERT INTO {threads} (id, user_id, created_at, updated_at, message_count, status)
                     VALUES (?1, ?2, ?3, ?3, 0, 'active')"
                ),
                params![p.thread_id, p.user_id, now.to_rfc3339()],
            )?;
        }

        let user_msg_id: String = tx.query_row(
            &format!(
                "INSERT INTO {messages} (id, thread_id, role, content, created_at)
                 VALUES (?1, ?2, 'user', ?3, ?4)
                 RETURNING id"
            ),
            params![
                uuid::Uuid::new_v4().to_string(),
                p.thread_id,
                p.user_content,
                now.to_rfc3339()
            ],
            |row| row.get(0),
        )?;

        let assistant_msg_id: String = tx.query_row(
            &format!(
                "INSERT INTO {messages}
                   (id, thread_id, role, content, created_at, provider, model,
                    input_tokens, output_tokens, total_tokens, processing_time_ms,
                    cost_usd, cost_unknown, response_id, citations_json,
                    debug_request, debug_response)
                 VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16)
                 RETURNING id"
            ),
            params![
                uuid::Uuid::new_v4().to_string(),
                p.thread_id,
                p.assistant_content,
                now.to_rfc3339(),
                p.provider,
                p.model,
                p.usage.input_tokens as i64,
                p.usage.output_tokens as i64,
                p.usage.total_tokens as i64,
                p.processing_time_ms,
                p.cost_usd,
                p.cost_unknown as i64,
                p.response_id,
                citations_json,
                debug_req,
                debug_resp,
            ],
            |row| row.get(0),
        )?;

        tx.execute(
            &format!(
                "UPDATE {threads}
                 SET message_count = message_count + 2, updated_at = ?1
                 WHERE id = ?2"
            ),
            params![now.to_rfc3339(), p.thread_id],
        )?;

        tx.commit()?;
        Ok((user_msg_id, assistant_msg_id))
    }

    /// Messages of a thread in chronological order.
    pub fn list_messages(&self, thread_id: &str, limit: i64) -> GatewayResult<Vec<StoredMessage>> {
        let messages = self.messages_table();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, thread_id, role, content, created_at, provider, model,
                    input_tokens, output_tokens, total_tokens, processing_time_ms,
                    cost_usd, response_id, citations_json
             FROM {messages} WHERE thread_id = ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![thread_id, limit], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                role: match row.get::<_, String>(2)?.as_str() {
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    _ => Role::System,
                },
                content: row.get(3)?,
                created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                provider: row.get(5)?,
                model: row.get(6)?,
                input_tokens: row.get(7)?,
                output_tokens: row.get(8)?,
                total_tokens: row.get(9)?,
                processing_time_ms: row.get(10)?,
                cost_usd: row.get(11)?,
                response_id: row.get(12)?,
                citations_json: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Count messages for one thread — used by atomicity tests.
    pub fn count_messages(&self, thread_id: &str) -> GatewayResult<i64> {
        let messages = self.messages_table();
        let conn = self.conn.lock();
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {messages} WHERE thread_id = ?1"),
            params![thread_id],
            |row| row.get(0),
        )?)
    }
}

fn parse_ts(s: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::internal(format!("bad timestamp {s:?}: {e}")))
}

fn cap_bytes(b: &[u8]) -> Vec<u8> {
    if b.len() > DEBUG_CAPTURE_MAX_BYTES {
        warn!(
            "[store] Debug payload truncated from {} to {} bytes",
            b.len(),
            DEBUG_CAPTURE_MAX_BYTES
        );
        b[..DEBUG_CAPTURE_MAX_BYTES].to_vec()
    } else {
        b.to_vec()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Citation, CitationKind, TokenUsage};

    fn test_repo() -> TenantRepository {
        let conn = TenantRepository::open_in_memory().unwrap();
        TenantRepository::new(conn, "acme", &["acme".to_string()], false).unwrap()
    }

    fn turn(thread: &str) -> ConversationTurnParams {
        ConversationTurnParams {
            thread_id: thread.to_string(),
            user_id: "u1".to_string(),
            request_id: None,
            user_content: "Summarize X".to_string(),
            assistant_content: "X is…".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            usage: TokenUsage { input_tokens: 1000, output_tokens: 2000, total_tokens: 3000 },
            processing_time_ms: 420,
            cost_usd: 0.035,
            cost_unknown: false,
            response_id: Some("resp_1".to_string()),
            citations: vec![Citation {
                kind: CitationKind::Url,
                locator: "https://example.com".to_string(),
                title: None,
                snippet: None,
            }],
            debug: None,
        }
    }

    #[test]
    fn slug_validation() {
        assert!(valid_tenant_slug("acme"));
        assert!(valid_tenant_slug("acme_corp2"));
        assert!(!valid_tenant_slug("Acme"));
        assert!(!valid_tenant_slug("acme-corp"));
        assert!(!valid_tenant_slug("1acme"));
        assert!(!valid_tenant_slug(""));
        assert!(!valid_tenant_slug("a;DROP TABLE x;--"));
    }

    #[test]
    fn unknown_tenant_is_rejected_at_construction() {
        let conn = TenantRepository::open_in_memory().unwrap();
        let err = TenantRepository::new(conn, "ghost", &["acme".to_string()], false).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn persist_turn_writes_both_messages_and_touches_thread() {
        let repo = test_repo();
        let before = repo.get_or_create_thread("t1", "u1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        repo.persist_turn(&turn("t1")).unwrap();

        let after = repo.get_thread("t1").unwrap().unwrap();
        assert_eq!(after.message_count, before.message_count + 2);
        assert!(after.updated_at > before.updated_at);

        let msgs = repo.list_messages("t1", 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].total_tokens, Some(3000));
        assert!((msgs[1].cost_usd.unwrap() - 0.035).abs() < 1e-9);
        assert!(msgs[1].citations_json.as_deref().unwrap().contains("example.com"));
    }

    #[test]
    fn failed_assistant_insert_leaves_zero_rows() {
        let conn = TenantRepository::open_in_memory().unwrap();
        let repo = TenantRepository::new(conn.clone(), "acme", &["acme".to_string()], false).unwrap();
        let before = repo.get_or_create_thread("t1", "u1").unwrap();

        // Fault injection: abort the transaction at the assistant insert,
        // after the user insert has already succeeded.
        conn.lock()
            .execute_batch(
                "CREATE TRIGGER fail_assistant BEFORE INSERT ON acme_messages
                 WHEN NEW.role = 'assistant'
                 BEGIN SELECT RAISE(ABORT, 'injected'); END;",
            )
            .unwrap();

        assert!(repo.persist_turn(&turn("t1")).is_err());

        assert_eq!(repo.count_messages("t1").unwrap(), 0);
        let after = repo.get_thread("t1").unwrap().unwrap();
        assert_eq!(after.message_count, 0);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn debug_payloads_only_persist_when_enabled() {
        let conn = TenantRepository::open_in_memory().unwrap();
        let repo = TenantRepository::new(conn.clone(), "acme", &["acme".to_string()], true).unwrap();
        let mut p = turn("t1");
        p.debug = Some(crate::atoms::types::DebugPayload {
            request: b"req-bytes".to_vec(),
            response: b"resp-bytes".to_vec(),
        });
        repo.persist_turn(&p).unwrap();

        let c = conn.lock();
        let blob: Option<Vec<u8>> = c
            .query_row(
                "SELECT debug_request FROM acme_messages WHERE role = 'assistant'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(blob.as_deref(), Some(&b"req-bytes"[..]));
    }

    #[test]
    fn thread_status_transitions() {
        let repo = test_repo();
        repo.get_or_create_thread("t1", "u1").unwrap();
        repo.set_thread_status("t1", ThreadStatus::Archived).unwrap();
        assert_eq!(repo.get_thread("t1").unwrap().unwrap().status, ThreadStatus::Archived);
        assert!(repo.set_thread_status("ghost", ThreadStatus::Deleted).is_err());
    }
}
