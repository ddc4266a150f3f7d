//! SQLite-backed repository: users, sessions, nonces, rooms, members, messages.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::error::ChatError;

pub struct Repository {
    conn: Mutex<Connection>,
}

// ─── Row types ───

#[derive(Debug, Clone, serde::Serialize)]
pub struct User {
    /// Server-internal; never serialized across the wire (spec §3: ids are server-exclusive).
    #[serde(skip_serializing)]
    pub id: i64,
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    /// Secret material; never serialized across the wire.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub session_id: String,
    pub user_id: Option<i64>,
    pub session_key_hex: String,
    pub remote_addr: String,
    pub created_at: String,
    pub last_active_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Room {
    pub id: i64,
    pub room_id: String,
    pub name: String,
    pub is_private: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Member {
    pub room_id: i64,
    pub user_id: i64,
    pub is_admin: bool,
    pub joined_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Message {
    pub id: i64,
    pub room_id: i64,
    pub user_id: i64,
    pub content: String,
    pub is_announcement: bool,
    pub created_at: String,
}

impl Repository {
    /// Open (and create if absent) the SQLite database at `db_url`, then run migrations.
    /// Mirrors `vbmcoder-pingo`'s `Database::new`: open, tune pragmas, run idempotent DDL.
    pub fn open(db_url: &str) -> Result<Self, ChatError> {
        let conn = Connection::open(db_url).map_err(ChatError::from)?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_db()?;
        Ok(repo)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, ChatError> {
        let conn = Connection::open_in_memory().map_err(ChatError::from)?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_db()?;
        Ok(repo)
    }

    /// Create the schema if it doesn't exist yet. Idempotent — safe to call on every startup
    /// and from the `init_db` CLI subcommand.
    pub fn init_db(&self) -> Result<(), ChatError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                password_hash TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                user_id INTEGER REFERENCES users(id),
                session_key TEXT NOT NULL UNIQUE,
                remote_addr TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nonces (
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                nonce TEXT NOT NULL,
                PRIMARY KEY (session_id, nonce)
            )",
            [],
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                is_private INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS members (
                room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                is_admin INTEGER NOT NULL DEFAULT 0,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            )",
            [],
        )
        .map_err(ChatError::from)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                is_announcement INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(ChatError::from)?;

        for idx in &[
            "CREATE INDEX IF NOT EXISTS idx_messages_room_order ON messages(room_id, created_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id)",
        ] {
            conn.execute(idx, []).map_err(ChatError::from)?;
        }

        Ok(())
    }

    // ─── Users ───

    pub fn create_user(
        &self,
        user_id: &str,
        email: &str,
        display_name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<User, ChatError> {
        let conn = self.conn.lock().unwrap();
        let now = now();
        let email_lower = email.to_lowercase();
        conn.execute(
            "INSERT INTO users (user_id, email, display_name, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, email_lower, display_name, password_hash, now],
        )
        .map_err(ChatError::from)?;
        let id = conn.last_insert_rowid();
        Ok(User {
            id,
            user_id: user_id.to_string(),
            email: email_lower,
            display_name: display_name.map(|s| s.to_string()),
            password_hash: password_hash.map(|s| s.to_string()),
            created_at: now,
        })
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let email_lower = email.to_lowercase();
        conn.query_row(
            "SELECT id, user_id, email, display_name, password_hash, created_at
             FROM users WHERE email = ?1",
            params![email_lower],
            Self::row_to_user,
        )
        .optional()
        .map_err(ChatError::from)
    }

    pub fn find_user_by_id(&self, id: i64) -> Result<Option<User>, ChatError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, email, display_name, password_hash, created_at
             FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(ChatError::from)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            user_id: row.get(1)?,
            email: row.get(2)?,
            display_name: row.get(3)?,
            password_hash: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    // ─── Sessions ───

    pub fn create_session(
        &self,
        session_id: &str,
        session_key_hex: &str,
        remote_addr: &str,
    ) -> Result<SessionRow, ChatError> {
        let conn = self.conn.lock().unwrap();
        let now = now();
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, session_key, remote_addr, created_at, last_active_at)
             VALUES (?1, NULL, ?2, ?3, ?4, ?4)",
            params![session_id, session_key_hex, remote_addr, now],
        )
        .map_err(ChatError::from)?;
        let id = conn.last_insert_rowid();
        Ok(SessionRow {
            id,
            session_id: session_id.to_string(),
            user_id: None,
            session_key_hex: session_key_hex.to_string(),
            remote_addr: remote_addr.to_string(),
            created_at: now.clone(),
            last_active_at: now,
        })
    }

    pub fn find_session(&self, session_id: &str) -> Result<Option<SessionRow>, ChatError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, session_id, user_id, session_key, remote_addr, created_at, last_active_at
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(ChatError::from)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
        Ok(SessionRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            session_key_hex: row.get(3)?,
            remote_addr: row.get(4)?,
            created_at: row.get(5)?,
            last_active_at: row.get(6)?,
        })
    }

    pub fn bind_user(&self, session_id: &str, user_id: i64) -> Result<(), ChatError> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sessions SET user_id = ?1 WHERE session_id = ?2",
                params![user_id, session_id],
            )
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub fn clear_user(&self, session_id: &str) -> Result<(), ChatError> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sessions SET user_id = NULL WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub fn touch_session(&self, session_id: &str, remote_addr: &str) -> Result<(), ChatError> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sessions SET last_active_at = ?1, remote_addr = ?2 WHERE session_id = ?3",
                params![now(), remote_addr, session_id],
            )
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])
            .map_err(ChatError::from)?;
        Ok(())
    }

    /// Sessions whose `last_active_at` is older than `idle_timeout_sec`. The caller (C4's
    /// sweeper) deletes them via `delete_session`, which cascades to `nonces`.
    pub fn idle_sessions(&self, idle_timeout_sec: u64) -> Result<Vec<String>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(idle_timeout_sec as i64))
            .to_rfc3339();
        let mut stmt = conn
            .prepare("SELECT session_id FROM sessions WHERE last_active_at < ?1")
            .map_err(ChatError::from)?;
        let rows = stmt
            .query_map(params![cutoff], |r| r.get(0))
            .map_err(ChatError::from)?;
        rows.collect::<Result<Vec<String>, _>>().map_err(ChatError::from)
    }

    /// Insert `(session_id, nonce)`. Returns `Ok(false)` if the pair already existed (replay),
    /// `Ok(true)` on first insertion — a unique-constraint insert, race-free across workers.
    pub fn insert_nonce(&self, session_id: i64, nonce_hex: &str) -> Result<bool, ChatError> {
        let conn = self.conn.lock().unwrap();
        match conn.execute(
            "INSERT INTO nonces (session_id, nonce) VALUES (?1, ?2)",
            params![session_id, nonce_hex],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(ChatError::from(e)),
        }
    }

    // ─── Rooms & members ───

    pub fn create_room(
        &self,
        room_id: &str,
        name: &str,
        is_private: bool,
        creator_user_id: i64,
    ) -> Result<Room, ChatError> {
        let mut conn = self.conn.lock().unwrap();
        let now = now();
        let tx = conn.transaction().map_err(ChatError::from)?;
        tx.execute(
            "INSERT INTO rooms (room_id, name, is_private, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![room_id, name, is_private as i64, now],
        )
        .map_err(ChatError::from)?;
        let room_pk = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO members (room_id, user_id, is_admin, joined_at) VALUES (?1, ?2, 1, ?3)",
            params![room_pk, creator_user_id, now],
        )
        .map_err(ChatError::from)?;
        tx.commit().map_err(ChatError::from)?;
        Ok(Room {
            id: room_pk,
            room_id: room_id.to_string(),
            name: name.to_string(),
            is_private,
            created_at: now,
        })
    }

    pub fn find_room_by_room_id(&self, room_id: &str) -> Result<Option<Room>, ChatError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, room_id, name, is_private, created_at FROM rooms WHERE room_id = ?1",
            params![room_id],
            Self::row_to_room,
        )
        .optional()
        .map_err(ChatError::from)
    }

    pub fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, room_id, name, is_private, created_at FROM rooms ORDER BY name")
            .map_err(ChatError::from)?;
        let rows = stmt
            .query_map([], Self::row_to_room)
            .map_err(ChatError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ChatError::from)
    }

    fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
        Ok(Room {
            id: row.get(0)?,
            room_id: row.get(1)?,
            name: row.get(2)?,
            is_private: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
        })
    }

    /// Idempotent join: `INSERT OR IGNORE` so re-joining is a no-op.
    pub fn join_room(&self, room_pk: i64, user_id: i64, is_admin: bool) -> Result<(), ChatError> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR IGNORE INTO members (room_id, user_id, is_admin, joined_at) VALUES (?1, ?2, ?3, ?4)",
                params![room_pk, user_id, is_admin as i64, now()],
            )
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub fn is_member(&self, room_pk: i64, user_id: i64) -> Result<bool, ChatError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM members WHERE room_id = ?1 AND user_id = ?2",
                params![room_pk, user_id],
                |r| r.get(0),
            )
            .map_err(ChatError::from)?;
        Ok(count > 0)
    }

    pub fn leave_room(&self, room_pk: i64, user_id: i64) -> Result<bool, ChatError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(ChatError::from)?;
        let was_admin: Option<i64> = tx
            .query_row(
                "SELECT is_admin FROM members WHERE room_id = ?1 AND user_id = ?2",
                params![room_pk, user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(ChatError::from)?;
        let Some(was_admin) = was_admin else {
            tx.commit().map_err(ChatError::from)?;
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM members WHERE room_id = ?1 AND user_id = ?2",
            params![room_pk, user_id],
        )
        .map_err(ChatError::from)?;

        if was_admin != 0 {
            // Transfer admin to the next-joined remaining member, if any.
            let next: Option<i64> = tx
                .query_row(
                    "SELECT user_id FROM members WHERE room_id = ?1 ORDER BY joined_at ASC LIMIT 1",
                    params![room_pk],
                    |r| r.get(0),
                )
                .optional()
                .map_err(ChatError::from)?;
            if let Some(next_user) = next {
                tx.execute(
                    "UPDATE members SET is_admin = 1 WHERE room_id = ?1 AND user_id = ?2",
                    params![room_pk, next_user],
                )
                .map_err(ChatError::from)?;
            }
        }
        tx.commit().map_err(ChatError::from)?;
        Ok(true)
    }

    pub fn list_members(&self, room_pk: i64) -> Result<Vec<Member>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT room_id, user_id, is_admin, joined_at FROM members
                 WHERE room_id = ?1 ORDER BY joined_at ASC",
            )
            .map_err(ChatError::from)?;
        let rows = stmt
            .query_map(params![room_pk], |r| {
                Ok(Member {
                    room_id: r.get(0)?,
                    user_id: r.get(1)?,
                    is_admin: r.get::<_, i64>(2)? != 0,
                    joined_at: r.get(3)?,
                })
            })
            .map_err(ChatError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ChatError::from)
    }

    // ─── Messages ───

    pub fn append_message(
        &self,
        room_pk: i64,
        user_id: i64,
        content: &str,
        is_announcement: bool,
    ) -> Result<Message, ChatError> {
        let conn = self.conn.lock().unwrap();
        let now = now();
        conn.execute(
            "INSERT INTO messages (room_id, user_id, content, is_announcement, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_pk, user_id, content, is_announcement as i64, now],
        )
        .map_err(ChatError::from)?;
        let id = conn.last_insert_rowid();
        Ok(Message {
            id,
            room_id: room_pk,
            user_id,
            content: content.to_string(),
            is_announcement,
            created_at: now,
        })
    }

    /// Ascending `(created_at, id)` order, the total order the spec requires for history.
    pub fn list_messages(&self, room_pk: i64, limit: i64) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, room_id, user_id, content, is_announcement, created_at
                 FROM messages WHERE room_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
            )
            .map_err(ChatError::from)?;
        let rows = stmt
            .query_map(params![room_pk, limit], Self::row_to_message)
            .map_err(ChatError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ChatError::from)
    }

    /// Most recent `n` messages, ascending, for AI prompt composition.
    pub fn recent_messages(&self, room_pk: i64, n: i64) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, room_id, user_id, content, is_announcement, created_at FROM (
                    SELECT id, room_id, user_id, content, is_announcement, created_at
                    FROM messages WHERE room_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2
                 ) ORDER BY created_at ASC, id ASC",
            )
            .map_err(ChatError::from)?;
        let rows = stmt
            .query_map(params![room_pk, n], Self::row_to_message)
            .map_err(ChatError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ChatError::from)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            id: row.get(0)?,
            room_id: row.get(1)?,
            user_id: row.get(2)?,
            content: row.get(3)?,
            is_announcement: row.get::<_, i64>(4)? != 0,
            created_at: row.get(5)?,
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_serialization_omits_secret_and_internal_fields() {
        let repo = Repository::open_in_memory().unwrap();
        let user = repo
            .create_user("u1", "a@x.com", Some("Alice"), Some("argon2$hash"))
            .unwrap();
        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("password_hash").is_none());
        assert!(value.get("id").is_none());
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["email"], "a@x.com");
    }

    #[test]
    fn test_user_email_uniqueness() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_user("u1", "a@x.com", None, None).unwrap();
        let err = repo.create_user("u2", "A@X.COM", None, None).unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[test]
    fn test_session_key_uniqueness() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_session("s1", "deadbeef", "1.1.1.1:1").unwrap();
        let err = repo
            .create_session("s2", "deadbeef", "2.2.2.2:2")
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[test]
    fn test_nonce_insert_once() {
        let repo = Repository::open_in_memory().unwrap();
        let session = repo.create_session("s1", "key", "addr").unwrap();
        assert!(repo.insert_nonce(session.id, "aaaa").unwrap());
        assert!(!repo.insert_nonce(session.id, "aaaa").unwrap());
    }

    #[test]
    fn test_room_creation_makes_admin() {
        let repo = Repository::open_in_memory().unwrap();
        let user = repo.create_user("u1", "a@x.com", None, None).unwrap();
        let room = repo.create_room("r1", "general", false, user.id).unwrap();
        let members = repo.list_members(room.id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_admin);
    }

    #[test]
    fn test_room_name_unique() {
        let repo = Repository::open_in_memory().unwrap();
        let user = repo.create_user("u1", "a@x.com", None, None).unwrap();
        repo.create_room("r1", "general", false, user.id).unwrap();
        let err = repo.create_room("r2", "general", false, user.id).unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[test]
    fn test_idempotent_join() {
        let repo = Repository::open_in_memory().unwrap();
        let creator = repo.create_user("u1", "a@x.com", None, None).unwrap();
        let joiner = repo.create_user("u2", "b@x.com", None, None).unwrap();
        let room = repo.create_room("r1", "general", false, creator.id).unwrap();

        repo.join_room(room.id, joiner.id, false).unwrap();
        repo.join_room(room.id, joiner.id, false).unwrap();
        assert_eq!(repo.list_members(room.id).unwrap().len(), 2);
    }

    #[test]
    fn test_admin_transfer_on_leave() {
        let repo = Repository::open_in_memory().unwrap();
        let creator = repo.create_user("u1", "a@x.com", None, None).unwrap();
        let other = repo.create_user("u2", "b@x.com", None, None).unwrap();
        let room = repo.create_room("r1", "general", false, creator.id).unwrap();
        repo.join_room(room.id, other.id, false).unwrap();

        assert!(repo.leave_room(room.id, creator.id).unwrap());
        let members = repo.list_members(room.id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_admin);
    }

    #[test]
    fn test_leave_not_member_returns_false() {
        let repo = Repository::open_in_memory().unwrap();
        let creator = repo.create_user("u1", "a@x.com", None, None).unwrap();
        let other = repo.create_user("u2", "b@x.com", None, None).unwrap();
        let room = repo.create_room("r1", "general", false, creator.id).unwrap();
        assert!(!repo.leave_room(room.id, other.id).unwrap());
    }

    #[test]
    fn test_message_ordering() {
        let repo = Repository::open_in_memory().unwrap();
        let user = repo.create_user("u1", "a@x.com", None, None).unwrap();
        let room = repo.create_room("r1", "general", false, user.id).unwrap();
        repo.append_message(room.id, user.id, "first", false).unwrap();
        repo.append_message(room.id, user.id, "second", false).unwrap();

        let msgs = repo.list_messages(room.id, 100).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[1].content, "second");
    }
}
