//! Persistence gateway.
//!
//! Handlers talk to storage through [`ChatStore`]; [`SqliteStore`] is the
//! production implementation.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::constants::MessageKind;
use crate::server::GroupEntry;
use crate::{Error, Result};

/// Outcome of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginCheck {
    Valid,
    WrongPassword,
    UnknownAccount,
}

/// A registration request.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender: String,
    /// Username for private messages, group name for group messages, empty for global.
    pub receiver: String,
    pub content: String,
    pub kind: MessageKind,
    /// Epoch milliseconds, strictly increasing across the store.
    pub timestamp: i64,
}

/// Which messages a history query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    /// Both directions between two users.
    Private { user: String, partner: String },
    Group(String),
    Global,
}

/// Metadata for a file that reached storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub sender: String,
    /// Receiving user, or the group name when `is_group` is set.
    pub receiver: String,
    pub is_group: bool,
    pub file_name: String,
    pub file_size: u64,
    pub storage_path: String,
    pub timestamp: i64,
}

/// Storage operations used by the server.
///
/// Implementations must be safe to call from many connection tasks at once.
pub trait ChatStore: Send + Sync {
    fn check_login(&self, username: &str, password: &str) -> Result<LoginCheck>;
    fn user_exists(&self, username: &str) -> Result<bool>;
    /// Fails with [`Error::Duplicate`] if the username is taken.
    fn register_user(&self, user: &NewUser) -> Result<()>;

    /// Persist a message and return it with its assigned id and timestamp.
    fn save_message(
        &self,
        sender: &str,
        receiver: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<StoredMessage>;
    /// Newest `limit` messages, oldest first.
    fn recent_messages(&self, conversation: &Conversation, limit: u32)
    -> Result<Vec<StoredMessage>>;
    /// Newest `limit` messages strictly older than `before`, oldest first.
    fn messages_before(
        &self,
        conversation: &Conversation,
        before: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>>;
    /// Delete every private message between two users, returning the count.
    fn delete_private_history(&self, user: &str, partner: &str) -> Result<u64>;

    fn save_file(&self, record: &FileRecord) -> Result<()>;
    fn file(&self, id: &str) -> Result<Option<FileRecord>>;

    /// Create a group with `creator` as its first member.
    fn create_group(&self, name: &str, creator: &str) -> Result<()>;
    fn group_exists(&self, name: &str) -> Result<bool>;
    fn group_creator(&self, name: &str) -> Result<Option<String>>;
    fn set_group_creator(&self, name: &str, creator: &str) -> Result<()>;
    /// Delete a group together with its membership rows.
    fn delete_group(&self, name: &str) -> Result<()>;
    /// Returns false if the user was already a member.
    fn add_member(&self, group: &str, username: &str) -> Result<bool>;
    /// Returns false if the user was not a member.
    fn remove_member(&self, group: &str, username: &str) -> Result<bool>;
    fn is_member(&self, group: &str, username: &str) -> Result<bool>;
    /// Members in the order they joined.
    fn group_members(&self, group: &str) -> Result<Vec<String>>;
    /// Groups the user belongs to, with their full member lists.
    fn user_groups(&self, username: &str) -> Result<Vec<GroupEntry>>;
}

/// Hash stored in place of the plaintext password.
pub fn password_hash(username: &str, password: &str) -> String {
    let input = format!("{}{}", username, password);
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        username TEXT PRIMARY KEY,
        password TEXT NOT NULL,
        full_name TEXT,
        email TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender TEXT NOT NULL,
        receiver TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS groups (
        name TEXT PRIMARY KEY,
        creator TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS group_members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_name TEXT NOT NULL,
        username TEXT NOT NULL,
        joined_at INTEGER NOT NULL,
        UNIQUE(group_name, username)
    );

    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        sender TEXT NOT NULL,
        receiver TEXT NOT NULL,
        is_group INTEGER NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        storage_path TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_kind_ts ON messages(kind, timestamp);
    CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, receiver);
    CREATE INDEX IF NOT EXISTS idx_members_user ON group_members(username);
";

/// SQLite-backed [`ChatStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    last_timestamp: Mutex<i64>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path.as_ref())?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(timestamp), 0) FROM messages",
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            last_timestamp: Mutex::new(last),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Unavailable("storage lock poisoned".into()))
    }

    /// Wall-clock millis, bumped past the last issued value when the clock stalls.
    fn next_timestamp(&self) -> Result<i64> {
        let mut last = self
            .last_timestamp
            .lock()
            .map_err(|_| Error::Unavailable("storage lock poisoned".into()))?;
        let ts = now_millis().max(*last + 1);
        *last = ts;
        Ok(ts)
    }

    fn query_messages(
        &self,
        conversation: &Conversation,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let before = before.unwrap_or(i64::MAX);
        let mut messages = match conversation {
            Conversation::Private { user, partner } => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, sender, receiver, content, kind, timestamp FROM messages
                     WHERE kind = 'private'
                       AND ((sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1))
                       AND timestamp < ?3
                     ORDER BY timestamp DESC, id DESC LIMIT ?4",
                )?;
                stmt.query_map(params![user, partner, before, limit], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Conversation::Group(group) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, sender, receiver, content, kind, timestamp FROM messages
                     WHERE kind = 'group' AND receiver = ?1 AND timestamp < ?2
                     ORDER BY timestamp DESC, id DESC LIMIT ?3",
                )?;
                stmt.query_map(params![group, before, limit], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Conversation::Global => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, sender, receiver, content, kind, timestamp FROM messages
                     WHERE kind = 'global' AND timestamp < ?1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                stmt.query_map(params![before, limit], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let kind: String = row.get(4)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        content: row.get(3)?,
        kind: MessageKind::parse(&kind).unwrap_or(MessageKind::Private),
        timestamp: row.get(5)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let size: i64 = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        is_group: row.get(3)?,
        file_name: row.get(4)?,
        file_size: size.max(0) as u64,
        storage_path: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

impl ChatStore for SqliteStore {
    fn check_login(&self, username: &str, password: &str) -> Result<LoginCheck> {
        let conn = self.conn()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT password FROM users WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match stored {
            None => LoginCheck::UnknownAccount,
            Some(hash) if hash == password_hash(username, password) => LoginCheck::Valid,
            Some(_) => LoginCheck::WrongPassword,
        })
    }

    fn user_exists(&self, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?",
                params![username],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn register_user(&self, user: &NewUser) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password, full_name, email, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                user.username,
                password_hash(&user.username, &user.password),
                user.full_name,
                user.email,
                now_millis(),
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Duplicate(format!("user {}", user.username)));
        }
        Ok(())
    }

    fn save_message(
        &self,
        sender: &str,
        receiver: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<StoredMessage> {
        let timestamp = self.next_timestamp()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (sender, receiver, content, kind, timestamp)
             VALUES (?, ?, ?, ?, ?)",
            params![sender, receiver, content, kind.as_str(), timestamp],
        )?;
        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
            kind,
            timestamp,
        })
    }

    fn recent_messages(
        &self,
        conversation: &Conversation,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        self.query_messages(conversation, None, limit)
    }

    fn messages_before(
        &self,
        conversation: &Conversation,
        before: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        self.query_messages(conversation, Some(before), limit)
    }

    fn delete_private_history(&self, user: &str, partner: &str) -> Result<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE kind = 'private'
               AND ((sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1))",
            params![user, partner],
        )?;
        Ok(deleted as u64)
    }

    fn save_file(&self, record: &FileRecord) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO files
             (id, sender, receiver, is_group, file_name, file_size, storage_path, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.sender,
                record.receiver,
                record.is_group,
                record.file_name,
                record.file_size as i64,
                record.storage_path,
                record.timestamp,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Duplicate(format!("file {}", record.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn file(&self, id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, sender, receiver, is_group, file_name, file_size, storage_path, timestamp
                 FROM files WHERE id = ?",
                params![id],
                row_to_file,
            )
            .optional()?)
    }

    fn create_group(&self, name: &str, creator: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO groups (name, creator, created_at) VALUES (?, ?, ?)",
            params![name, creator, now],
        )?;
        if inserted == 0 {
            return Err(Error::Duplicate(format!("group {}", name)));
        }
        tx.execute(
            "INSERT OR IGNORE INTO group_members (group_name, username, joined_at) VALUES (?, ?, ?)",
            params![name, creator, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn group_exists(&self, name: &str) -> Result<bool> {
        Ok(self.group_creator(name)?.is_some())
    }

    fn group_creator(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT creator FROM groups WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_group_creator(&self, name: &str, creator: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE groups SET creator = ? WHERE name = ?",
            params![creator, name],
        )?;
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_members WHERE group_name = ?", params![name])?;
        tx.execute("DELETE FROM groups WHERE name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn add_member(&self, group: &str, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO group_members (group_name, username, joined_at) VALUES (?, ?, ?)",
            params![group, username, now_millis()],
        )?;
        Ok(inserted > 0)
    }

    fn remove_member(&self, group: &str, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM group_members WHERE group_name = ? AND username = ?",
            params![group, username],
        )?;
        Ok(deleted > 0)
    }

    fn is_member(&self, group: &str, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM group_members WHERE group_name = ? AND username = ?",
                params![group, username],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn group_members(&self, group: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT username FROM group_members WHERE group_name = ? ORDER BY joined_at, id",
        )?;
        let members = stmt
            .query_map(params![group], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(members)
    }

    fn user_groups(&self, username: &str) -> Result<Vec<GroupEntry>> {
        let groups: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(
                "SELECT g.name, g.creator FROM groups g
                 JOIN group_members m ON m.group_name = g.name
                 WHERE m.username = ?
                 ORDER BY g.name",
            )?;
            stmt.query_map(params![username], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut entries = Vec::with_capacity(groups.len());
        for (name, creator) in groups {
            let members = self.group_members(&name)?;
            entries.push(GroupEntry {
                name,
                creator,
                members,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users(names: &[&str]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for name in names {
            store
                .register_user(&NewUser {
                    username: name.to_string(),
                    password: "pw".into(),
                    ..Default::default()
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn test_login_check() {
        let store = store_with_users(&["alice"]);
        assert_eq!(store.check_login("alice", "pw").unwrap(), LoginCheck::Valid);
        assert_eq!(
            store.check_login("alice", "nope").unwrap(),
            LoginCheck::WrongPassword
        );
        assert_eq!(
            store.check_login("mallory", "pw").unwrap(),
            LoginCheck::UnknownAccount
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let store = store_with_users(&["alice"]);
        let again = store.register_user(&NewUser {
            username: "alice".into(),
            password: "other".into(),
            ..Default::default()
        });
        assert!(matches!(again, Err(Error::Duplicate(_))));
        assert_eq!(store.check_login("alice", "pw").unwrap(), LoginCheck::Valid);
    }

    #[test]
    fn test_password_is_not_stored_in_clear() {
        assert_ne!(password_hash("alice", "pw"), "pw");
        assert_eq!(password_hash("alice", "pw").len(), 32);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let store = store_with_users(&["alice", "bob"]);
        let mut last = 0;
        for i in 0..50 {
            let msg = store
                .save_message("alice", "bob", &format!("m{}", i), MessageKind::Private)
                .unwrap();
            assert!(msg.timestamp > last);
            last = msg.timestamp;
        }
    }

    #[test]
    fn test_history_pages_do_not_overlap() {
        let store = store_with_users(&["alice", "bob"]);
        for i in 0..30 {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            store
                .save_message(from, to, &format!("m{}", i), MessageKind::Private)
                .unwrap();
        }
        store
            .save_message("alice", "carol", "elsewhere", MessageKind::Private)
            .unwrap();

        let conv = Conversation::Private {
            user: "alice".into(),
            partner: "bob".into(),
        };
        let recent = store.recent_messages(&conv, 20).unwrap();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.first().unwrap().content, "m10");
        assert_eq!(recent.last().unwrap().content, "m29");

        let watermark = recent.first().unwrap().timestamp;
        let older = store.messages_before(&conv, watermark, 10).unwrap();
        assert_eq!(older.len(), 10);
        assert_eq!(older.first().unwrap().content, "m0");
        assert_eq!(older.last().unwrap().content, "m9");
        assert!(older.iter().all(|m| m.timestamp < watermark));

        let none = store
            .messages_before(&conv, older.first().unwrap().timestamp, 10)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_delete_private_history_only_touches_the_pair() {
        let store = store_with_users(&["alice", "bob", "carol"]);
        store.save_message("alice", "bob", "a", MessageKind::Private).unwrap();
        store.save_message("bob", "alice", "b", MessageKind::Private).unwrap();
        store.save_message("alice", "carol", "c", MessageKind::Private).unwrap();
        store.save_message("alice", "", "g", MessageKind::Global).unwrap();

        assert_eq!(store.delete_private_history("alice", "bob").unwrap(), 2);
        let carol = Conversation::Private {
            user: "alice".into(),
            partner: "carol".into(),
        };
        assert_eq!(store.recent_messages(&carol, 10).unwrap().len(), 1);
        assert_eq!(store.recent_messages(&Conversation::Global, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_group_lifecycle() {
        let store = store_with_users(&["alice", "bob"]);
        store.create_group("team", "alice").unwrap();
        assert!(matches!(
            store.create_group("team", "bob"),
            Err(Error::Duplicate(_))
        ));
        assert!(store.is_member("team", "alice").unwrap());

        assert!(store.add_member("team", "bob").unwrap());
        assert!(!store.add_member("team", "bob").unwrap());
        assert_eq!(store.group_members("team").unwrap(), vec!["alice", "bob"]);

        let groups = store.user_groups("bob").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].creator, "alice");
        assert_eq!(groups[0].members, vec!["alice", "bob"]);

        store.set_group_creator("team", "bob").unwrap();
        assert_eq!(store.group_creator("team").unwrap().as_deref(), Some("bob"));

        assert!(store.remove_member("team", "alice").unwrap());
        assert!(!store.remove_member("team", "alice").unwrap());

        store.delete_group("team").unwrap();
        assert!(!store.group_exists("team").unwrap());
        assert!(store.group_members("team").unwrap().is_empty());
    }

    #[test]
    fn test_file_records() {
        let store = store_with_users(&["alice", "bob"]);
        let record = FileRecord {
            id: "t1".into(),
            sender: "alice".into(),
            receiver: "bob".into(),
            is_group: false,
            file_name: "report.pdf".into(),
            file_size: 10_000,
            storage_path: "/tmp/x".into(),
            timestamp: 1,
        };
        store.save_file(&record).unwrap();
        assert_eq!(store.file("t1").unwrap(), Some(record));
        assert_eq!(store.file("missing").unwrap(), None);
    }

    #[test]
    fn test_file_ids_are_never_reused() {
        let store = store_with_users(&["alice", "bob", "carol"]);
        let original = FileRecord {
            id: "t1".into(),
            sender: "alice".into(),
            receiver: "bob".into(),
            is_group: false,
            file_name: "report.pdf".into(),
            file_size: 5,
            storage_path: "/tmp/a".into(),
            timestamp: 1,
        };
        store.save_file(&original).unwrap();

        let other = FileRecord {
            sender: "carol".into(),
            receiver: "carol".into(),
            file_name: "evil.txt".into(),
            storage_path: "/tmp/b".into(),
            timestamp: 2,
            ..original.clone()
        };
        assert!(matches!(store.save_file(&other), Err(Error::Duplicate(_))));
        assert_eq!(store.file("t1").unwrap(), Some(original));
    }

    #[test]
    fn test_timestamps_resume_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.db");
        let first_ts = {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_message("alice", "", "hello", MessageKind::Global)
                .unwrap()
                .timestamp
        };
        let store = SqliteStore::open(&path).unwrap();
        let next = store
            .save_message("alice", "", "again", MessageKind::Global)
            .unwrap();
        assert!(next.timestamp > first_ts);
    }
}
