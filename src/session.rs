//! Persisted session state.
//!
//! A handful of string key/value pairs (auth token, user identity) kept in a
//! small SQLite file so a session survives restarts. Read once at startup;
//! cleared entirely on logout.

use color_eyre::Result;
use rusqlite::{params, Connection};

const KEY_AUTH_TOKEN: &str = "auth_token";
const KEY_USER_ID: &str = "user_id";
const KEY_USERNAME: &str = "username";
const KEY_EMAIL: &str = "email";
const KEY_AUTHENTICATED: &str = "authenticated";

/// The restored session as read at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub authenticated: bool,
}

pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Opens (or creates) the session database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Restores the session persisted by a previous run.
    pub fn load(&self) -> Result<Session> {
        Ok(Session {
            auth_token: self.get(KEY_AUTH_TOKEN)?,
            user_id: self.get(KEY_USER_ID)?,
            username: self.get(KEY_USERNAME)?,
            email: self.get(KEY_EMAIL)?,
            authenticated: self.get(KEY_AUTHENTICATED)?.as_deref() == Some("true"),
        })
    }

    /// Persists a logged-in session.
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(v) = &session.auth_token {
            self.set(KEY_AUTH_TOKEN, v)?;
        }
        if let Some(v) = &session.user_id {
            self.set(KEY_USER_ID, v)?;
        }
        if let Some(v) = &session.username {
            self.set(KEY_USERNAME, v)?;
        }
        if let Some(v) = &session.email {
            self.set(KEY_EMAIL, v)?;
        }
        self.set(
            KEY_AUTHENTICATED,
            if session.authenticated { "true" } else { "false" },
        )?;
        Ok(())
    }

    /// Logout: removes every persisted key.
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            auth_token: Some("tok_abc".into()),
            user_id: Some("u_1".into()),
            username: Some("asha".into()),
            email: Some("asha@example.com".into()),
            authenticated: true,
        }
    }

    #[test]
    fn round_trips_a_session() {
        let store = SessionStore::open_in_memory().unwrap();
        store.save(&session()).unwrap();
        assert_eq!(store.load().unwrap(), session());
    }

    #[test]
    fn empty_store_loads_default() {
        let store = SessionStore::open_in_memory().unwrap();
        let s = store.load().unwrap();
        assert_eq!(s, Session::default());
        assert!(!s.authenticated);
    }

    #[test]
    fn clear_removes_everything() {
        let store = SessionStore::open_in_memory().unwrap();
        store.save(&session()).unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), Session::default());
    }
}
