use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use relay_core::events::Event;
use relay_core::ids::SessionId;
use relay_core::state::{materialize, merge_into, split_scopes, strip_temp, StateMap};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::session::{apply_event, GetSessionConfig, Session, SessionService};

/// Session storage backed by a SQLite file.
///
/// Appends are rejected with [`StoreError::Conflict`] when the stored session
/// changed after the caller's copy was loaded.
#[derive(Clone)]
pub struct SqliteSessionService {
    db: Database,
}

impl SqliteSessionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    /// Runs blocking database work off the async worker threads.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

fn load_app_state(conn: &Connection, app_name: &str) -> Result<StateMap, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            [app_name],
            |row| row.get(0),
        )
        .optional()?;
    raw.map_or_else(
        || Ok(StateMap::new()),
        |raw| row_helpers::parse_state(&raw, "app_states", "state"),
    )
}

fn load_user_state(conn: &Connection, app_name: &str, user_id: &str) -> Result<StateMap, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            [app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map_or_else(
        || Ok(StateMap::new()),
        |raw| row_helpers::parse_state(&raw, "user_states", "state"),
    )
}

fn merge_shared_state(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    app: &StateMap,
    user: &StateMap,
    now: f64,
) -> Result<(), StoreError> {
    if !app.is_empty() {
        let mut state = load_app_state(conn, app_name)?;
        merge_into(&mut state, app);
        conn.execute(
            "INSERT INTO app_states (app_name, state, update_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(app_name) DO UPDATE SET state = excluded.state, update_time = excluded.update_time",
            params![app_name, serde_json::to_string(&state)?, now],
        )?;
    }
    if !user.is_empty() {
        let mut state = load_user_state(conn, app_name, user_id)?;
        merge_into(&mut state, user);
        conn.execute(
            "INSERT INTO user_states (app_name, user_id, state, update_time) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_name, user_id) DO UPDATE SET state = excluded.state, update_time = excluded.update_time",
            params![app_name, user_id, serde_json::to_string(&state)?, now],
        )?;
    }
    Ok(())
}

/// Reads the stored session row: session-scoped state and last update time.
fn load_session_row(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_id: &str,
) -> Result<Option<(StateMap, f64)>, StoreError> {
    let row: Option<(String, f64)> = conn
        .query_row(
            "SELECT state, update_time FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            [app_name, user_id, session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((raw, update_time)) => Ok(Some((
            row_helpers::parse_state(&raw, "sessions", "state")?,
            update_time,
        ))),
        None => Ok(None),
    }
}

fn load_events(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_id: &str,
    config: Option<&GetSessionConfig>,
) -> Result<Vec<Event>, StoreError> {
    let after = config.and_then(|c| c.after_timestamp);
    // SQLite treats a negative LIMIT as unbounded.
    let limit = config
        .and_then(|c| c.num_recent_events)
        .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

    let mut stmt = conn.prepare(
        "SELECT payload FROM events
         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
           AND (?4 IS NULL OR timestamp > ?4)
         ORDER BY sequence DESC
         LIMIT ?5",
    )?;
    let mut rows = stmt.query(params![app_name, user_id, session_id, after, limit])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row_helpers::get(row, 0, "events", "payload")?;
        events.push(row_helpers::parse_json::<Event>(&raw, "events", "payload")?);
    }
    events.reverse();
    Ok(events)
}

enum AppendOutcome {
    /// Carries the session's new update time.
    Stored(f64),
    UnknownSession,
}

#[async_trait]
impl SessionService for SqliteSessionService {
    #[instrument(skip(self, state))]
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<SessionId>,
    ) -> Result<Session, StoreError> {
        let mut session = Session::new(app_name, user_id, session_id.unwrap_or_default());
        let scoped = split_scopes(&state.unwrap_or_default());
        session.state = scoped.session.clone();

        let row = session.clone();
        let merged = self
            .blocking(move |db| {
                db.with_tx(|tx| {
                    let exists = load_session_row(tx, &row.app_name, &row.user_id, row.id.as_str())?;
                    if exists.is_some() {
                        return Err(StoreError::AlreadyExists(format!("session {}", row.id)));
                    }
                    merge_shared_state(
                        tx,
                        &row.app_name,
                        &row.user_id,
                        &scoped.app,
                        &scoped.user,
                        row.last_update_time,
                    )?;
                    tx.execute(
                        "INSERT INTO sessions (app_name, user_id, id, state, create_time, update_time)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        params![
                            row.app_name,
                            row.user_id,
                            row.id.as_str(),
                            serde_json::to_string(&row.state)?,
                            row.last_update_time,
                        ],
                    )?;
                    let app = load_app_state(tx, &row.app_name)?;
                    let user = load_user_state(tx, &row.app_name, &row.user_id)?;
                    Ok(materialize(&row.state, &app, &user))
                })
            })
            .await?;

        session.state = merged;
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
        config: Option<&GetSessionConfig>,
    ) -> Result<Option<Session>, StoreError> {
        let (app_name, user_id, id) = (app_name.to_string(), user_id.to_string(), session_id.clone());
        let config = config.cloned();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let Some((state, update_time)) =
                    load_session_row(conn, &app_name, &user_id, id.as_str())?
                else {
                    return Ok(None);
                };
                let events = load_events(conn, &app_name, &user_id, id.as_str(), config.as_ref())?;
                let app = load_app_state(conn, &app_name)?;
                let user = load_user_state(conn, &app_name, &user_id)?;
                Ok(Some(Session {
                    id,
                    state: materialize(&state, &app, &user),
                    events,
                    last_update_time: update_time,
                    app_name,
                    user_id,
                }))
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let (app_name, user_id) = (app_name.to_string(), user_id.to_string());
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let app = load_app_state(conn, &app_name)?;
                let user = load_user_state(conn, &app_name, &user_id)?;
                let mut stmt = conn.prepare(
                    "SELECT id, state, update_time FROM sessions
                     WHERE app_name = ?1 AND user_id = ?2 ORDER BY id",
                )?;
                let mut rows = stmt.query([&app_name, &user_id])?;
                let mut sessions = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row_helpers::get(row, 0, "sessions", "id")?;
                    let raw: String = row_helpers::get(row, 1, "sessions", "state")?;
                    let update_time: f64 = row_helpers::get(row, 2, "sessions", "update_time")?;
                    let state = row_helpers::parse_state(&raw, "sessions", "state")?;
                    sessions.push(Session {
                        id: SessionId::from_raw(id),
                        app_name: app_name.clone(),
                        user_id: user_id.clone(),
                        state: materialize(&state, &app, &user),
                        events: Vec::new(),
                        last_update_time: update_time,
                    });
                }
                Ok(sessions)
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
    ) -> Result<(), StoreError> {
        let (app_name, user_id, id) = (app_name.to_string(), user_id.to_string(), session_id.clone());
        let removed = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    Ok(conn.execute(
                        "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                        [app_name.as_str(), user_id.as_str(), id.as_str()],
                    )?)
                })
            })
            .await?;
        debug!(existed = removed > 0, "session deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session.id, event_id = %event.id, author = %event.author))]
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event, StoreError> {
        if event.partial {
            return Ok(event);
        }

        let mut stored = event.clone();
        stored.actions.state_delta = strip_temp(&event.actions.state_delta);
        let (app_name, user_id, id) = (
            session.app_name.clone(),
            session.user_id.clone(),
            session.id.clone(),
        );
        let seen_update_time = session.last_update_time;
        let row = stored.clone();

        let outcome = self
            .blocking(move |db| {
                db.with_tx(|tx| {
                    let Some((mut state, update_time)) =
                        load_session_row(tx, &app_name, &user_id, id.as_str())?
                    else {
                        return Ok(AppendOutcome::UnknownSession);
                    };
                    if update_time > seen_update_time {
                        return Err(StoreError::Conflict(format!(
                            "session {id} was modified at {update_time}, caller loaded it at {seen_update_time}"
                        )));
                    }

                    let scoped = split_scopes(&row.actions.state_delta);
                    merge_shared_state(tx, &app_name, &user_id, &scoped.app, &scoped.user, row.timestamp)?;
                    merge_into(&mut state, &scoped.session);
                    // Never move the stored clock backwards.
                    let new_update_time = row.timestamp.max(update_time);
                    tx.execute(
                        "UPDATE sessions SET state = ?1, update_time = ?2
                         WHERE app_name = ?3 AND user_id = ?4 AND id = ?5",
                        params![
                            serde_json::to_string(&state)?,
                            new_update_time,
                            app_name,
                            user_id,
                            id.as_str()
                        ],
                    )?;
                    tx.execute(
                        "INSERT INTO events
                         (app_name, user_id, session_id, id, sequence, invocation_id, author, timestamp, payload)
                         VALUES (?1, ?2, ?3, ?4,
                           (SELECT COALESCE(MAX(sequence), -1) + 1 FROM events
                            WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3),
                           ?5, ?6, ?7, ?8)",
                        params![
                            app_name,
                            user_id,
                            id.as_str(),
                            row.id.as_str(),
                            row.invocation_id.as_str(),
                            row.author,
                            row.timestamp,
                            serde_json::to_string(&row)?,
                        ],
                    )?;
                    Ok(AppendOutcome::Stored(new_update_time))
                })
            })
            .await?;

        match outcome {
            AppendOutcome::UnknownSession => {
                warn!("append to unknown session, event not persisted");
                Ok(event)
            }
            AppendOutcome::Stored(update_time) => {
                apply_event(session, &event);
                session.last_update_time = update_time;
                Ok(stored)
            }
        }
    }
}
