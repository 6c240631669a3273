//! SQLite record of warn+ events, tagged with the relay connection that
//! produced them.
//!
//! Each row carries `session_code`, `role` and `connection_id`, taken from
//! the event itself or, failing that, from the innermost enclosing span that
//! names them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS warnings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        session_code TEXT,
        role TEXT,
        connection_id TEXT,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warnings_session ON warnings(session_code, id);";

/// Which relay connection an event belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RelayContext {
    session_code: Option<String>,
    role: Option<String>,
    connection_id: Option<String>,
}

impl RelayContext {
    fn is_empty(&self) -> bool {
        self.session_code.is_none() && self.role.is_none() && self.connection_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.session_code.is_some() && self.role.is_some() && self.connection_id.is_some()
    }

    /// Fill whatever is still missing from an enclosing span's context.
    fn inherit(&mut self, outer: &RelayContext) {
        for (slot, value) in [
            (&mut self.session_code, &outer.session_code),
            (&mut self.role, &outer.role),
            (&mut self.connection_id, &outer.connection_id),
        ] {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
    }

    /// Returns `false` when `name` is not an identity field.
    fn capture(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "session_code" => &mut self.session_code,
            "role" => &mut self.role,
            "connection_id" => &mut self.connection_id,
            _ => return false,
        };
        *slot = Some(value.to_owned());
        true
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    context: RelayContext,
    extra: Map<String, Value>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_owned());
        } else if !self.context.capture(field.name(), value) {
            self.extra.insert(field.name().to_owned(), Value::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_str(field, &format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.extra.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.extra.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_owned(), Value::from(value));
    }
}

/// Append-only SQLite table of warn+ events.
pub struct WarnLogSink {
    conn: Mutex<Connection>,
}

impl WarnLogSink {
    /// Open (or create) the log database, creating its directory.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Failures are dropped: there is nowhere left to report them.
    fn append(&self, level: Level, target: &str, fields: EventFields) {
        let extra = (!fields.extra.is_empty()).then(|| Value::Object(fields.extra).to_string());
        let context = fields.context;
        let _ = self.conn.lock().execute(
            "INSERT INTO warnings
                (logged_at, level, target, message, session_code, role, connection_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                level.as_str(),
                target,
                fields.message.unwrap_or_default(),
                context.session_code,
                context.role,
                context.connection_id,
                extra,
            ],
        );
    }
}

/// tracing layer feeding [`WarnLogSink`].
pub struct WarnLogLayer {
    sink: Arc<WarnLogSink>,
}

impl WarnLogLayer {
    pub fn new(sink: Arc<WarnLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for WarnLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.context);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.context.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<RelayContext>() {
                    fields.context.inherit(outer);
                }
            }
        }

        self.sink.append(level, event.metadata().target(), fields);
    }
}
