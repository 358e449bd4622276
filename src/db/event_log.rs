//! Durable event log: `request_state` (latest wins) and `events` (append-only).

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Event, EventKind, LifecycleState, RequestId};
use crate::store::{EventLog, LoggedEvent, Recorded};

/// Serialises appenders so `event_id` commit order equals id order. Without
/// it a reader scanning `event_id > cursor` could pass over a lower id that
/// commits late.
const APPEND_LOCK_KEY: i64 = 0x6661_7273_6565_72;

fn state_label(state: Option<LifecycleState>) -> &'static str {
    state.map(LifecycleState::as_str).unwrap_or("")
}

fn parse_state(label: &str) -> Option<LifecycleState> {
    if label.is_empty() {
        None
    } else {
        label.parse().ok()
    }
}

#[async_trait]
impl EventLog for super::Db {
    async fn record(&self, event: &Event) -> Result<Recorded> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let previous: Option<(String,)> =
            sqlx::query_as("SELECT state FROM request_state WHERE request_uuid = $1 FOR UPDATE")
                .bind(event.request_uuid.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO request_state (request_uuid, state, event, stream_source)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (request_uuid)
             DO UPDATE SET state = EXCLUDED.state, event = EXCLUDED.event",
        )
        .bind(event.request_uuid.as_str())
        .bind(state_label(event.state))
        .bind(event.event.as_str())
        .bind(&event.stream_source)
        .execute(&mut *tx)
        .await?;

        let (event_id,): (i64,) = sqlx::query_as(
            "INSERT INTO events (request_uuid, state, event, stream_source)
             VALUES ($1, $2, $3, $4)
             RETURNING event_id",
        )
        .bind(event.request_uuid.as_str())
        .bind(state_label(event.state))
        .bind(event.event.as_str())
        .bind(&event.stream_source)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Recorded {
            event_id,
            previous: previous.and_then(|(label,)| parse_state(&label)),
        })
    }

    async fn events_since(&self, after: i64, limit: i64) -> Result<Vec<LoggedEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, request_uuid, state, event, stream_source, recorded_at
             FROM events WHERE event_id > $1
             ORDER BY event_id
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LoggedEvent::from).collect())
    }

    async fn latest(&self, request: &RequestId) -> Result<Option<Event>> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT request_uuid, state, event, stream_source
             FROM request_state WHERE request_uuid = $1",
        )
        .bind(request.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(request_uuid, state, event, stream_source)| Event {
            state: parse_state(&state),
            event: EventKind::from(event),
            request_uuid: RequestId::from(request_uuid),
            stream_source,
        }))
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    request_uuid: String,
    state: String,
    event: String,
    stream_source: String,
    recorded_at: chrono::DateTime<chrono::Utc>,
}

impl From<EventRow> for LoggedEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            event: Event {
                state: parse_state(&row.state),
                event: EventKind::from(row.event),
                request_uuid: RequestId::from(row.request_uuid),
                stream_source: row.stream_source,
            },
            recorded_at: row.recorded_at,
        }
    }
}
