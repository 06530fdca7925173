//! Room-scoped fan-out of real-time events to connected clients.
//!
//! Delivery is best effort: events go to whoever is a member at emit time and
//! are never stored or replayed.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEvent {
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("frame is not valid JSON: {0}")]
    BadFrame(String),
    #[error("{event} is missing {field}")]
    MissingField { event: String, field: &'static str },
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("{0} requires an authenticated connection")]
    Unauthenticated(String),
    #[error("client is not connected")]
    UnknownClient,
    #[error("room {0} belongs to another user")]
    PrivateRoom(String),
}

struct Client {
    account_id: Option<String>,
    tx: UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: ClientId,
    clients: HashMap<ClientId, Client>,
    rooms: HashMap<String, BTreeSet<ClientId>>,
}

#[derive(Default)]
pub struct Relay {
    inner: Mutex<Inner>,
}

const USER_ROOM_PREFIX: &str = "user-";

pub fn user_room(account_id: &str) -> String {
    format!("{}{}", USER_ROOM_PREFIX, account_id)
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn stamp(data: Value) -> Value {
    match data {
        Value::Object(mut obj) => {
            obj.insert("timestamp".into(), Value::String(timestamp()));
            Value::Object(obj)
        }
        other => json!({ "payload": other, "timestamp": timestamp() }),
    }
}

fn field_str(data: &Value, event: &str, field: &'static str) -> Result<String, RelayError> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::MissingField {
            event: event.to_string(),
            field,
        })
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a client; authenticated clients also join their user room.
    pub fn connect(&self, account_id: Option<&str>) -> (ClientId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.insert(
            id,
            Client {
                account_id: account_id.map(|s| s.to_string()),
                tx,
            },
        );
        if let Some(account_id) = account_id {
            inner.rooms.entry(user_room(account_id)).or_default().insert(id);
        }
        debug!(client_id = id, authenticated = account_id.is_some(), "relay client connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: ClientId) {
        let mut inner = self.lock();
        inner.clients.remove(&id);
        inner.rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
        debug!(client_id = id, "relay client disconnected");
    }

    /// User rooms can only be joined by their owner.
    pub fn join(&self, id: ClientId, room: &str) -> Result<(), RelayError> {
        let mut inner = self.lock();
        let client = inner.clients.get(&id).ok_or(RelayError::UnknownClient)?;
        if room.starts_with(USER_ROOM_PREFIX)
            && client.account_id.as_deref().map(user_room).as_deref() != Some(room)
        {
            return Err(RelayError::PrivateRoom(room.to_string()));
        }
        inner.rooms.entry(room.to_string()).or_default().insert(id);
        Ok(())
    }

    pub fn leave(&self, id: ClientId, room: &str) {
        let mut inner = self.lock();
        let now_empty = match inner.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.rooms.remove(room);
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    #[cfg(test)]
    pub fn room_size(&self, room: &str) -> usize {
        self.lock().rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    fn send_to(inner: &Inner, ids: impl IntoIterator<Item = ClientId>, event: &ServerEvent) -> usize {
        ids.into_iter()
            .filter_map(|id| inner.clients.get(&id))
            .filter(|c| c.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Returns how many clients the event was handed to.
    pub fn emit_to_room(&self, room: &str, event: &str, data: Value) -> usize {
        let inner = self.lock();
        let Some(members) = inner.rooms.get(room) else {
            return 0;
        };
        let ev = ServerEvent {
            event: event.to_string(),
            data: stamp(data),
        };
        Self::send_to(&inner, members.iter().copied(), &ev)
    }

    pub fn emit_to_user(&self, account_id: &str, event: &str, data: Value) -> usize {
        self.emit_to_room(&user_room(account_id), event, data)
    }

    pub fn emit_to_client(&self, id: ClientId, event: &str, data: Value) -> bool {
        let inner = self.lock();
        let ev = ServerEvent {
            event: event.to_string(),
            data: stamp(data),
        };
        Self::send_to(&inner, [id], &ev) == 1
    }

    /// Sends to every authenticated client. Anonymous sockets are skipped.
    pub fn broadcast(&self, event: &str, data: Value) -> usize {
        let inner = self.lock();
        let ev = ServerEvent {
            event: event.to_string(),
            data: stamp(data),
        };
        let ids = inner
            .clients
            .iter()
            .filter(|(_, c)| c.account_id.is_some())
            .map(|(id, _)| *id);
        Self::send_to(&inner, ids, &ev)
    }

    fn is_authenticated(&self, id: ClientId) -> Result<bool, RelayError> {
        self.lock()
            .clients
            .get(&id)
            .map(|c| c.account_id.is_some())
            .ok_or(RelayError::UnknownClient)
    }

    /// Applies one text frame sent by a client.
    pub fn handle_client_frame(&self, id: ClientId, text: &str) -> Result<(), RelayError> {
        let frame: ClientFrame =
            serde_json::from_str(text).map_err(|e| RelayError::BadFrame(e.to_string()))?;
        let ev = frame.event.as_str();
        let data = &frame.data;
        match ev {
            "join-room" => {
                let room = field_str(data, ev, "room")?;
                self.join(id, &room)?;
                self.emit_to_client(id, "joined-room", json!({ "room": room, "success": true }));
            }
            "leave-room" => {
                let room = field_str(data, ev, "room")?;
                self.leave(id, &room);
                self.emit_to_client(id, "left-room", json!({ "room": room, "success": true }));
            }
            "send-message" => {
                if !self.is_authenticated(id)? {
                    return Err(RelayError::Unauthenticated(ev.to_string()));
                }
                let room = field_str(data, ev, "room")?;
                self.emit_to_room(
                    &room,
                    "new-message",
                    json!({
                        "id": Uuid::new_v4().to_string(),
                        "message": data.get("message").cloned().unwrap_or(Value::Null),
                        "sender": data.get("sender").cloned().unwrap_or(Value::Null),
                    }),
                );
            }
            "send-notification" => {
                if !self.is_authenticated(id)? {
                    return Err(RelayError::Unauthenticated(ev.to_string()));
                }
                let user_id = field_str(data, ev, "userId")?;
                self.emit_to_user(
                    &user_id,
                    "notification",
                    json!({
                        "id": Uuid::new_v4().to_string(),
                        "title": data.get("title").cloned().unwrap_or(Value::Null),
                        "message": data.get("message").cloned().unwrap_or(Value::Null),
                    }),
                );
            }
            "attendance-update" | "real-time-update" => {
                if !self.is_authenticated(id)? {
                    return Err(RelayError::Unauthenticated(ev.to_string()));
                }
                self.broadcast(
                    ev,
                    json!({
                        "type": data.get("type").cloned().unwrap_or(Value::Null),
                        "payload": data.get("payload").cloned().unwrap_or(Value::Null),
                    }),
                );
            }
            other => return Err(RelayError::UnknownEvent(other.to_string())),
        }
        Ok(())
    }
}
