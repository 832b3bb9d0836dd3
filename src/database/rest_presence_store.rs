use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use crate::database::presence_store::{PresenceDelta, PresenceStore, StoreEvent, StoreEventStream};
use crate::error::StoreError;
use crate::models::{PartitionKey, PresencePath, PresenceRecord};

/// Client for a realtime-database style REST API: `PUT`/`DELETE` on
/// `{base}/{path}.json` and an SSE stream on `GET` for subscriptions.
#[derive(Debug, Clone)]
pub struct RestPresenceStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl RestPresenceStore {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            request_timeout: Duration::from_secs(8),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("PRESENCE_REST_URL").ok()?;
        let auth = std::env::var("PRESENCE_REST_AUTH").ok();
        Some(Self::new(&base_url, auth))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.query(&[("auth", token.as_str())]),
            None => req,
        }
    }
}

fn status_error(status: StatusCode) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StoreError::Timeout,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => StoreError::NetworkUnavailable,
        other => StoreError::Backend(format!("upstream status {}", other)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser; chunk boundaries may fall
/// anywhere, including inside a line or a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.partial.extend_from_slice(chunk);
        let complete = match std::str::from_utf8(&self.partial) {
            Ok(_) => self.partial.len(),
            // Cut short mid-character: keep the tail for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial.len(),
        };
        let bytes = self.partial.drain(..complete).collect::<Vec<u8>>();
        self.buffer.push_str(&String::from_utf8_lossy(&bytes));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() {
                if self.event.is_some() || !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        frames
    }
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// Mirror of one partition, kept so that partial `patch` frames can be
/// turned into whole records.
#[derive(Debug)]
pub struct PartitionMirror {
    partition: PartitionKey,
    members: BTreeMap<String, Value>,
}

impl PartitionMirror {
    pub fn new(partition: PartitionKey) -> Self {
        Self {
            partition,
            members: BTreeMap::new(),
        }
    }

    fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        let value = self.members.get(user_id)?;
        match serde_json::from_value::<PresenceRecord>(value.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("📍 Ignoring malformed presence for {}: {}", user_id, e);
                None
            }
        }
    }

    fn removed(&self, user_id: &str) -> StoreEvent {
        StoreEvent::Delta(PresenceDelta::Removed(PresencePath::new(
            self.partition.role,
            self.partition.destination,
            user_id,
        )))
    }

    fn set_member(&mut self, user_id: &str, value: Value) -> Option<StoreEvent> {
        if value.is_null() {
            return self
                .members
                .remove(user_id)
                .map(|_| self.removed(user_id));
        }
        self.members.insert(user_id.to_string(), value);
        self.record(user_id)
            .map(|r| StoreEvent::Delta(PresenceDelta::Upsert(r)))
    }

    fn merge_member(&mut self, user_id: &str, patch: Value) -> Option<StoreEvent> {
        let fields = match patch {
            Value::Object(fields) => fields,
            other => return self.set_member(user_id, other),
        };
        let entry = self
            .members
            .entry(user_id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(existing) = entry {
            for (k, v) in fields {
                if v.is_null() {
                    existing.remove(&k);
                } else {
                    existing.insert(k, v);
                }
            }
        }
        self.record(user_id)
            .map(|r| StoreEvent::Delta(PresenceDelta::Upsert(r)))
    }

    pub fn apply(&mut self, frame: &SseFrame) -> Result<Vec<StoreEvent>, StoreError> {
        match frame.event.as_str() {
            "keep-alive" => Ok(Vec::new()),
            "cancel" | "auth_revoked" => Err(StoreError::PermissionDenied),
            "put" | "patch" => {
                let payload: PathData = serde_json::from_str(&frame.data)
                    .map_err(|e| StoreError::Backend(format!("bad stream payload: {}", e)))?;
                let user_id = payload.path.trim_matches('/').split('/').next().unwrap_or("");
                let is_patch = frame.event == "patch";

                if user_id.is_empty() {
                    let entries = match payload.data {
                        Value::Object(map) => map.into_iter().collect::<Vec<_>>(),
                        _ => Vec::new(),
                    };
                    if !is_patch {
                        self.members = entries.into_iter().filter(|(_, v)| !v.is_null()).collect();
                        let snapshot = self
                            .members
                            .keys()
                            .filter_map(|id| self.record(id))
                            .collect();
                        return Ok(vec![StoreEvent::FullSnapshot(snapshot)]);
                    }
                    return Ok(entries
                        .into_iter()
                        .filter_map(|(id, v)| self.set_member(&id, v))
                        .collect());
                }

                let nested = payload.path.trim_matches('/').contains('/');
                let user_id = user_id.to_string();
                let event = if is_patch || nested {
                    // Field-level write below the member node.
                    let patch = if nested {
                        let field = payload.path.trim_matches('/').splitn(2, '/').nth(1).unwrap_or("");
                        let mut obj = serde_json::Map::new();
                        obj.insert(field.to_string(), payload.data);
                        Value::Object(obj)
                    } else {
                        payload.data
                    };
                    self.merge_member(&user_id, patch)
                } else {
                    self.set_member(&user_id, payload.data)
                };
                Ok(event.into_iter().collect())
            }
            other => {
                debug!("📍 Unhandled stream event '{}'", other);
                Ok(Vec::new())
            }
        }
    }
}

struct StreamState {
    body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    mirror: PartitionMirror,
    queued: VecDeque<Result<StoreEvent, StoreError>>,
    broken: bool,
}

#[async_trait]
impl PresenceStore for RestPresenceStore {
    async fn write(&self, path: &PresencePath, record: &PresenceRecord) -> Result<(), StoreError> {
        let req = self
            .client
            .put(self.url(&path.to_string()))
            .timeout(self.request_timeout)
            .json(record);
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    async fn remove(&self, path: &PresencePath) -> Result<(), StoreError> {
        let req = self
            .client
            .delete(self.url(&path.to_string()))
            .timeout(self.request_timeout);
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    async fn subscribe(&self, partition: PartitionKey) -> Result<StoreEventStream, StoreError> {
        let req = self
            .client
            .get(self.url(&partition.to_string()))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }

        let state = StreamState {
            body: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::default(),
            mirror: PartitionMirror::new(partition),
            queued: VecDeque::new(),
            broken: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.queued.pop_front() {
                    if item.is_err() {
                        state.broken = true;
                        state.queued.clear();
                    }
                    return Some((item, state));
                }
                if state.broken {
                    return None;
                }
                let chunk = match state.body.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        state.broken = true;
                        return Some((Err(StoreError::from(e)), state));
                    }
                    None => return None,
                };
                for frame in state.decoder.push(&chunk) {
                    match state.mirror.apply(&frame) {
                        Ok(events) => state.queued.extend(events.into_iter().map(Ok)),
                        Err(e) => {
                            state.queued.push_back(Err(e));
                            break;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DestinationCategory, GeoPoint, Role};

    fn partition() -> PartitionKey {
        PartitionKey::new(Role::Seeker, DestinationCategory::Town)
    }

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    const RECORD_A: &str = r#"{"user_id":"a","role":"seeker","destination_category":"town","location":{"latitude":1.0,"longitude":2.0},"updated_at":10}"#;

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: pu").is_empty());
        assert!(decoder.push(b"t\ndata: {\"path\":\"/\",").is_empty());
        let frames = decoder.push(b"\"data\":null}\r\n\r\n: comment\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(
            frames,
            vec![
                frame("put", r#"{"path":"/","data":null}"#),
                frame("keep-alive", "null"),
            ]
        );
    }

    #[test]
    fn decoder_keeps_characters_split_across_chunks() {
        let wire = "event: put\ndata: {\"path\":\"/jos\u{e9}\",\"data\":null}\n\n".as_bytes();
        // Split between the two bytes of the accented character.
        let cut = wire.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&wire[..cut]).is_empty());
        let frames = decoder.push(&wire[cut..]);
        assert_eq!(
            frames,
            vec![frame("put", "{\"path\":\"/jos\u{e9}\",\"data\":null}")]
        );

        let mut mirror = PartitionMirror::new(partition());
        let member = RECORD_A.replace(r#""user_id":"a""#, "\"user_id\":\"jos\u{e9}\"");
        mirror
            .apply(&frame(
                "put",
                &format!("{{\"path\":\"/\",\"data\":{{\"jos\u{e9}\":{}}}}}", member),
            ))
            .unwrap();
        let removed = mirror.apply(&frames[0]).unwrap();
        assert_eq!(
            removed,
            vec![StoreEvent::Delta(PresenceDelta::Removed(PresencePath::new(
                Role::Seeker,
                DestinationCategory::Town,
                "jos\u{e9}"
            )))]
        );
    }

    #[test]
    fn root_put_is_snapshot_and_member_put_is_delta() {
        let mut mirror = PartitionMirror::new(partition());
        let snapshot = mirror
            .apply(&frame("put", &format!(r#"{{"path":"/","data":{{"a":{}}}}}"#, RECORD_A)))
            .unwrap();
        match &snapshot[..] {
            [StoreEvent::FullSnapshot(records)] => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].location, GeoPoint::new(1.0, 2.0));
            }
            other => panic!("unexpected {:?}", other),
        }

        let removed = mirror.apply(&frame("put", r#"{"path":"/a","data":null}"#)).unwrap();
        assert_eq!(
            removed,
            vec![StoreEvent::Delta(PresenceDelta::Removed(PresencePath::new(
                Role::Seeker,
                DestinationCategory::Town,
                "a"
            )))]
        );
    }

    #[test]
    fn field_patch_merges_into_member() {
        let mut mirror = PartitionMirror::new(partition());
        mirror
            .apply(&frame("put", &format!(r#"{{"path":"/a","data":{}}}"#, RECORD_A)))
            .unwrap();
        let events = mirror
            .apply(&frame(
                "patch",
                r#"{"path":"/a","data":{"location":{"latitude":3.0,"longitude":4.0},"updated_at":11}}"#,
            ))
            .unwrap();
        match &events[..] {
            [StoreEvent::Delta(PresenceDelta::Upsert(r))] => {
                assert_eq!(r.location, GeoPoint::new(3.0, 4.0));
                assert_eq!(r.updated_at, 11);
            }
            other => panic!("unexpected {:?}", other),
        }

        let events = mirror
            .apply(&frame("put", r#"{"path":"/a/updated_at","data":12}"#))
            .unwrap();
        assert!(matches!(&events[..], [StoreEvent::Delta(PresenceDelta::Upsert(r))] if r.updated_at == 12));
    }

    #[test]
    fn revoked_auth_is_permission_denied() {
        let mut mirror = PartitionMirror::new(partition());
        assert_eq!(
            mirror.apply(&frame("auth_revoked", "credential is no longer valid")),
            Err(StoreError::PermissionDenied)
        );
        assert_eq!(mirror.apply(&frame("keep-alive", "null")), Ok(Vec::new()));
    }

    #[test]
    fn status_codes_map_to_store_errors() {
        assert_eq!(status_error(StatusCode::UNAUTHORIZED), StoreError::PermissionDenied);
        assert_eq!(status_error(StatusCode::SERVICE_UNAVAILABLE), StoreError::NetworkUnavailable);
        assert!(matches!(status_error(StatusCode::BAD_REQUEST), StoreError::Backend(_)));
    }
}
