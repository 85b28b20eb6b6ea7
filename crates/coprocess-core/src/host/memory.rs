use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{HostApi, HostError, LogLevel, emit_log};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub name: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Process-local host: TTL key-value store, `tracing` logging and a
/// broadcast channel for triggered events.
#[derive(Debug)]
pub struct InMemoryHost {
    entries: DashMap<String, StoredValue>,
    events: broadcast::Sender<HostEvent>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn store_at(&self, key: &str, value: &str, ttl: i32, now: Instant) {
        let expires_at = u64::try_from(ttl)
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| now + Duration::from_secs(secs));
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, stored| stored.is_expired(now));
        None
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostApi for InMemoryHost {
    fn log(&self, message: &str, level: &str) -> Result<(), HostError> {
        emit_log(message, LogLevel::from_host(level));
        Ok(())
    }

    fn get_data(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.get_at(key, Instant::now()))
    }

    fn store_data(&self, key: &str, value: &str, ttl: i32) -> Result<(), HostError> {
        self.store_at(key, value, ttl, Instant::now());
        Ok(())
    }

    fn trigger_event(&self, name: &str, payload: &str) -> Result<(), HostError> {
        tracing::debug!(target: "coprocess", event = name, "host event triggered");
        let _ = self.events.send(HostEvent {
            name: name.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_value_is_readable_until_ttl_elapses() {
        let host = InMemoryHost::new();
        let now = Instant::now();
        host.store_at("session", "abc", 10, now);

        assert_eq!(host.get_at("session", now), Some("abc".to_string()));
        assert_eq!(
            host.get_at("session", now + Duration::from_secs(9)),
            Some("abc".to_string())
        );
        assert_eq!(host.get_at("session", now + Duration::from_secs(10)), None);
        assert!(host.is_empty(), "expired entry is removed on read");
    }

    #[test]
    fn non_positive_ttl_never_expires() {
        let host = InMemoryHost::new();
        let now = Instant::now();
        host.store_at("zero", "v0", 0, now);
        host.store_at("negative", "v1", -5, now);

        let later = now + Duration::from_secs(60 * 60 * 24 * 365);
        assert_eq!(host.get_at("zero", later), Some("v0".to_string()));
        assert_eq!(host.get_at("negative", later), Some("v1".to_string()));
    }

    #[test]
    fn store_overwrites_value_and_ttl() {
        let host = InMemoryHost::new();
        let now = Instant::now();
        host.store_at("key", "first", 1, now);
        host.store_at("key", "second", 0, now);

        assert_eq!(
            host.get_at("key", now + Duration::from_secs(5)),
            Some("second".to_string())
        );
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let host = InMemoryHost::new();
        let now = Instant::now();
        host.store_at("short", "a", 1, now);
        host.store_at("long", "b", 100, now);
        host.store_at("forever", "c", 0, now);

        assert_eq!(host.purge_expired_at(now + Duration::from_secs(2)), 1);
        assert_eq!(host.len(), 2);
        assert_eq!(host.get_at("short", now), None);
    }

    #[test]
    fn purge_drops_entries_that_were_never_read() {
        let host = InMemoryHost::new();
        let stored_at = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .expect("instant in the past");
        for i in 0..100 {
            host.store_at(&format!("key-{i}"), "v", 1, stored_at);
        }
        host.store_data("live", "v", 0).expect("store");

        assert_eq!(host.purge_expired(), 100);
        assert_eq!(host.len(), 1);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let host = InMemoryHost::new();
        assert_eq!(host.get_data("nope").expect("get"), None);
    }

    #[tokio::test]
    async fn trigger_event_reaches_subscribers() {
        let host = InMemoryHost::new();
        let mut receiver = host.subscribe();
        host.trigger_event("KeyExpired", r#"{"key":"abc"}"#)
            .expect("trigger");

        let event = receiver.recv().await.expect("event");
        assert_eq!(
            event,
            HostEvent {
                name: "KeyExpired".to_string(),
                payload: r#"{"key":"abc"}"#.to_string(),
            }
        );
    }

    #[test]
    fn trigger_event_without_subscribers_is_ok() {
        let host = InMemoryHost::new();
        assert!(host.trigger_event("Quiet", "").is_ok());
    }
}
