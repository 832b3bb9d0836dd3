use std::collections::HashMap;

/// Leading-edge gate: accept when nothing was accepted yet or the interval
/// has fully elapsed since the last acceptance.
pub fn should_proceed(event_ts_ms: u64, last_accepted_ms: Option<u64>, min_interval_ms: u64) -> bool {
    match last_accepted_ms {
        None => true,
        Some(last) => event_ts_ms.saturating_sub(last) >= min_interval_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleStream {
    LocationPublish,
    CameraRecenter,
    MatchRecompute,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Offer<T> {
    Proceed(T),
    Deferred { flush_at_ms: u64 },
}

#[derive(Debug)]
struct StreamState<T> {
    min_interval_ms: u64,
    last_accepted_ms: Option<u64>,
    pending: Option<(u64, T)>,
}

/// Per-stream throttle with a trailing flush. A deferred value is held
/// (latest wins) and becomes due once no new value has arrived for the
/// stream's interval, so the final value of a burst is never lost.
#[derive(Debug)]
pub struct UpdateThrottler<T> {
    streams: HashMap<ThrottleStream, StreamState<T>>,
}

impl<T> Default for UpdateThrottler<T> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
        }
    }
}

impl<T> UpdateThrottler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, stream: ThrottleStream, min_interval_ms: u64) -> Self {
        self.streams.insert(
            stream,
            StreamState {
                min_interval_ms,
                last_accepted_ms: None,
                pending: None,
            },
        );
        self
    }

    // Unregistered streams are never throttled.
    pub fn offer(&mut self, stream: ThrottleStream, now_ms: u64, value: T) -> Offer<T> {
        let Some(state) = self.streams.get_mut(&stream) else {
            return Offer::Proceed(value);
        };
        if should_proceed(now_ms, state.last_accepted_ms, state.min_interval_ms) {
            state.last_accepted_ms = Some(now_ms);
            state.pending = None;
            return Offer::Proceed(value);
        }
        let flush_at_ms = now_ms.saturating_add(state.min_interval_ms);
        state.pending = Some((flush_at_ms, value));
        Offer::Deferred { flush_at_ms }
    }

    pub fn next_flush(&self) -> Option<(ThrottleStream, u64)> {
        self.streams
            .iter()
            .filter_map(|(stream, state)| state.pending.as_ref().map(|(at, _)| (*stream, *at)))
            .min_by_key(|(_, at)| *at)
    }

    /// Releases the pending value if its flush time has come, counting it as
    /// an acceptance.
    pub fn take_due(&mut self, stream: ThrottleStream, now_ms: u64) -> Option<T> {
        let state = self.streams.get_mut(&stream)?;
        match &state.pending {
            Some((at, _)) if *at <= now_ms => {
                state.last_accepted_ms = Some(now_ms);
                state.pending.take().map(|(_, value)| value)
            }
            _ => None,
        }
    }

    pub fn has_pending(&self, stream: ThrottleStream) -> bool {
        self.streams
            .get(&stream)
            .map(|s| s.pending.is_some())
            .unwrap_or(false)
    }

    pub fn cancel(&mut self, stream: ThrottleStream) {
        if let Some(state) = self.streams.get_mut(&stream) {
            state.pending = None;
        }
    }

    pub fn cancel_all(&mut self) {
        for state in self.streams.values_mut() {
            state.pending = None;
        }
    }
}
