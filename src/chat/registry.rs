use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Stream key for a conversation that has no session id yet.
pub const TEMP_STREAM_ID: &str = "temp";

/// Open generation streams, at most one per session.
#[derive(Default)]
pub struct ActiveStreams {
    streams: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CancellationToken>>> {
        self.streams
            .lock()
            .map_err(|_| AppError::LockPoisoned("active streams"))
    }

    /// Claim the stream slot for `key`.
    pub fn register(&self, key: &str) -> Result<CancellationToken> {
        let mut streams = self.lock()?;
        if streams.contains_key(key) {
            return Err(AppError::Busy(key.to_string()));
        }
        let token = CancellationToken::new();
        streams.insert(key.to_string(), token.clone());
        tracing::debug!(stream = %key, "Stream registered");
        Ok(token)
    }

    /// Ask the stream to stop. It still ends with its own terminal event.
    pub fn cancel(&self, key: &str) -> Result<()> {
        let streams = self.lock()?;
        let token = streams
            .get(key)
            .ok_or_else(|| AppError::NoActiveStream(key.to_string()))?;
        token.cancel();
        tracing::info!(stream = %key, "Stream cancellation requested");
        Ok(())
    }

    /// Release the slot. Called before the terminal event goes out so a
    /// listener may start the next turn as soon as it sees it.
    pub fn finish(&self, key: &str) {
        match self.lock() {
            Ok(mut streams) => {
                streams.remove(key);
                tracing::debug!(stream = %key, "Stream released");
            }
            Err(e) => tracing::error!(stream = %key, error = %e, "Could not release stream"),
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().map(|s| s.contains_key(key)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_stream_for_same_session_is_busy() {
        let streams = ActiveStreams::new();
        streams.register("s1").unwrap();
        assert!(matches!(streams.register("s1"), Err(AppError::Busy(_))));
        streams.register("s2").unwrap();
        streams.finish("s1");
        streams.register("s1").unwrap();
    }

    #[test]
    fn cancel_fires_the_token() {
        let streams = ActiveStreams::new();
        let token = streams.register(TEMP_STREAM_ID).unwrap();
        streams.cancel(TEMP_STREAM_ID).unwrap();
        assert!(token.is_cancelled());
        assert!(streams.is_active(TEMP_STREAM_ID));
    }

    #[test]
    fn cancel_without_stream_fails() {
        let streams = ActiveStreams::new();
        assert!(matches!(
            streams.cancel("nope"),
            Err(AppError::NoActiveStream(_))
        ));
    }
}
