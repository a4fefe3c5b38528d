//! Test helper functions
//!
//! Config with short delays, a recording message handler and a polling wait
//! that works under tokio's paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ControllerConfig;
use crate::kafka::consumer::MessageHandler;
use crate::kafka::error::HandlerError;
use crate::kafka::messages::Message;

/// Config with delays short enough for unit tests
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        client_id: "test-client".to_string(),
        reconnect_delay: Duration::from_millis(50),
        handler_cooldown: Duration::from_millis(20),
        request_timeout: Duration::from_millis(100),
        delivery_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Poll `condition` every millisecond until it holds or `limit` elapses
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

/// MessageHandler that records every attempt and fails on demand
#[derive(Default)]
pub struct RecordingHandler {
    attempts: Mutex<Vec<i64>>,
    handled: Mutex<Vec<i64>>,
    /// offset -> remaining failures
    failures: Mutex<HashMap<i64, u32>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` attempts at `offset`
    pub fn fail_offset(&self, offset: i64, times: u32) {
        self.failures.lock().insert(offset, times);
    }

    /// Offsets of every handler call, in call order
    pub fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().clone()
    }

    /// Offsets of every successful handler call, in call order
    pub fn handled(&self) -> Vec<i64> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.attempts.lock().push(message.offset);

        let fail = match self.failures.lock().get_mut(&message.offset) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(format!("induced failure at offset {}", message.offset).into());
        }

        self.handled.lock().push(message.offset);
        Ok(())
    }
}
