//! The worker-side testing request: echo a payload back after a delay.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::Result;
use crate::proto::{Status, StatusExt};

use super::{RequestCore, RequestTask};

/// The delay is consumed in bounded slices so cancellation is observed
/// promptly and a non-zero delay always spans several execution steps.
const SLICE_MS: u64 = 100;

pub struct EchoTask {
    delay_left_ms: u64,
    data: String,
}

impl EchoTask {
    pub fn new(delay_ms: u64, data: String) -> Self {
        Self { delay_left_ms: delay_ms, data }
    }
}

impl RequestTask for EchoTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(id = core.id(), delay_left_ms = self.delay_left_ms, "echo step");
        core.check_if_cancelling()?;

        if self.delay_left_ms > 0 {
            let span = self.delay_left_ms.min(SLICE_MS);
            std::thread::sleep(Duration::from_millis(span));
            self.delay_left_ms -= span;
            if self.delay_left_ms > 0 {
                return Ok(false);
            }
        }
        core.set_status(Status::Success, StatusExt::None)?;
        Ok(true)
    }

    fn result(&self) -> Value {
        json!({"data": self.data})
    }
}
