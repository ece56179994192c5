//! Built-in module hosted by every node: logs traffic and answers pings.

use amif_common::Payload;
use amif_common::constants::topics;
use anyhow::bail;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Module, ModuleContext};

pub struct MonitorModule {
    ctx: ModuleContext,
    seen: AtomicU64,
}

impl MonitorModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            seen: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Messages handled so far
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Module for MonitorModule {
    fn on_message(&self, sender: &str, message: &Payload) -> anyhow::Result<()> {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;

        let kind = match message.get("type") {
            None => None,
            Some(Value::String(kind)) => Some(kind.as_str()),
            Some(other) => bail!("message type must be a string, got {}", other),
        };

        tracing::info!(
            module = %self.ctx.name(),
            sender = %sender,
            kind = kind.unwrap_or("-"),
            seen,
            "Message received"
        );

        if kind == Some("ping") {
            let mut pong = Payload::new();
            pong.insert("type".to_string(), Value::from("pong"));
            pong.insert("from".to_string(), Value::from(self.ctx.name()));
            pong.insert("to".to_string(), Value::from(sender));
            if !self.ctx.publish(topics::PONG, pong) {
                bail!("outbound queue closed");
            }
        }

        Ok(())
    }
}
