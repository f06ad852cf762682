//! Deterministic in-process transport.
//!
//! Each outbound command is matched against scripted replies by prefix; the
//! matching steps are played back into the hub with their delays. Used by
//! tests and by local runs without a relay.

use super::{Attachment, EventHub, InboundEvent, MessengerTransport};
use crate::errors::GatewayError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One scripted reply step, emitted `delay` after the previous one
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub item: Result<InboundEvent, GatewayError>,
}

impl ScriptStep {
    pub fn event(delay_ms: u64, event: InboundEvent) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            item: Ok(event),
        }
    }

    pub fn text(delay_ms: u64, text: &str) -> Self {
        Self::event(
            delay_ms,
            InboundEvent::Text {
                message_id: 0,
                text: text.to_string(),
                buttons: Vec::new(),
            },
        )
    }

    pub fn text_with_buttons(delay_ms: u64, text: &str, buttons: &[&str]) -> Self {
        Self::event(
            delay_ms,
            InboundEvent::Text {
                message_id: 0,
                text: text.to_string(),
                buttons: buttons.iter().map(|b| b.to_string()).collect(),
            },
        )
    }

    pub fn typing(delay_ms: u64) -> Self {
        Self::event(delay_ms, InboundEvent::Typing)
    }

    pub fn file(delay_ms: u64, file_name: &str, mime_type: &str, bytes: &[u8]) -> Self {
        Self::event(
            delay_ms,
            InboundEvent::File {
                message_id: 0,
                attachment: Attachment {
                    file_name: file_name.to_string(),
                    mime_type: mime_type.to_string(),
                    bytes: bytes.to_vec(),
                },
                caption: None,
            },
        )
    }

    pub fn html(delay_ms: u64, file_name: &str, body: &str) -> Self {
        Self::file(delay_ms, file_name, "text/html", body.as_bytes())
    }

    pub fn error(delay_ms: u64, error: GatewayError) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            item: Err(error),
        }
    }
}

#[derive(Default)]
struct Script {
    by_prefix: Vec<(String, Vec<ScriptStep>)>,
    by_button: Vec<(String, Vec<ScriptStep>)>,
    fallback: Vec<ScriptStep>,
    send_failures: VecDeque<GatewayError>,
    connect_failures: VecDeque<GatewayError>,
    sent: Vec<(String, String)>,
    pressed: Vec<String>,
}

pub struct ScriptedTransport {
    hub: EventHub,
    script: Mutex<Script>,
    connect_calls: AtomicUsize,
    next_message_id: AtomicI64,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(event_capacity: usize) -> Self {
        Self {
            hub: EventHub::new(event_capacity),
            script: Mutex::new(Script::default()),
            connect_calls: AtomicUsize::new(0),
            next_message_id: AtomicI64::new(1000),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply to commands starting with `prefix`. Later scripts take precedence.
    pub fn on_command(&self, prefix: &str, steps: Vec<ScriptStep>) {
        self.script().by_prefix.insert(0, (prefix.to_string(), steps));
    }

    /// Reply to a button press whose label contains `label` (case-insensitive)
    pub fn on_button(&self, label: &str, steps: Vec<ScriptStep>) {
        self.script().by_button.push((label.to_lowercase(), steps));
    }

    /// Reply to any unmatched command
    pub fn on_any(&self, steps: Vec<ScriptStep>) {
        self.script().fallback = steps;
    }

    pub fn fail_next_send(&self, error: GatewayError) {
        self.script().send_failures.push_back(error);
    }

    pub fn fail_next_connect(&self, error: GatewayError) {
        self.script().connect_failures.push_back(error);
    }

    /// Inject an event directly, outside any script
    pub fn emit(&self, contact: &str, event: InboundEvent) -> usize {
        self.hub.publish(contact, event)
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.script().sent.clone()
    }

    pub fn pressed_buttons(&self) -> Vec<String> {
        self.script().pressed.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    fn play(&self, contact: &str, reply_to: i64, steps: Vec<ScriptStep>) {
        let hub = self.hub.clone();
        let contact = contact.to_string();
        let mut next_id = reply_to;

        tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(step.delay).await;
                match step.item {
                    Ok(event) => {
                        next_id += 1;
                        hub.publish(&contact, with_message_id(event, next_id));
                    }
                    Err(e) => hub.fail_all(e),
                }
            }
        });
    }
}

fn with_message_id(event: InboundEvent, id: i64) -> InboundEvent {
    match event {
        InboundEvent::Text { text, buttons, .. } => InboundEvent::Text {
            message_id: id,
            text,
            buttons,
        },
        InboundEvent::File {
            attachment,
            caption,
            ..
        } => InboundEvent::File {
            message_id: id,
            attachment,
            caption,
        },
        other => other,
    }
}

#[async_trait]
impl MessengerTransport for ScriptedTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        match self.script().connect_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send(&self, contact: &str, text: &str) -> Result<i64, GatewayError> {
        let steps = {
            let mut script = self.script();
            script.sent.push((contact.to_string(), text.to_string()));
            if let Some(e) = script.send_failures.pop_front() {
                return Err(e);
            }
            script
                .by_prefix
                .iter()
                .find(|(prefix, _)| text.starts_with(prefix.as_str()))
                .map(|(_, steps)| steps.clone())
                .unwrap_or_else(|| script.fallback.clone())
        };

        let message_id = self.next_message_id.fetch_add(100, Ordering::SeqCst);
        debug!(contact, message_id, steps = steps.len(), "Scripted send");
        self.play(contact, message_id, steps);
        Ok(message_id)
    }

    async fn press_button(
        &self,
        contact: &str,
        message_id: i64,
        label: &str,
    ) -> Result<(), GatewayError> {
        let steps = {
            let mut script = self.script();
            script.pressed.push(label.to_string());
            let lower = label.to_lowercase();
            script
                .by_button
                .iter()
                .find(|(key, _)| lower.contains(key.as_str()))
                .map(|(_, steps)| steps.clone())
                .unwrap_or_default()
        };
        self.play(contact, message_id + 50, steps);
        Ok(())
    }

    async fn disconnect(&self) {}

    fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
