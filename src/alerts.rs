/// Unauthorized-access alerts
///
/// `AlertGate` is a per-camera cooldown clock: any unauthorized face on a
/// camera shares one key, so a crowd at the door yields one alert per
/// cooldown window. The gate is owned by the capture loop and never shared.
///
/// Sinks are best-effort: one attempt, short timeout, failures logged.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::camera_config::AlertConfig;
use crate::error::AlertError;

// ─── Cooldown gate ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct AlertGate {
    enabled: bool,
    cooldown: Duration,
    last_dispatch: HashMap<String, Instant>,
}

impl AlertGate {
    pub fn new(enabled: bool, cooldown: Duration) -> Self {
        Self {
            enabled,
            cooldown,
            last_dispatch: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &AlertConfig) -> Self {
        Self::new(cfg.enabled, cfg.cooldown())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cooldown key shared by every unauthorized event on a camera.
    pub fn alert_key(camera_name: &str) -> String {
        format!("unauthorized_{}", camera_name)
    }

    /// Returns true and stamps `now` when more than `cooldown` has passed since
    /// the last dispatch for `key`. A denied call leaves the state untouched.
    pub fn try_acquire(&mut self, key: &str, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(last) = self.last_dispatch.get(key) {
            if now.saturating_duration_since(*last) <= self.cooldown {
                return false;
            }
        }
        self.last_dispatch.insert(key.to_string(), now);
        true
    }
}

// ─── Alert payload ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub alert_type: &'static str,
    pub timestamp: String,
    pub camera_name: String,
    pub camera_location: String,
    pub subject_name: String,
    pub similarity: Option<f64>,
    pub face_count: usize,
    pub severity: &'static str,
}

impl AlertMessage {
    pub fn unauthorized(
        camera_name: &str,
        camera_location: &str,
        subject: Option<&str>,
        similarity: Option<f64>,
        face_count: usize,
    ) -> Self {
        Self {
            alert_type: "UNAUTHORIZED_ACCESS",
            timestamp: Local::now().to_rfc3339(),
            camera_name: camera_name.to_string(),
            camera_location: camera_location.to_string(),
            subject_name: subject.unwrap_or("Unknown Person").to_string(),
            similarity,
            face_count,
            severity: "HIGH",
        }
    }
}

// ─── Sinks ──────────────────────────────────────────────────────────────────

pub trait AlertSink {
    fn send(&self, message: &AlertMessage) -> Result<(), AlertError>;
}

impl<T: AlertSink + ?Sized> AlertSink for Box<T> {
    fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        (**self).send(message)
    }
}

/// POSTs the alert as JSON to a webhook.
pub struct WebhookAlertSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        let resp = self.client.post(&self.url).json(message).send()?;
        if !resp.status().is_success() {
            return Err(AlertError::Status(resp.status().as_u16()));
        }
        info!("Alert sent to webhook successfully");
        Ok(())
    }
}

/// Used when no webhook is configured: the service log is the alert channel.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        warn!(
            camera = %message.camera_name,
            subject = %message.subject_name,
            "no alert webhook configured; alert recorded in service log only"
        );
        Ok(())
    }
}

pub fn sink_from_config(cfg: &AlertConfig) -> Result<Box<dyn AlertSink + Send>, AlertError> {
    match cfg.webhook() {
        Some(url) => Ok(Box::new(WebhookAlertSink::new(
            url,
            Duration::from_secs(cfg.timeout_secs),
        )?)),
        None => Ok(Box::new(LogAlertSink)),
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Disabled,
    CoolingDown,
    Sent,
    Failed,
}

pub struct AlertDispatcher<K> {
    gate: AlertGate,
    sink: K,
}

impl<K: AlertSink> AlertDispatcher<K> {
    pub fn new(gate: AlertGate, sink: K) -> Self {
        Self { gate, sink }
    }

    /// Gate, log and send one alert. Only `Sent` means the sink accepted it.
    pub fn dispatch(&mut self, message: &AlertMessage, now: Instant) -> AlertOutcome {
        if !self.gate.is_enabled() {
            return AlertOutcome::Disabled;
        }

        let key = AlertGate::alert_key(&message.camera_name);
        if !self.gate.try_acquire(&key, now) {
            info!("Alert cooldown active for {}", message.camera_name);
            return AlertOutcome::CoolingDown;
        }

        warn!(
            camera = %message.camera_name,
            location = %message.camera_location,
            subject = %message.subject_name,
            similarity = ?message.similarity,
            faces = message.face_count,
            "UNAUTHORIZED ACCESS ALERT"
        );

        match self.sink.send(message) {
            Ok(()) => AlertOutcome::Sent,
            Err(e) => {
                error!("Failed to send alert: {}", e);
                AlertOutcome::Failed
            }
        }
    }
}
