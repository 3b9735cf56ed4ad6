pub mod command;

use serde::{Deserialize, Serialize};

pub use command::{CommandToken, ack_token, is_ack_token};

/// Version stamped on every envelope; bump on incompatible field changes.
pub const SCHEMA_VERSION: u32 = 1;

/// The wire unit exchanged on the control channel. Immutable once serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Envelope creation time, unix millis.
    pub ts: i64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Command {
        token: String,
    },
    Location(LocationBody),
    Sms(SmsBody),
    Calllog(CallLogBody),
    Notification(NotificationEnvelope),
    NotificationBatch {
        items: Vec<Envelope>,
    },
    NotificationRemoved(NotificationEnvelope),
    NotificationSnapshot {
        items: Vec<Envelope>,
    },
    Pong {
        /// Timestamp echoed from the PING that triggered this.
        echo_ts: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationBody {
    /// `[lat, lng]`
    pub coords: [f64; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Fix time, unix millis.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmsType {
    Inbox,
    Sent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmsBody {
    pub timestamp: i64,
    pub address: String,
    pub body: String,
    pub sms_type: SmsType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Incoming,
    Outgoing,
    Missed,
    Voicemail,
    Rejected,
    Blocked,
    External,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallLogBody {
    pub timestamp: i64,
    pub number: String,
    pub name: String,
    /// Call duration in seconds.
    pub duration: u64,
    pub call_type: CallType,
}

/// Notification envelopes carry the posting child's id alongside the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEnvelope {
    #[serde(rename = "childId")]
    pub child_id: String,
    pub body: NotificationBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBody {
    pub app_name: String,
    pub package_name: String,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub is_ongoing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    /// When the notification was posted on the device, unix millis.
    pub post_time: i64,
    pub action_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Envelope {
    pub fn new(body: EnvelopeBody) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ts: now_millis(),
            body,
        }
    }

    pub fn command(token: impl Into<String>) -> Self {
        Self::new(EnvelopeBody::Command {
            token: token.into(),
        })
    }

    pub fn location(coords: [f64; 2], accuracy: Option<f64>, timestamp: i64) -> Self {
        Self::new(EnvelopeBody::Location(LocationBody {
            coords,
            accuracy,
            timestamp,
        }))
    }

    pub fn sms(body: SmsBody) -> Self {
        Self::new(EnvelopeBody::Sms(body))
    }

    pub fn calllog(body: CallLogBody) -> Self {
        Self::new(EnvelopeBody::Calllog(body))
    }

    pub fn notification(child_id: impl Into<String>, body: NotificationBody) -> Self {
        Self::new(EnvelopeBody::Notification(NotificationEnvelope {
            child_id: child_id.into(),
            body,
        }))
    }

    pub fn notification_removed(child_id: impl Into<String>, body: NotificationBody) -> Self {
        Self::new(EnvelopeBody::NotificationRemoved(NotificationEnvelope {
            child_id: child_id.into(),
            body,
        }))
    }

    pub fn notification_batch(items: Vec<Envelope>) -> Self {
        Self::new(EnvelopeBody::NotificationBatch { items })
    }

    pub fn notification_snapshot(items: Vec<Envelope>) -> Self {
        Self::new(EnvelopeBody::NotificationSnapshot { items })
    }

    pub fn pong(echo_ts: i64) -> Self {
        Self::new(EnvelopeBody::Pong { echo_ts })
    }

    /// Whether this envelope belongs to the notification batch path.
    pub fn is_batchable(&self) -> bool {
        matches!(
            self.body,
            EnvelopeBody::Notification(_) | EnvelopeBody::NotificationRemoved(_)
        )
    }

    /// The source-side ordering key for delta-synced telemetry, if any.
    pub fn source_timestamp(&self) -> Option<i64> {
        match &self.body {
            EnvelopeBody::Location(b) => Some(b.timestamp),
            EnvelopeBody::Sms(b) => Some(b.timestamp),
            EnvelopeBody::Calllog(b) => Some(b.timestamp),
            EnvelopeBody::Notification(n) | EnvelopeBody::NotificationRemoved(n) => {
                Some(n.body.post_time)
            }
            _ => None,
        }
    }
}
