use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Supported inbound channels (kept small and stable).
///
/// ```
/// use obx_core::Channel;
///
/// let c = Channel::Messenger;
/// assert_eq!(c.as_str(), "messenger");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Channel {
    #[serde(rename = "messenger")]
    Messenger,
    #[serde(rename = "instagram")]
    Instagram,
    #[serde(rename = "whatsapp_cloud")]
    WhatsAppCloud,
    #[serde(rename = "whatsapp_session")]
    WhatsAppSession,
}

impl Channel {
    /// Returns the lowercase identifier used in routes, payloads, and rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Messenger => "messenger",
            Channel::Instagram => "instagram",
            Channel::WhatsAppCloud => "whatsapp_cloud",
            Channel::WhatsAppSession => "whatsapp_session",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "messenger" => Some(Channel::Messenger),
            "instagram" => Some(Channel::Instagram),
            "whatsapp_cloud" => Some(Channel::WhatsAppCloud),
            "whatsapp_session" => Some(Channel::WhatsAppSession),
            _ => None,
        }
    }

    /// Default outbound transport for conversations on this channel.
    pub fn default_transport(&self) -> TransportKind {
        match self {
            Channel::WhatsAppSession => TransportKind::Session,
            _ => TransportKind::Cloud,
        }
    }
}

/// Concrete outbound delivery mechanism for WhatsApp-style sends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Cloud,
    Session,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Cloud => "cloud",
            TransportKind::Session => "session",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cloud" => Some(TransportKind::Cloud),
            "session" => Some(TransportKind::Session),
            _ => None,
        }
    }
}

/// Logical message direction; literal column values come from
/// [`WireConventions`](crate::WireConventions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Logical author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    Agent,
    Contact,
}

/// Delivery lifecycle of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Maps provider receipt literals onto the canonical lifecycle.
    pub fn from_receipt(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" | "undelivered" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Coarse attachment classification shared by all providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" | "photo" | "sticker" => Some(AttachmentKind::Image),
            "video" => Some(AttachmentKind::Video),
            "audio" | "voice" | "ptt" => Some(AttachmentKind::Audio),
            "file" | "document" => Some(AttachmentKind::File),
            _ => None,
        }
    }

    /// Infers a kind from a MIME type prefix, defaulting to `File`.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            AttachmentKind::Image
        } else if mime.starts_with("video/") {
            AttachmentKind::Video
        } else if mime.starts_with("audio/") {
            AttachmentKind::Audio
        } else {
            AttachmentKind::File
        }
    }
}

/// Uniform attachment descriptor derived from provider payloads.
///
/// Every field except `kind` is independently optional; providers disagree
/// wildly on which ones they populate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentDescriptor {
    pub kind: AttachmentKind,
    pub mime: Option<String>,
    pub size: Option<u64>,
    pub remote_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl AttachmentDescriptor {
    pub fn new(kind: AttachmentKind) -> Self {
        Self {
            kind,
            mime: None,
            size: None,
            remote_url: None,
            width: None,
            height: None,
            duration_ms: None,
        }
    }
}

/// Normalized inbound message produced by the channel normalizer.
///
/// ```
/// use obx_core::{Channel, InboundEvent};
/// use time::OffsetDateTime;
///
/// let event = InboundEvent {
///     org_id: "org-1".into(),
///     channel: Channel::Messenger,
///     external_account_id: "page-9".into(),
///     external_user_id: "psid-4".into(),
///     external_thread_id: "psid-4".into(),
///     msg_id: "mid.123".into(),
///     text: Some("hello".into()),
///     attachments: Vec::new(),
///     timestamp: OffsetDateTime::UNIX_EPOCH,
///     raw: serde_json::json!({}),
/// };
/// assert_eq!(event.channel.as_str(), "messenger");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    pub org_id: String,
    pub channel: Channel,
    /// Page / business-account / phone-number id the webhook was addressed to.
    pub external_account_id: String,
    pub external_user_id: String,
    pub external_thread_id: String,
    /// Provider message id; the deduplication key for ingestion.
    pub msg_id: String,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Original leaf payload, retained for the audit sink.
    #[serde(default)]
    pub raw: Value,
}

/// Destination of an outbound send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// A raw phone/chat id on the wire.
    Direct(String),
    /// An existing conversation; the router resolves the wire id.
    Conversation(String),
}

/// Body of an outbound send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundBody {
    Text(String),
    Media {
        attachment: AttachmentDescriptor,
        caption: Option<String>,
    },
}

impl OutboundBody {
    /// Text persisted on the message row for conversation display.
    pub fn display_text(&self) -> String {
        match self {
            OutboundBody::Text(text) => text.clone(),
            OutboundBody::Media { caption, attachment } => caption
                .clone()
                .unwrap_or_else(|| format!("[{}]", attachment.kind.as_str())),
        }
    }
}

/// One outbound send request as accepted by the transport router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub org_id: String,
    pub to: Destination,
    pub body: OutboundBody,
    /// Explicit transport override; `None` defers to the conversation's
    /// channel configuration.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    pub idempotency_key: String,
}

/// Outcome of a routed send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendReceipt {
    pub transport: TransportKind,
    pub to: String,
    pub message_id: String,
    /// Provider-assigned message id, absent on the fallback path.
    pub provider_message_id: Option<String>,
    /// Set to `"service_not_configured"` when no transport was available and
    /// the message was only recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
