use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::bail;

use super::*;

impl Display for PredictionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Resolved => "resolved",
            Self::Voided => "voided",
            Self::Failed => "failed",
        };
        write!(f, "{}", output)
    }
}
impl PredictionState {
    /// Whether the prediction still occupies its channel's active slot.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Locked)
    }
}
impl Display for StatKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Created => "created",
            Self::Locked => "locked",
            Self::Resolved => "resolved",
            Self::Voided => "voided",
            Self::Failed => "failed",
        };
        write!(f, "{}", output)
    }
}
impl Display for OperationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", output)
    }
}
impl Display for BreakerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "halfOpen",
        };
        write!(f, "{}", output)
    }
}
impl Display for EventSubMessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Notification => "notification",
            Self::WebhookCallbackVerification => "webhook_callback_verification",
            Self::Revocation => "revocation",
        };
        write!(f, "{}", output)
    }
}
impl FromStr for EventSubMessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "notification" => Ok(Self::Notification),
            "webhook_callback_verification" => Ok(Self::WebhookCallbackVerification),
            "revocation" => Ok(Self::Revocation),
            e => bail!("Unknown EventSub message type: {}", e),
        }
    }
}
