//! [`ChannelPlugin`] adapter over the session.

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    pairgate_channels::{
        ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus, DeliveryStatus,
    },
};

use crate::session::{SendStatus, WhatsAppSession};

/// WhatsApp as a single-account channel.
#[derive(Debug, Clone)]
pub struct WhatsAppChannel {
    session: WhatsAppSession,
    account_id: String,
}

impl WhatsAppChannel {
    pub fn new(session: WhatsAppSession, account_id: impl Into<String>) -> Self {
        Self {
            session,
            account_id: account_id.into(),
        }
    }

    pub fn session(&self) -> &WhatsAppSession {
        &self.session
    }

    fn check_account(&self, account_id: &str) -> Result<()> {
        if account_id != self.account_id {
            bail!("unknown whatsapp account: {account_id}");
        }
        Ok(())
    }
}

impl ChannelPlugin for WhatsAppChannel {
    fn id(&self) -> &str {
        "whatsapp"
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(self)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelOutbound for WhatsAppChannel {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<DeliveryStatus> {
        self.check_account(account_id)?;
        let report = self.session.send(to, text).await?;
        match report.status {
            SendStatus::Sent => Ok(DeliveryStatus::Sent),
            SendStatus::Queued => Ok(DeliveryStatus::Queued),
            SendStatus::Failed => bail!(
                "send to {} failed: {}",
                report.recipient,
                report.detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[async_trait]
impl ChannelStatus for WhatsAppChannel {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        self.check_account(account_id)?;
        let snap = self.session.snapshot();
        let details = match snap.pairing_artifact {
            Some(_) => Some("waiting for QR scan".to_string()),
            None if snap.auth_failed => Some("authentication failed".to_string()),
            None => Some(format!("state: {}", snap.state)),
        };
        Ok(ChannelHealthSnapshot {
            connected: snap.ready,
            account_id: self.account_id.clone(),
            details,
        })
    }
}
