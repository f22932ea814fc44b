//! Pairing artifact: the scannable QR code shown while the account is unlinked.

use {
    base64::Engine,
    qrcode::{QrCode, render::svg, types::QrError},
    serde::Serialize,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing code is empty")]
    Empty,
    #[error("cannot encode pairing code as QR: {0}")]
    Encode(#[from] QrError),
}

/// A rendered pairing code as a `data:` URL, ready for an `<img src>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PairingArtifact(String);

impl PairingArtifact {
    /// Render `code` as an SVG QR image and wrap it in a base64 data URL.
    pub fn render(code: &str) -> Result<Self, PairingError> {
        if code.is_empty() {
            return Err(PairingError::Empty);
        }
        let qr = QrCode::new(code.as_bytes())?;
        let image = qr
            .render::<svg::Color<'_>>()
            .min_dimensions(256, 256)
            .quiet_zone(true)
            .build();
        let encoded = base64::engine::general_purpose::STANDARD.encode(image.as_bytes());
        Ok(Self(format!("data:image/svg+xml;base64,{encoded}")))
    }

    /// Wrap an already-encoded artifact.
    pub fn from_data_url(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn data_url(&self) -> &str {
        &self.0
    }
}

/// Result of asking for the current pairing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingLookup {
    Available(PairingArtifact),
    /// No code has been issued yet, or the session already paired.
    Unavailable,
}

impl From<Option<PairingArtifact>> for PairingLookup {
    fn from(artifact: Option<PairingArtifact>) -> Self {
        artifact.map_or(Self::Unavailable, Self::Available)
    }
}
