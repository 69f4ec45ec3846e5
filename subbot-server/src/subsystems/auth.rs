//! Authentication issuer
//!
//! Turns the protocol engine's raw challenges into something a user can act
//! on: a QR payload plus a terminal rendering, or a validated pairing code
//! formatted as `ABCD-1234`.
//!
//! A configured custom pairing code is proposed to the engine first. If the
//! engine refuses it, or the configured value is malformed, issuance falls
//! back to an engine-generated code and logs why.

use qrcodegen::{QrCode, QrCodeEcc};
use serde::Serialize;
use subbot_core::config::AuthConfig;
use subbot_core::pairing::{self, CodeCharset};
use subbot_core::{Connection, ProtocolError, SubbotError};
use tracing::{info, warn};

use super::registry::SessionRegistry;

const QR_QUIET_ZONE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QrChallenge {
    pub payload: String,
    /// Half-block rendering; `None` when the payload does not fit a QR symbol.
    pub rendered: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingChallenge {
    pub code: String,
    pub display: String,
    /// `false` when a configured custom code was refused and the engine's own
    /// code was issued instead.
    pub custom: bool,
}

/// What a launch hands back to whoever started it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthChallenge {
    Qr(QrChallenge),
    Pairing(PairingChallenge),
    /// Stored credentials were accepted; no user action needed.
    Resumed,
}

#[derive(Debug, Clone)]
pub struct AuthIssuer {
    charset: CodeCharset,
    custom_code: Option<String>,
}

impl AuthIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            charset: config.charset,
            custom_code: config.custom_pairing_code.clone(),
        }
    }

    pub fn charset(&self) -> CodeCharset {
        self.charset
    }

    pub fn validate(&self, raw: &str) -> bool {
        pairing::validate(raw, self.charset)
    }

    pub fn format_for_display(&self, code: &str) -> String {
        pairing::format_for_display(code)
    }

    /// The configured custom code in canonical form, if it is well-formed.
    fn usable_custom_code(&self) -> Option<String> {
        let raw = self.custom_code.as_deref()?;
        match pairing::parse(raw, self.charset) {
            Ok(code) => Some(code),
            Err(e) => {
                warn!("Configured custom pairing code ignored: {}", e);
                None
            }
        }
    }

    pub async fn issue_pairing_code(
        &self,
        connection: &dyn Connection,
        phone_number: &str,
    ) -> Result<PairingChallenge, SubbotError> {
        if let Some(custom) = self.usable_custom_code() {
            match connection
                .request_pairing_code(phone_number, Some(&custom))
                .await
            {
                Ok(code) => return self.accept(&code, true),
                Err(e) if e.is_permanent() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        "Custom pairing code refused, falling back to a generated one: {}",
                        e
                    );
                }
            }
        }

        let code = connection.request_pairing_code(phone_number, None).await?;
        self.accept(&code, false)
    }

    /// Engine-generated codes are checked against the widest charset; the
    /// configured charset only constrains custom codes.
    fn accept(&self, raw: &str, custom: bool) -> Result<PairingChallenge, SubbotError> {
        let charset = if custom {
            self.charset
        } else {
            CodeCharset::Alphanumeric
        };
        let code = pairing::parse(raw, charset).map_err(|e| {
            SubbotError::Protocol(ProtocolError::Gateway(format!(
                "engine returned an unusable pairing code: {}",
                e
            )))
        })?;
        info!(custom, "Pairing code issued");
        Ok(PairingChallenge {
            display: pairing::format_for_display(&code),
            code,
            custom,
        })
    }

    /// Only sessions with a live supervisor may publish a QR challenge.
    pub fn issue_qr(
        &self,
        registry: &SessionRegistry,
        code: &str,
        payload: &str,
    ) -> Result<QrChallenge, SubbotError> {
        if !registry.contains(code) {
            return Err(SubbotError::Validation(format!(
                "session {} has no live connection",
                code
            )));
        }
        if payload.is_empty() {
            return Err(SubbotError::Protocol(ProtocolError::Gateway(
                "empty QR payload".to_string(),
            )));
        }
        Ok(QrChallenge {
            payload: payload.to_string(),
            rendered: render_qr(payload),
        })
    }
}

/// Two QR rows per terminal row using half blocks, with a light quiet zone.
pub fn render_qr(payload: &str) -> Option<String> {
    let qr = match QrCode::encode_text(payload, QrCodeEcc::Medium) {
        Ok(qr) => qr,
        Err(e) => {
            warn!("QR payload could not be encoded: {:?}", e);
            return None;
        }
    };

    // get_module is false outside the symbol, which yields the quiet zone
    let lo = -QR_QUIET_ZONE;
    let hi = qr.size() + QR_QUIET_ZONE;
    let mut lines = Vec::new();
    let mut y = lo;
    while y < hi {
        let line: String = (lo..hi)
            .map(|x| match (qr.get_module(x, y), qr.get_module(x, y + 1)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            })
            .collect();
        lines.push(line);
        y += 2;
    }
    Some(lines.join("\n"))
}
