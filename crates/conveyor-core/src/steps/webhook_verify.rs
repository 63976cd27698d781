// Webhook signature verification step
//
// Two modes: a named provider with a built-in scheme (GitHub, Stripe, or a
// generic hex HMAC header), or an explicit scheme with its own header and
// signing-input options. All comparisons go through `Mac::verify_slice`,
// which is constant-time. On failure the step stages the (configurable)
// error response and stops the pipeline; it never raises, so the trigger
// does not translate the failure into a 500.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::pipeline::{
    PipelineContext, PipelineStep, StepFactory, StepResult, META_HTTP_REQUEST, META_RAW_BODY,
    META_RESPONSE_BODY, META_RESPONSE_HANDLED, META_RESPONSE_HEADERS, META_RESPONSE_STATUS,
};
use crate::value::{DataMap, DataMapExt};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TOLERANCE_SECS: i64 = 300;
const DEFAULT_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Copy, PartialEq)]
enum VerifyMode {
    Github,
    Stripe,
    Generic,
    HmacSha1,
    HmacSha256,
    HmacSha256Hex,
}

struct WebhookVerifyStep {
    name: String,
    mode: VerifyMode,
    secret: String,
    header: String,
    tolerance_secs: i64,
    error_status: u16,
    reconstruct_url: bool,
    sorted_form_params: bool,
}

impl WebhookVerifyStep {
    fn verify(
        &self,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<(), String> {
        match self.mode {
            VerifyMode::Github => self.verify_github(body, headers),
            VerifyMode::Stripe => self.verify_stripe(body, headers),
            VerifyMode::Generic => {
                let sig = self.header_value(headers)?;
                let expected = hex::decode(sig.trim()).map_err(|_| "malformed signature")?;
                verify_sha256(self.secret.as_bytes(), body.as_bytes(), &expected)
            }
            VerifyMode::HmacSha1 | VerifyMode::HmacSha256 | VerifyMode::HmacSha256Hex => {
                let input = self.signing_input(body, headers);
                let sig = self.header_value(headers)?;
                let expected = match self.mode {
                    VerifyMode::HmacSha256Hex => {
                        hex::decode(sig.trim()).map_err(|_| "malformed signature")?
                    }
                    _ => BASE64
                        .decode(sig.trim())
                        .map_err(|_| "malformed signature")?,
                };
                match self.mode {
                    VerifyMode::HmacSha1 => {
                        verify_sha1(self.secret.as_bytes(), input.as_bytes(), &expected)
                    }
                    _ => verify_sha256(self.secret.as_bytes(), input.as_bytes(), &expected),
                }
            }
        }
        .map_err(|reason| reason.to_string())
    }

    fn header_value<'a>(
        &self,
        headers: &'a HashMap<String, String>,
    ) -> std::result::Result<&'a str, &'static str> {
        headers
            .get(&self.header.to_lowercase())
            .map(|s| s.as_str())
            .ok_or("missing signature header")
    }

    fn verify_github(
        &self,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<(), &'static str> {
        let sig = headers
            .get("x-hub-signature-256")
            .ok_or("missing signature header")?;
        let hex_part = sig
            .strip_prefix("sha256=")
            .ok_or("malformed signature")?;
        let expected = hex::decode(hex_part).map_err(|_| "malformed signature")?;
        verify_sha256(self.secret.as_bytes(), body.as_bytes(), &expected)
    }

    fn verify_stripe(
        &self,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<(), &'static str> {
        let header = headers
            .get("stripe-signature")
            .ok_or("missing signature header")?;

        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => {
                    if let Ok(decoded) = hex::decode(value) {
                        signatures.push(decoded);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or("malformed signature")?;
        if signatures.is_empty() {
            return Err("malformed signature");
        }
        if (Utc::now().timestamp() - timestamp).abs() > self.tolerance_secs {
            return Err("timestamp outside tolerance");
        }

        let signed_payload = format!("{}.{}", timestamp, body);
        for signature in &signatures {
            if verify_sha256(self.secret.as_bytes(), signed_payload.as_bytes(), signature).is_ok()
            {
                return Ok(());
            }
        }
        Err("signature mismatch")
    }

    /// Signing input for explicit schemes: optionally the reconstructed
    /// public URL (from forwarding headers), then either the sorted form
    /// parameters or the raw body.
    fn signing_input(&self, body: &str, headers: &HashMap<String, String>) -> String {
        let mut input = String::new();

        if self.reconstruct_url {
            let proto = headers
                .get("x-forwarded-proto")
                .map(|s| s.as_str())
                .unwrap_or("https");
            let host = headers
                .get("x-forwarded-host")
                .or_else(|| headers.get("host"))
                .map(|s| s.as_str())
                .unwrap_or("");
            let uri = headers.get("x-original-uri").map(|s| s.as_str()).unwrap_or("");
            input.push_str(proto);
            input.push_str("://");
            input.push_str(host);
            input.push_str(uri);
        }

        if self.sorted_form_params {
            let mut params: Vec<(String, String)> = body
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    (
                        urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_string()),
                        urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string()),
                    )
                })
                .collect();
            params.sort();
            for (k, v) in params {
                input.push_str(&k);
                input.push_str(&v);
            }
        } else {
            input.push_str(body);
        }

        input
    }
}

fn verify_sha256(secret: &[u8], data: &[u8], expected: &[u8]) -> std::result::Result<(), &'static str> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| "invalid secret")?;
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| "signature mismatch")
}

fn verify_sha1(secret: &[u8], data: &[u8], expected: &[u8]) -> std::result::Result<(), &'static str> {
    let mut mac = HmacSha1::new_from_slice(secret).map_err(|_| "invalid secret")?;
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| "signature mismatch")
}

#[async_trait]
impl PipelineStep for WebhookVerifyStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult> {
        let body = ctx
            .metadata
            .get_str(META_RAW_BODY)
            .unwrap_or_default()
            .to_string();

        let headers: HashMap<String, String> = ctx
            .metadata
            .get(META_HTTP_REQUEST)
            .and_then(|req| req.get("headers"))
            .and_then(|h| h.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.to_lowercase(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        match self.verify(&body, &headers) {
            Ok(()) => {
                let mut output = DataMap::new();
                output.insert("verified".into(), json!(true));
                Ok(StepResult::with_output(output))
            }
            Err(reason) => {
                tracing::warn!(step = %self.name, reason = %reason, "webhook verification failed");

                ctx.set_metadata(META_RESPONSE_STATUS, json!(self.error_status));
                ctx.set_metadata(
                    META_RESPONSE_BODY,
                    json!({"error": "unauthorized", "reason": reason}),
                );
                ctx.set_metadata(
                    META_RESPONSE_HEADERS,
                    json!({"content-type": "application/json"}),
                );
                ctx.set_metadata(META_RESPONSE_HANDLED, json!(true));

                let mut output = DataMap::new();
                output.insert("verified".into(), json!(false));
                output.insert("reason".into(), json!(reason));
                Ok(StepResult::stop_with(output))
            }
        }
    }
}

pub fn webhook_verify_factory() -> StepFactory {
    Arc::new(|name, config, _services| {
        let mode = match (config.get_str("provider"), config.get_str("scheme")) {
            (Some("github"), _) => VerifyMode::Github,
            (Some("stripe"), _) => VerifyMode::Stripe,
            (Some("generic"), _) => VerifyMode::Generic,
            (Some(other), _) => {
                return Err(CoreError::validation(format!(
                    "webhook_verify: unknown provider '{}'",
                    other
                )))
            }
            (None, Some("hmac-sha1")) => VerifyMode::HmacSha1,
            (None, Some("hmac-sha256")) => VerifyMode::HmacSha256,
            (None, Some("hmac-sha256-hex")) => VerifyMode::HmacSha256Hex,
            (None, Some(other)) => {
                return Err(CoreError::validation(format!(
                    "webhook_verify: unknown scheme '{}'",
                    other
                )))
            }
            (None, None) => {
                return Err(CoreError::validation(
                    "webhook_verify needs a provider or a scheme",
                ))
            }
        };

        let secret = config
            .get_str("secret")
            .ok_or_else(|| CoreError::validation("webhook_verify needs a secret"))?
            .to_string();

        Ok(Arc::new(WebhookVerifyStep {
            name: name.to_string(),
            mode,
            secret,
            header: config
                .get_str("header")
                .unwrap_or(DEFAULT_SIGNATURE_HEADER)
                .to_string(),
            tolerance_secs: config
                .get_i64("tolerance_secs")
                .unwrap_or(DEFAULT_TOLERANCE_SECS),
            error_status: config.get_i64("error_status").unwrap_or(401) as u16,
            reconstruct_url: config.get_bool("reconstruct_url").unwrap_or(false),
            sorted_form_params: config.get_bool("sorted_form_params").unwrap_or(false),
        }) as Arc<dyn PipelineStep>)
    })
}
