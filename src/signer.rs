//! Fiscal signer (TSE) client.
//!
//! The signer is authoritative for signature counters; the server never
//! generates them locally. The HTTP client talks to the technical security
//! element over a narrow `sign` endpoint; an in-process signer backs tests
//! and offline bring-up.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::config::Secret;
use crate::error::{PosError, PosResult};
use crate::models::now_utc;

/// A completed signature from the security element.
#[derive(Debug, Clone)]
pub struct TseSignature {
    pub signature: String,
    pub counter: i64,
    pub tse_timestamp: String,
}

/// Anything that can sign a fiscal payload.
pub trait FiscalSigner: Send + Sync {
    fn sign(&self, payload: &Value) -> PosResult<TseSignature>;
}

// ---------------------------------------------------------------------------
// HTTP TSE client
// ---------------------------------------------------------------------------

/// Blocking HTTP client against a remote TSE module.
pub struct HttpTseSigner {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: Secret,
}

impl HttpTseSigner {
    pub fn new(base_url: String, api_key: Secret, timeout: Duration) -> PosResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PosError::Internal(format!("signer client: {e}")))?;
        Ok(HttpTseSigner {
            client,
            base_url,
            api_key,
        })
    }
}

impl FiscalSigner for HttpTseSigner {
    fn sign(&self, payload: &Value) -> PosResult<TseSignature> {
        let url = format!("{}/sign", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .json(payload)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "TSE sign request rejected");
            return Err(PosError::Internal(format!("signer returned {status}")));
        }

        let body: Value = response.json()?;
        let signature = body
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| PosError::Internal("signer response missing signature".into()))?
            .to_string();
        let counter = body
            .get("counter")
            .and_then(Value::as_i64)
            .ok_or_else(|| PosError::Internal("signer response missing counter".into()))?;
        let tse_timestamp = body
            .get("tse_timestamp")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(now_utc);

        Ok(TseSignature {
            signature,
            counter,
            tse_timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// In-process signer
// ---------------------------------------------------------------------------

/// Deterministic in-process signer for tests and offline bring-up.
///
/// Signs with a SHA-256 digest over the canonical payload text and a
/// process-local monotonic counter. Not a substitute for a certified TSE.
pub struct LocalSigner {
    counter: AtomicI64,
}

impl LocalSigner {
    pub fn new() -> Self {
        LocalSigner {
            counter: AtomicI64::new(0),
        }
    }
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl FiscalSigner for LocalSigner {
    fn sign(&self, payload: &Value) -> PosResult<TseSignature> {
        let digest = Sha256::digest(payload.to_string().as_bytes());
        Ok(TseSignature {
            signature: BASE64_STANDARD.encode(digest),
            counter: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
            tse_timestamp: now_utc(),
        })
    }
}

/// Signer that always fails; lets tests exercise divergence paths.
#[cfg(test)]
pub struct FailingSigner;

#[cfg(test)]
impl FiscalSigner for FailingSigner {
    fn sign(&self, _payload: &Value) -> PosResult<TseSignature> {
        Err(PosError::ExternalTimeout("signer unreachable".into()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_signer_counter_is_monotonic() {
        let signer = LocalSigner::new();
        let a = signer.sign(&json!({"x": 1})).unwrap();
        let b = signer.sign(&json!({"x": 2})).unwrap();
        assert_eq!(a.counter, 1);
        assert_eq!(b.counter, 2);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_local_signer_is_deterministic_per_payload() {
        let signer = LocalSigner::new();
        let a = signer.sign(&json!({"x": 1})).unwrap();
        let b = signer.sign(&json!({"x": 1})).unwrap();
        assert_eq!(a.signature, b.signature);
    }
}
