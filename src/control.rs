//! Control-plane seam: cluster state probes plus the init/rekey calls.
//!
//! The wire types follow the Vault `sys/init` and `sys/rekey` endpoints.
//! `HttpControlPlane` is the production adapter; tests drive the same traits
//! with in-memory stubs.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::BootstrapError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub initialized: bool,
}

/// Rekey session as reported by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyStatus {
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub started: bool,
    /// Threshold of the new share set.
    #[serde(default)]
    pub t: u32,
    /// Size of the new share set.
    #[serde(default)]
    pub n: u32,
    /// Unseal keys submitted so far.
    #[serde(default)]
    pub progress: u32,
    /// Unseal keys needed to complete.
    #[serde(default)]
    pub required: u32,
    #[serde(default)]
    pub pgp_fingerprints: Option<Vec<String>>,
}

/// Body shared by `sys/init` and `sys/rekey/init`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRequest {
    pub secret_shares: u32,
    pub secret_threshold: u32,
    pub pgp_keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitResponse {
    /// Hex-encoded, PGP-encrypted shares, in `pgp_keys` order.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

#[derive(Serialize)]
struct RekeyUpdateRequest<'a> {
    key: &'a str,
    nonce: &'a str,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RekeyUpdateResponse {
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub keys_base64: Option<Vec<String>>,
    #[serde(default)]
    pub pgp_fingerprints: Option<Vec<String>>,
}

/// Read-only view of cluster state. No side effects.
pub trait ClusterStateProbe {
    fn status(&self) -> Result<ClusterStatus>;
    fn rekey_status(&self) -> Result<RekeyStatus>;
}

/// Mutating control-plane calls. `initialize` is irreversible.
pub trait ControlPlane: ClusterStateProbe {
    fn initialize(&self, request: &ShareRequest) -> Result<InitResponse>;
    fn rekey_init(&self, request: &ShareRequest) -> Result<RekeyStatus>;
    fn rekey_update(&self, key: &str, nonce: &str) -> Result<RekeyUpdateResponse>;
}

pub struct HttpControlPlane {
    agent: ureq::Agent,
    base: Url,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl HttpControlPlane {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(address)
            .map_err(|e| BootstrapError::config(format!("invalid vault url {}: {}", address, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(BootstrapError::config(format!(
                "vault url must be http(s), got {}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| BootstrapError::config(format!("invalid endpoint {}: {}", path, e)))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| http_failure(path, e, false))?;
        decode(path, response)
    }

    fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        bad_request_is_config: bool,
    ) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self
            .agent
            .put(url.as_str())
            .send_json(body)
            .map_err(|e| http_failure(path, e, bad_request_is_config))?;
        decode(path, response)
    }
}

impl ClusterStateProbe for HttpControlPlane {
    fn status(&self) -> Result<ClusterStatus> {
        self.get("v1/sys/init")
    }

    fn rekey_status(&self) -> Result<RekeyStatus> {
        self.get("v1/sys/rekey/init")
    }
}

impl ControlPlane for HttpControlPlane {
    fn initialize(&self, request: &ShareRequest) -> Result<InitResponse> {
        self.put("v1/sys/init", request, true)
    }

    fn rekey_init(&self, request: &ShareRequest) -> Result<RekeyStatus> {
        self.put("v1/sys/rekey/init", request, true)
    }

    fn rekey_update(&self, key: &str, nonce: &str) -> Result<RekeyUpdateResponse> {
        self.put("v1/sys/rekey/update", &RekeyUpdateRequest { key, nonce }, false)
    }
}

fn decode<T: DeserializeOwned>(path: &str, response: ureq::Response) -> Result<T> {
    response
        .into_json()
        .map_err(|e| BootstrapError::protocol(format!("{}: invalid response body: {}", path, e)))
}

/// Maps a `ureq` failure onto the error taxonomy. A 400 from a call whose
/// body is operator configuration is reported as a configuration error.
pub(crate) fn http_failure(
    context: &str,
    err: ureq::Error,
    bad_request_is_config: bool,
) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let raw = response.into_string().unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&raw)
                .ok()
                .filter(|body| !body.errors.is_empty())
                .map(|body| body.errors.join("; "))
                .unwrap_or(raw);
            let msg = format!("{}: HTTP {}: {}", context, code, detail.trim());
            if code == 400 && bad_request_is_config {
                BootstrapError::config(msg)
            } else {
                BootstrapError::transport(msg)
            }
        }
        ureq::Error::Transport(transport) => {
            BootstrapError::transport(format!("{}: {}", context, transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rekey_status_tolerates_nulls_and_missing_fields() {
        let status: RekeyStatus = serde_json::from_str(
            r#"{"nonce":"","started":false,"t":0,"n":0,"progress":0,"required":3,"pgp_fingerprints":null,"backup":false}"#,
        )
        .unwrap();
        assert!(!status.started);
        assert_eq!(status.required, 3);
        assert_eq!(status.pgp_fingerprints, None);

        let status: RekeyStatus = serde_json::from_str(r#"{"started":true,"nonce":"abc"}"#).unwrap();
        assert_eq!(status.nonce, "abc");
        assert_eq!(status.progress, 0);
    }

    #[test]
    fn share_request_uses_service_field_names() {
        let request = ShareRequest {
            secret_shares: 3,
            secret_threshold: 2,
            pgp_keys: vec!["AQID".to_string()],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["secret_shares"], 3);
        assert_eq!(json["secret_threshold"], 2);
        assert_eq!(json["pgp_keys"][0], "AQID");
    }

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let control =
            HttpControlPlane::new("https://vault.example/prefix", Duration::from_secs(1)).unwrap();
        assert_eq!(
            control.endpoint("v1/sys/init").unwrap().as_str(),
            "https://vault.example/prefix/v1/sys/init"
        );
        assert!(HttpControlPlane::new("ftp://vault.example", Duration::from_secs(1)).is_err());
    }
}
