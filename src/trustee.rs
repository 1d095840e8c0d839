//! Trustees and public-key resolution.
//!
//! A trustee is an account name at a key-lookup service. Resolution turns the
//! operator's ordered list of names into an ordered list of keys; share `i`
//! is later encrypted for `trustees[i]`, so the output must line up with the
//! input exactly and must never be partial.

use anyhow::{anyhow, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::control::http_failure;
use crate::error::BootstrapError;
use crate::pgp::{self, PublicKey};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrusteeId(pub String);

impl TrusteeId {
    pub fn new(id: &str) -> Self {
        Self(id.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrusteeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A trustee with resolved binary public-key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trustee {
    pub id: TrusteeId,
    pub public_key: Vec<u8>,
}

impl Trustee {
    pub fn new(id: TrusteeId, public_key: Vec<u8>) -> Self {
        Self { id, public_key }
    }

    /// Key material as the control plane expects it: unarmored, standard base64.
    pub fn key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.public_key)
    }

    pub fn key(&self) -> Result<PublicKey> {
        PublicKey::parse(&self.public_key)
            .map_err(|e| anyhow!("public key of trustee {} is unreadable: {}", self.id, e))
    }
}

/// A service that maps account names to ASCII-armored public keys.
pub trait KeyLookup {
    /// Returns `None` when the service has no key for `id`.
    fn fetch(&self, id: &TrusteeId) -> Result<Option<String>>;

    /// Batch form; services that can answer many names in one call override it.
    fn fetch_all(&self, ids: &[TrusteeId]) -> Result<HashMap<TrusteeId, String>> {
        let mut out = HashMap::new();
        for id in ids {
            if let Some(armored) = self.fetch(id)? {
                out.insert(id.clone(), armored);
            }
        }
        Ok(out)
    }
}

pub struct TrusteeResolver<'a, L: KeyLookup + ?Sized> {
    lookup: &'a L,
}

impl<'a, L: KeyLookup + ?Sized> TrusteeResolver<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup }
    }

    /// All-or-nothing: every id resolves to a readable key that names at
    /// least one mail address, in input order, or the call fails listing
    /// every id that did not.
    pub fn resolve(&self, ids: &[TrusteeId]) -> Result<Vec<Trustee>> {
        let mut found = self.lookup.fetch_all(ids)?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains_key(*id))
            .map(|id| id.0.clone())
            .collect();
        if !missing.is_empty() {
            return Err(BootstrapError::Resolution { missing }.into());
        }

        let mut trustees = Vec::with_capacity(ids.len());
        let mut no_address = Vec::new();
        for id in ids {
            let armored = found
                .remove(id)
                .ok_or_else(|| BootstrapError::Resolution {
                    missing: vec![id.0.clone()],
                })?;
            let public_key = pgp::dearmor(&armored).map_err(|e| {
                BootstrapError::protocol(format!("key for trustee {} is not valid armor: {}", id, e))
            })?;
            let trustee = Trustee::new(id.clone(), public_key);
            let key = trustee
                .key()
                .map_err(|e| BootstrapError::protocol(e.to_string()))?;
            log::info!(
                "resolved trustee {} ({} identities, fingerprint {})",
                id,
                key.identities().len(),
                key.fingerprint().as_deref().unwrap_or("n/a")
            );
            if key.emails().is_empty() {
                log::warn!("key of trustee {} declares no mail address", id);
                no_address.push(id.0.clone());
            }
            trustees.push(trustee);
        }
        if !no_address.is_empty() {
            return Err(BootstrapError::NoAddress {
                trustees: no_address,
            }
            .into());
        }
        Ok(trustees)
    }
}

/// Keybase user lookup (`/_/api/1.0/user/lookup.json`).
pub struct KeybaseLookup {
    agent: ureq::Agent,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: LookupStatus,
    #[serde(default)]
    them: Option<Vec<Option<LookupUser>>>,
}

#[derive(Debug, Deserialize)]
struct LookupStatus {
    code: i64,
    #[serde(default)]
    desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupUser {
    basics: Option<LookupBasics>,
    public_keys: Option<LookupKeys>,
}

#[derive(Debug, Deserialize)]
struct LookupBasics {
    username: String,
}

#[derive(Debug, Deserialize)]
struct LookupKeys {
    primary: Option<LookupPrimaryKey>,
}

#[derive(Debug, Deserialize)]
struct LookupPrimaryKey {
    bundle: String,
}

const KEYBASE_OK: i64 = 0;
const KEYBASE_NOT_FOUND: i64 = 205;

impl KeybaseLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| BootstrapError::config(format!("invalid keybase url {}: {}", base_url, e)))?;
        let endpoint = base
            .join("/_/api/1.0/user/lookup.json")
            .map_err(|e| BootstrapError::config(format!("invalid keybase url {}: {}", base_url, e)))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, endpoint })
    }
}

impl KeyLookup for KeybaseLookup {
    fn fetch(&self, id: &TrusteeId) -> Result<Option<String>> {
        Ok(self.fetch_all(std::slice::from_ref(id))?.remove(id))
    }

    fn fetch_all(&self, ids: &[TrusteeId]) -> Result<HashMap<TrusteeId, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let usernames = ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",");
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("usernames", &usernames)
            .append_pair("fields", "public_keys");

        log::debug!("looking up {} keybase account(s)", ids.len());
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| http_failure("keybase lookup", e, false))?;
        let body: LookupResponse = response
            .into_json()
            .map_err(|e| BootstrapError::protocol(format!("keybase lookup: invalid response: {}", e)))?;

        match body.status.code {
            KEYBASE_OK | KEYBASE_NOT_FOUND => {}
            code => {
                return Err(BootstrapError::transport(format!(
                    "keybase lookup failed with status {}: {}",
                    code,
                    body.status.desc.unwrap_or_default()
                )))
            }
        }

        let mut out = HashMap::new();
        for user in body.them.unwrap_or_default().into_iter().flatten() {
            let (Some(basics), Some(bundle)) = (
                user.basics,
                user.public_keys.and_then(|keys| keys.primary).map(|p| p.bundle),
            ) else {
                continue;
            };
            if let Some(id) = ids
                .iter()
                .find(|id| id.as_str().eq_ignore_ascii_case(&basics.username))
            {
                out.insert(id.clone(), bundle);
            }
        }
        Ok(out)
    }
}
