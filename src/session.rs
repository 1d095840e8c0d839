//! Share-producing sessions against the control plane.
//!
//! Rekey is a multi-step protocol:
//!
//! ```text
//! NotStarted -> Initiated(nonce) -> Collecting(nonce, progress) -> Complete(shares)
//! ```
//!
//! Initialization is the same machine collapsed to one step
//! (`NotStarted -> Complete`). Both paths build their request and bind the
//! returned shares to trustees through the same code, so share `i` always
//! travels with `trustees[i]`.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ClusterConfig;
use crate::control::{ControlPlane, RekeyStatus, ShareRequest};
use crate::error::BootstrapError;
use crate::trustee::Trustee;

/// Bootstrap credential returned once by initialization.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RootCredential(String);

impl RootCredential {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootCredential(<redacted>)")
    }
}

/// One still-encrypted share and the trustee whose key it is encrypted under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareAssignment {
    pub index: usize,
    pub trustee: Trustee,
    /// Hex-encoded ciphertext exactly as the control plane returned it.
    pub share: String,
}

impl ShareAssignment {
    /// Short digest for logs; the share itself is never logged.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.share.as_bytes());
        hex::encode(&hash[..6])
    }
}

/// Shares bound index-by-index to the trustees they were requested for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareSet {
    assignments: Vec<ShareAssignment>,
}

impl ShareSet {
    /// Fails unless there is exactly one hex-decodable share per trustee.
    pub fn bind(shares: Vec<String>, trustees: &[Trustee]) -> Result<Self> {
        if shares.len() != trustees.len() {
            return Err(BootstrapError::protocol(format!(
                "control plane returned {} shares for {} trustees",
                shares.len(),
                trustees.len()
            )));
        }
        let mut assignments = Vec::with_capacity(shares.len());
        for (index, (share, trustee)) in shares.into_iter().zip(trustees).enumerate() {
            let share = share.trim().to_string();
            if share.is_empty() {
                return Err(BootstrapError::protocol(format!("share {} is empty", index)));
            }
            hex::decode(&share).map_err(|e| {
                BootstrapError::protocol(format!("share {} is not hex encoded: {}", index, e))
            })?;
            assignments.push(ShareAssignment {
                index,
                trustee: trustee.clone(),
                share,
            });
        }
        Ok(Self { assignments })
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShareAssignment> {
        self.assignments.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Initiated { nonce: String },
    Collecting { nonce: String, progress: u32 },
    Complete(ShareSet),
}

impl SessionState {
    pub fn nonce(&self) -> Option<&str> {
        match self {
            Self::Initiated { nonce } | Self::Collecting { nonce, .. } => Some(nonce),
            _ => None,
        }
    }

    pub fn progress(&self) -> u32 {
        match self {
            Self::Collecting { progress, .. } => *progress,
            _ => 0,
        }
    }
}

pub struct ShareSession<'a, C: ControlPlane + ?Sized> {
    control: &'a C,
    config: &'a ClusterConfig,
    trustees: &'a [Trustee],
    state: SessionState,
    required: u32,
}

impl<'a, C: ControlPlane + ?Sized> ShareSession<'a, C> {
    pub fn new(control: &'a C, config: &'a ClusterConfig, trustees: &'a [Trustee]) -> Self {
        Self {
            control,
            config,
            trustees,
            state: SessionState::NotStarted,
            required: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Unseal keys the active rekey needs in total.
    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn into_state(self) -> SessionState {
        self.state
    }

    fn request(&self) -> Result<ShareRequest> {
        if self.trustees.len() != self.config.share_count() as usize {
            return Err(BootstrapError::protocol(format!(
                "{} trustees resolved for a {}-share cluster",
                self.trustees.len(),
                self.config.share_count()
            )));
        }
        for (trustee, id) in self.trustees.iter().zip(self.config.trustees()) {
            if &trustee.id != id {
                return Err(BootstrapError::protocol(format!(
                    "trustee order mismatch: expected {}, got {}",
                    id, trustee.id
                )));
            }
        }
        Ok(ShareRequest {
            secret_shares: self.config.share_count() as u32,
            secret_threshold: self.config.threshold() as u32,
            pgp_keys: self.trustees.iter().map(Trustee::key_base64).collect(),
        })
    }

    fn expect_state(&self, wanted: &str, ok: bool) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(BootstrapError::protocol(format!(
                "session is {:?}, expected {}",
                StateName(&self.state),
                wanted
            )))
        }
    }

    /// One-shot initialization. Irreversible: on success the cluster is
    /// initialized and the returned credential is the only copy.
    pub fn initialize(&mut self) -> Result<RootCredential> {
        self.expect_state("NotStarted", matches!(self.state, SessionState::NotStarted))?;
        let request = self.request()?;
        if self.control.status()?.initialized {
            return Err(BootstrapError::precondition(
                "cluster is already initialized; refusing to initialize again",
            ));
        }
        log::info!(
            "initializing: {} shares, threshold {}, {} keys",
            request.secret_shares,
            request.secret_threshold,
            request.pgp_keys.len()
        );
        let response = self.control.initialize(&request)?;
        let root = RootCredential::new(response.root_token);
        let shares = ShareSet::bind(response.keys, self.trustees)?;
        log::info!("cluster initialized with {} shares", shares.len());
        self.state = SessionState::Complete(shares);
        Ok(root)
    }

    /// Opens a new rekey session with the same shape as initialization.
    pub fn start(&mut self) -> Result<&SessionState> {
        self.expect_state("NotStarted", matches!(self.state, SessionState::NotStarted))?;
        let request = self.request()?;
        if !self.control.status()?.initialized {
            return Err(BootstrapError::precondition(
                "cluster is not initialized; cannot rekey",
            ));
        }
        log::info!(
            "starting rekey: {} shares, threshold {}, {} keys",
            request.secret_shares,
            request.secret_threshold,
            request.pgp_keys.len()
        );
        let status = self.control.rekey_init(&request)?;
        if !status.started || status.nonce.is_empty() {
            return Err(BootstrapError::protocol(
                "rekey init did not report a started session with a nonce",
            ));
        }
        self.check_fingerprints(status.pgp_fingerprints.as_deref())?;
        log::info!("rekey started, nonce {}", status.nonce);
        self.required = status.required;
        self.state = SessionState::Initiated {
            nonce: status.nonce,
        };
        Ok(&self.state)
    }

    /// Adopts the session the control plane already has open. `expected_nonce`
    /// is the operator's resume token, if one was given.
    pub fn resume(
        &mut self,
        status: &RekeyStatus,
        expected_nonce: Option<&str>,
    ) -> Result<&SessionState> {
        self.expect_state("NotStarted", matches!(self.state, SessionState::NotStarted))?;
        if !status.started || status.nonce.is_empty() {
            return Err(BootstrapError::protocol("no active rekey session to resume"));
        }
        if let Some(expected) = expected_nonce {
            if expected != status.nonce {
                return Err(BootstrapError::NonceMismatch {
                    expected: expected.to_string(),
                    actual: status.nonce.clone(),
                }
                .into());
            }
        }
        let (n, t) = (
            self.config.share_count() as u32,
            self.config.threshold() as u32,
        );
        if status.n != 0 && (status.n != n || status.t != t) {
            return Err(BootstrapError::protocol(format!(
                "active rekey session is {}-of-{}, this run asks for {}-of-{}",
                status.t, status.n, t, n
            )));
        }
        self.check_fingerprints(status.pgp_fingerprints.as_deref())?;
        log::info!(
            "resuming rekey {} at {}/{}",
            status.nonce,
            status.progress,
            status.required
        );
        self.required = status.required;
        self.state = if status.progress == 0 {
            SessionState::Initiated {
                nonce: status.nonce.clone(),
            }
        } else {
            SessionState::Collecting {
                nonce: status.nonce.clone(),
                progress: status.progress,
            }
        };
        Ok(&self.state)
    }

    /// Submits one unseal key. Completes the session once the control plane
    /// reports the threshold met.
    pub fn submit(&mut self, key: &str) -> Result<&SessionState> {
        let (nonce, progress) = match &self.state {
            SessionState::Initiated { nonce } => (nonce.clone(), 0),
            SessionState::Collecting { nonce, progress } => (nonce.clone(), *progress),
            _ => {
                return Err(BootstrapError::protocol(format!(
                    "cannot submit an unseal key while the session is {:?}",
                    StateName(&self.state)
                )))
            }
        };

        let response = self.control.rekey_update(key, &nonce)?;
        if !response.nonce.is_empty() && response.nonce != nonce {
            return Err(BootstrapError::NonceMismatch {
                expected: nonce,
                actual: response.nonce,
            }
            .into());
        }

        if response.complete {
            let keys = response.keys.ok_or_else(|| {
                BootstrapError::protocol("rekey reported complete without new shares")
            })?;
            self.check_fingerprints(response.pgp_fingerprints.as_deref())?;
            let shares = ShareSet::bind(keys, self.trustees)?;
            log::info!("rekey {} complete, {} new shares", nonce, shares.len());
            self.state = SessionState::Complete(shares);
            return Ok(&self.state);
        }

        let status = self.control.rekey_status()?;
        if !status.started {
            return Err(BootstrapError::protocol(format!(
                "rekey {} is no longer active",
                nonce
            )));
        }
        if status.nonce != nonce {
            return Err(BootstrapError::NonceMismatch {
                expected: nonce,
                actual: status.nonce,
            }
            .into());
        }
        let progress = status.progress.max(progress + 1);
        if status.required != 0 {
            self.required = status.required;
        }
        log::info!("rekey {} progress {}/{}", nonce, progress, self.required);
        self.state = SessionState::Collecting { nonce, progress };
        Ok(&self.state)
    }

    /// Service-reported fingerprints, when present, must match the trustees
    /// position by position.
    fn check_fingerprints(&self, reported: Option<&[String]>) -> Result<()> {
        let Some(reported) = reported.filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        if reported.len() != self.trustees.len() {
            return Err(BootstrapError::protocol(format!(
                "control plane reports {} key fingerprints for {} trustees",
                reported.len(),
                self.trustees.len()
            )));
        }
        for (index, (trustee, fp)) in self.trustees.iter().zip(reported).enumerate() {
            let Some(ours) = trustee.key()?.fingerprint() else {
                log::debug!("trustee {} key is not V4; fingerprint not compared", trustee.id);
                continue;
            };
            if !ours.eq_ignore_ascii_case(fp.trim()) {
                return Err(BootstrapError::protocol(format!(
                    "key {} fingerprint mismatch for trustee {}: service has {}, expected {}",
                    index, trustee.id, fp, ours
                )));
            }
        }
        Ok(())
    }
}

struct StateName<'a>(&'a SessionState);

impl fmt::Debug for StateName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.0 {
            SessionState::NotStarted => "NotStarted",
            SessionState::Initiated { .. } => "Initiated",
            SessionState::Collecting { .. } => "Collecting",
            SessionState::Complete(_) => "Complete",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ClusterStateProbe, ClusterStatus, InitResponse, RekeyUpdateResponse};
    use crate::error::classify;
    use crate::pgp::test_key;
    use crate::trustee::TrusteeId;
    use std::cell::RefCell;

    #[derive(Default)]
    struct ScriptedControl {
        initialized: bool,
        status: RefCell<RekeyStatus>,
        updates: RefCell<Vec<RekeyUpdateResponse>>,
        submitted: RefCell<Vec<(String, String)>>,
    }

    impl ClusterStateProbe for ScriptedControl {
        fn status(&self) -> Result<ClusterStatus> {
            Ok(ClusterStatus {
                initialized: self.initialized,
            })
        }

        fn rekey_status(&self) -> Result<RekeyStatus> {
            Ok(self.status.borrow().clone())
        }
    }

    impl ControlPlane for ScriptedControl {
        fn initialize(&self, request: &ShareRequest) -> Result<InitResponse> {
            Ok(InitResponse {
                keys: (0..request.secret_shares)
                    .map(|i| format!("{:02x}", i))
                    .collect(),
                keys_base64: vec![],
                root_token: "s.root".to_string(),
            })
        }

        fn rekey_init(&self, request: &ShareRequest) -> Result<RekeyStatus> {
            let status = RekeyStatus {
                nonce: "fresh".to_string(),
                started: true,
                t: request.secret_threshold,
                n: request.secret_shares,
                progress: 0,
                required: 2,
                pgp_fingerprints: None,
            };
            *self.status.borrow_mut() = status.clone();
            Ok(status)
        }

        fn rekey_update(&self, key: &str, nonce: &str) -> Result<RekeyUpdateResponse> {
            self.submitted
                .borrow_mut()
                .push((key.to_string(), nonce.to_string()));
            self.status.borrow_mut().progress += 1;
            Ok(self.updates.borrow_mut().remove(0))
        }
    }

    fn fixture(n: usize, threshold: u8) -> (ClusterConfig, Vec<Trustee>) {
        let names: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
        let ids: Vec<TrusteeId> = names.iter().map(|n| TrusteeId::new(n)).collect();
        let trustees = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let uid = format!("<{}@x.com>", id);
                Trustee::new(id.clone(), test_key(i as u8, &[uid.as_str()]))
            })
            .collect();
        (ClusterConfig::new(threshold, ids, "test").unwrap(), trustees)
    }

    #[test]
    fn initialize_binds_shares_in_key_order() {
        let control = ScriptedControl::default();
        let (config, trustees) = fixture(3, 2);
        let mut session = ShareSession::new(&control, &config, &trustees);
        let root = session.initialize().unwrap();
        assert_eq!(root.expose(), "s.root");
        assert_eq!(format!("{:?}", root), "RootCredential(<redacted>)");
        let SessionState::Complete(shares) = session.into_state() else {
            panic!("expected complete session");
        };
        let pairs: Vec<(String, String)> = shares
            .iter()
            .map(|a| (a.trustee.id.0.clone(), a.share.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("t0".to_string(), "00".to_string()),
                ("t1".to_string(), "01".to_string()),
                ("t2".to_string(), "02".to_string()),
            ]
        );
    }

    #[test]
    fn initialize_refuses_an_initialized_cluster() {
        let control = ScriptedControl {
            initialized: true,
            ..Default::default()
        };
        let (config, trustees) = fixture(1, 1);
        let err = ShareSession::new(&control, &config, &trustees)
            .initialize()
            .unwrap_err();
        assert!(matches!(classify(&err), Some(BootstrapError::Precondition(_))));
    }

    #[test]
    fn start_requires_an_initialized_cluster() {
        let control = ScriptedControl::default();
        let (config, trustees) = fixture(2, 1);
        let err = ShareSession::new(&control, &config, &trustees)
            .start()
            .unwrap_err();
        assert!(matches!(classify(&err), Some(BootstrapError::Precondition(_))));
    }

    #[test]
    fn rekey_walks_initiated_collecting_complete() {
        let control = ScriptedControl {
            initialized: true,
            updates: RefCell::new(vec![
                RekeyUpdateResponse {
                    nonce: "fresh".to_string(),
                    complete: false,
                    ..Default::default()
                },
                RekeyUpdateResponse {
                    nonce: "fresh".to_string(),
                    complete: true,
                    keys: Some(vec!["aa".to_string(), "bb".to_string()]),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let (config, trustees) = fixture(2, 2);
        let mut session = ShareSession::new(&control, &config, &trustees);

        assert_eq!(
            session.start().unwrap(),
            &SessionState::Initiated {
                nonce: "fresh".to_string()
            }
        );
        assert_eq!(session.required(), 2);
        assert_eq!(
            session.submit("key-1").unwrap(),
            &SessionState::Collecting {
                nonce: "fresh".to_string(),
                progress: 1
            }
        );
        assert!(matches!(
            session.submit("key-2").unwrap(),
            SessionState::Complete(shares) if shares.len() == 2
        ));
        assert!(session.submit("key-3").is_err());
        assert_eq!(
            control.submitted.borrow().as_slice(),
            &[
                ("key-1".to_string(), "fresh".to_string()),
                ("key-2".to_string(), "fresh".to_string())
            ]
        );
    }

    #[test]
    fn start_is_only_valid_once() {
        let control = ScriptedControl {
            initialized: true,
            ..Default::default()
        };
        let (config, trustees) = fixture(2, 2);
        let mut session = ShareSession::new(&control, &config, &trustees);
        session.start().unwrap();
        assert!(session.start().is_err());
    }

    #[test]
    fn echoed_nonce_must_match() {
        let control = ScriptedControl {
            initialized: true,
            updates: RefCell::new(vec![RekeyUpdateResponse {
                nonce: "other".to_string(),
                complete: false,
                ..Default::default()
            }]),
            ..Default::default()
        };
        let (config, trustees) = fixture(2, 2);
        let mut session = ShareSession::new(&control, &config, &trustees);
        session.start().unwrap();
        let err = session.submit("key").unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BootstrapError::NonceMismatch { .. })
        ));
    }

    #[test]
    fn resume_checks_operator_nonce_and_shape() {
        let control = ScriptedControl {
            initialized: true,
            ..Default::default()
        };
        let (config, trustees) = fixture(3, 2);
        let status = RekeyStatus {
            nonce: "abc".to_string(),
            started: true,
            t: 2,
            n: 3,
            progress: 1,
            required: 3,
            pgp_fingerprints: None,
        };

        let mut session = ShareSession::new(&control, &config, &trustees);
        let err = session.resume(&status, Some("xyz")).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BootstrapError::NonceMismatch { .. })
        ));

        let mut session = ShareSession::new(&control, &config, &trustees);
        assert_eq!(
            session.resume(&status, Some("abc")).unwrap(),
            &SessionState::Collecting {
                nonce: "abc".to_string(),
                progress: 1
            }
        );

        let wrong_shape = RekeyStatus { n: 5, ..status };
        let mut session = ShareSession::new(&control, &config, &trustees);
        assert!(session.resume(&wrong_shape, None).is_err());
    }

    #[test]
    fn fingerprints_must_line_up_with_trustees() {
        let control = ScriptedControl {
            initialized: true,
            ..Default::default()
        };
        let (config, trustees) = fixture(2, 1);
        let fps: Vec<String> = trustees
            .iter()
            .map(|t| t.key().unwrap().fingerprint().unwrap())
            .collect();
        let status = RekeyStatus {
            nonce: "abc".to_string(),
            started: true,
            t: 1,
            n: 2,
            progress: 0,
            required: 1,
            pgp_fingerprints: Some(fps.clone()),
        };
        let mut session = ShareSession::new(&control, &config, &trustees);
        session.resume(&status, None).unwrap();

        let swapped = RekeyStatus {
            pgp_fingerprints: Some(vec![fps[1].clone(), fps[0].clone()]),
            ..status
        };
        let mut session = ShareSession::new(&control, &config, &trustees);
        let err = session.resume(&swapped, None).unwrap_err();
        assert!(matches!(classify(&err), Some(BootstrapError::Protocol(_))));
    }

    #[test]
    fn share_set_rejects_misaligned_or_undecodable_shares() {
        let (_, trustees) = fixture(2, 1);
        assert!(ShareSet::bind(vec!["aa".to_string()], &trustees).is_err());
        assert!(ShareSet::bind(vec!["aa".to_string(), "zz".to_string()], &trustees).is_err());
        let set = ShareSet::bind(vec!["aa".to_string(), " bb\n".to_string()], &trustees).unwrap();
        assert_eq!(set.iter().nth(1).unwrap().share, "bb");
        assert_eq!(set.iter().next().unwrap().digest().len(), 12);
    }
}
