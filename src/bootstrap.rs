//! Run orchestration: probe the cluster, pick a branch, produce shares,
//! hand them to the distributor.

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use crate::config::{ClusterConfig, Mode};
use crate::control::ControlPlane;
use crate::distribute::{DistributionReport, Mailer, MessageTemplate, ShareDistributor};
use crate::error::BootstrapError;
use crate::session::{RootCredential, SessionState, ShareSession};
use crate::trustee::{KeyLookup, Trustee, TrusteeResolver};

/// Where an active rekey stands, as shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RekeyProgress {
    pub nonce: String,
    pub progress: u32,
    pub required: u32,
}

/// The human side of the run. Obtaining key material and keeping the root
/// credential are the operator's business, not the orchestrator's.
pub trait Operator {
    /// One unseal key. `session` is the rekey being resumed, or `None` when a
    /// new session will be opened once the key is in hand.
    fn unseal_key(&mut self, session: Option<&RekeyProgress>) -> Result<Zeroizing<String>>;

    /// Called once, right after initialization and before any share is sent.
    fn root_credential_issued(&mut self, root: &RootCredential);
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Initialize was requested but the cluster already is; nothing was done.
    AlreadyInitialized,
    Initialized {
        root: RootCredential,
        report: DistributionReport,
    },
    /// The submitted key was accepted; more are needed before new shares exist.
    RekeyPending(RekeyProgress),
    Rekeyed { report: DistributionReport },
}

impl RunOutcome {
    pub fn report(&self) -> Option<&DistributionReport> {
        match self {
            Self::Initialized { report, .. } | Self::Rekeyed { report } => Some(report),
            _ => None,
        }
    }
}

pub struct Bootstrap<'a, C: ?Sized, L: ?Sized, M: ?Sized> {
    config: ClusterConfig,
    control: &'a C,
    lookup: &'a L,
    mailer: &'a M,
}

impl<'a, C, L, M> Bootstrap<'a, C, L, M>
where
    C: ControlPlane + ?Sized,
    L: KeyLookup + ?Sized,
    M: Mailer + ?Sized,
{
    pub fn new(config: ClusterConfig, control: &'a C, lookup: &'a L, mailer: &'a M) -> Self {
        Self {
            config,
            control,
            lookup,
            mailer,
        }
    }

    pub fn run(&self, mode: &Mode, operator: &mut dyn Operator) -> Result<RunOutcome> {
        log::info!("checking cluster state");
        let status = self.control.status().context("checking cluster state")?;
        log::info!("cluster initialized: {}", status.initialized);

        match (mode, status.initialized) {
            (Mode::Initialize, true) => {
                log::info!("cluster is already initialized, nothing to do");
                Ok(RunOutcome::AlreadyInitialized)
            }
            (Mode::Initialize, false) => self.initialize(operator),
            (Mode::Rekey { .. }, false) => Err(BootstrapError::precondition(
                "cluster is not initialized; cannot rekey",
            )),
            (Mode::Rekey { nonce }, true) => self.rekey(nonce.as_deref(), operator),
        }
    }

    fn resolve(&self) -> Result<Vec<Trustee>> {
        TrusteeResolver::new(self.lookup)
            .resolve(self.config.trustees())
            .context("resolving trustee keys")
    }

    fn initialize(&self, operator: &mut dyn Operator) -> Result<RunOutcome> {
        let trustees = self.resolve()?;
        // Check and act are separate calls; two concurrent operators can both
        // pass the check. The control plane refuses the second init.
        let mut session = ShareSession::new(self.control, &self.config, &trustees);
        let root = session.initialize()?;
        operator.root_credential_issued(&root);

        let SessionState::Complete(shares) = session.into_state() else {
            return Err(BootstrapError::protocol("initialization did not complete"));
        };
        let report = ShareDistributor::new(self.mailer).distribute(
            &shares,
            &MessageTemplate::initialization(self.config.cluster_name()),
        );
        Ok(RunOutcome::Initialized { root, report })
    }

    fn rekey(&self, nonce: Option<&str>, operator: &mut dyn Operator) -> Result<RunOutcome> {
        let trustees = self.resolve()?;
        let mut session = ShareSession::new(self.control, &self.config, &trustees);

        let status = self.control.rekey_status().context("checking rekey state")?;
        let active = if status.started {
            session.resume(&status, nonce)?;
            Some(RekeyProgress {
                nonce: status.nonce.clone(),
                progress: session.state().progress(),
                required: session.required(),
            })
        } else if let Some(nonce) = nonce {
            return Err(BootstrapError::precondition(format!(
                "no rekey session is active (requested nonce {}); run without a nonce to start one",
                nonce
            )));
        } else {
            None
        };

        // No rekey_init until a usable key is in hand.
        let key = operator.unseal_key(active.as_ref())?;
        if key.trim().is_empty() {
            return Err(BootstrapError::config("unseal key cannot be empty"));
        }
        if active.is_none() {
            session.start()?;
        }
        session.submit(key.trim())?;
        drop(key);

        let required = session.required();
        match session.into_state() {
            SessionState::Complete(shares) => {
                let report = ShareDistributor::new(self.mailer)
                    .distribute(&shares, &MessageTemplate::rekey(self.config.cluster_name()));
                Ok(RunOutcome::Rekeyed { report })
            }
            SessionState::Collecting { nonce, progress } => {
                log::info!(
                    "rekey {} needs more unseal keys ({}/{})",
                    nonce,
                    progress,
                    required
                );
                Ok(RunOutcome::RekeyPending(RekeyProgress {
                    nonce,
                    progress,
                    required,
                }))
            }
            _ => Err(BootstrapError::protocol(
                "rekey submission left the session neither collecting nor complete",
            )),
        }
    }
}
