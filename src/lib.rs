//! Vault quorum bootstrap
//!
//! Initializes or rekeys a Vault cluster so that no single operator ever sees
//! the unseal key. Each share is encrypted by Vault under one trustee's PGP key
//! and mailed, still encrypted, to every address on that key.
//!
//! # Flow
//!
//! 1. Probe the cluster (`control`).
//! 2. Resolve trustee keys, all or nothing, in operator order (`trustee`, `pgp`).
//! 3. Initialize, or start/resume a rekey and submit one unseal key (`session`).
//! 4. Mail share `i` to the addresses of trustee `i` (`distribute`, `mail`).
//!
//! # Invariants
//!
//! - Share `i` is encrypted under trustee `i`'s key and only ever sent to
//!   addresses declared by that key.
//! - Threshold and trustee list are validated before any network call.
//! - Initialize is attempted only on an uninitialized cluster.
//! - At most one rekey session is driven per run, pinned to one nonce.
//! - A failed delivery never stops delivery to the remaining recipients.

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod distribute;
pub mod error;
pub mod mail;
pub mod pgp;
pub mod session;
pub mod trustee;

pub use bootstrap::{Bootstrap, Operator, RekeyProgress, RunOutcome};
pub use config::{CliOverrides, ClusterConfig, Mode, RunConfig};
pub use control::{
    ClusterStateProbe, ClusterStatus, ControlPlane, HttpControlPlane, InitResponse, RekeyStatus,
    RekeyUpdateResponse, ShareRequest,
};
pub use distribute::{
    Delivery, DeliveryFailure, DistributionReport, Mailer, Message, MessageTemplate,
    ShareDistributor,
};
pub use error::{classify, BootstrapError};
pub use mail::{SmtpConfig, SmtpMailer};
pub use session::{RootCredential, SessionState, ShareAssignment, ShareSession, ShareSet};
pub use trustee::{KeyLookup, KeybaseLookup, Trustee, TrusteeId, TrusteeResolver};
