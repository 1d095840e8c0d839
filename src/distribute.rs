//! Fan-out of encrypted shares to trustee mailboxes.
//!
//! Every address declared by trustee `i`'s key receives share `i` and
//! nothing else. A failed send is recorded and the fan-out moves on.

use anyhow::Result;

use crate::session::{ShareAssignment, ShareSet};
use crate::trustee::TrusteeId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// Outbound mail transport.
pub trait Mailer {
    fn send(&self, recipient: &str, message: &Message) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageTemplate {
    subject: String,
    headline: String,
    cluster_name: String,
}

impl MessageTemplate {
    pub fn initialization(cluster_name: &str) -> Self {
        Self {
            subject: "Vault initialization!".to_string(),
            headline: "was initialized".to_string(),
            cluster_name: cluster_name.to_string(),
        }
    }

    pub fn rekey(cluster_name: &str) -> Self {
        Self {
            subject: "Vault rekey!".to_string(),
            headline: "was rekeyed".to_string(),
            cluster_name: cluster_name.to_string(),
        }
    }

    pub fn render(&self, share: &str) -> Message {
        let body = format!(
            "The vault cluster {cluster} {headline}.\n\
             Below is your share of the unseal key. It is encrypted with your gpg key;\n\
             decrypt it locally:\n\
             ---COMMAND---\n\
             \n\
             echo \"{share}\" | xxd -r -p | gpg\n\
             \n\
             ---COMMAND---\n",
            cluster = self.cluster_name,
            headline = self.headline,
            share = share,
        );
        Message {
            subject: self.subject.clone(),
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub share_index: usize,
    pub trustee: TrusteeId,
    pub recipient: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub share_index: usize,
    pub trustee: TrusteeId,
    /// `None` when the trustee's key yielded no address to try.
    pub recipient: Option<String>,
    pub reason: String,
    /// The encrypted share, so the operator can resend it by hand.
    pub share: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub shares: usize,
    pub delivered: Vec<Delivery>,
    pub failures: Vec<DeliveryFailure>,
}

impl DistributionReport {
    pub fn recipients_notified(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} shares distributed, {} failures",
            self.shares,
            self.failures.len()
        )
    }
}

pub struct ShareDistributor<'a, M: Mailer + ?Sized> {
    mailer: &'a M,
}

impl<'a, M: Mailer + ?Sized> ShareDistributor<'a, M> {
    pub fn new(mailer: &'a M) -> Self {
        Self { mailer }
    }

    pub fn distribute(&self, shares: &ShareSet, template: &MessageTemplate) -> DistributionReport {
        let mut report = DistributionReport {
            shares: shares.len(),
            ..DistributionReport::default()
        };
        for assignment in shares.iter() {
            self.distribute_one(assignment, template, &mut report);
        }
        log::info!(
            "distribution finished: {} ({} recipients notified)",
            report.summary(),
            report.recipients_notified()
        );
        report
    }

    fn distribute_one(
        &self,
        assignment: &ShareAssignment,
        template: &MessageTemplate,
        report: &mut DistributionReport,
    ) {
        let trustee = &assignment.trustee;
        let recipients = match trustee.key() {
            Ok(key) => {
                for identity in key.identities().iter().filter(|i| i.email.is_none()) {
                    log::warn!(
                        "trustee {}: user id {:?} names no mail address, skipped",
                        trustee.id,
                        identity.user_id
                    );
                }
                key.emails()
            }
            Err(err) => {
                log::warn!("share {}: {}", assignment.index, err);
                report.failures.push(DeliveryFailure {
                    share_index: assignment.index,
                    trustee: trustee.id.clone(),
                    recipient: None,
                    reason: err.to_string(),
                    share: assignment.share.clone(),
                });
                return;
            }
        };
        if recipients.is_empty() {
            log::warn!(
                "share {}: key of trustee {} declares no email address",
                assignment.index,
                trustee.id
            );
            report.failures.push(DeliveryFailure {
                share_index: assignment.index,
                trustee: trustee.id.clone(),
                recipient: None,
                reason: "public key declares no email address".to_string(),
                share: assignment.share.clone(),
            });
            return;
        }

        let message = template.render(&assignment.share);
        for recipient in recipients {
            log::info!(
                "sending share {} ({}) of trustee {} to {}",
                assignment.index,
                assignment.digest(),
                trustee.id,
                recipient
            );
            match self.mailer.send(&recipient, &message) {
                Ok(()) => report.delivered.push(Delivery {
                    share_index: assignment.index,
                    trustee: trustee.id.clone(),
                    recipient,
                }),
                Err(err) => {
                    log::warn!("delivery to {} failed: {:#}", recipient, err);
                    report.failures.push(DeliveryFailure {
                        share_index: assignment.index,
                        trustee: trustee.id.clone(),
                        recipient: Some(recipient),
                        reason: format!("{:#}", err),
                        share: assignment.share.clone(),
                    });
                }
            }
        }
    }
}
