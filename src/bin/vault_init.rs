//! vault_init - initialize or rekey a Vault cluster and mail the encrypted
//! unseal-key shares to their trustees.
//!
//! Exit codes: 0 done, 1 fatal error (nothing or only part of the protocol
//! ran), 2 shares produced but some deliveries failed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use zeroize::Zeroizing;

use vault_quorum::{
    Bootstrap, CliOverrides, DistributionReport, HttpControlPlane, KeybaseLookup, Mode, Operator,
    RekeyProgress, RootCredential, RunConfig, RunOutcome, SmtpConfig, SmtpMailer,
};

#[derive(Parser, Debug)]
#[command(
    name = "vault_init",
    about = "Initialize or rekey a Vault cluster and mail PGP-encrypted shares to trustees"
)]
struct Args {
    /// From email address
    #[arg(long)]
    smtp_from: Option<String>,

    /// SMTP relay in <host>:<port> format [default: localhost:25]
    #[arg(long)]
    smtp_host: Option<String>,

    /// Vault cluster url in http(s)://<host>:<port> format [default: http://127.0.0.1:8200]
    #[arg(long)]
    vault_url: Option<String>,

    /// Key lookup service base url [default: https://keybase.io]
    #[arg(long)]
    keybase_url: Option<String>,

    /// Comma-separated list of keybase accounts, one share each
    #[arg(long)]
    keybase: Option<String>,

    /// Number of shares needed to unseal [default: 3]
    #[arg(long)]
    secret_threshold: Option<u8>,

    /// Name used for the cluster in mails [default: vault url]
    #[arg(long)]
    cluster_name: Option<String>,

    /// Network timeout in seconds [default: 30]
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Rekey an initialized cluster instead of initializing it
    #[arg(long)]
    rekey: bool,

    /// Nonce of the rekey session to resume
    #[arg(long)]
    nonce: Option<String>,

    /// Read the unseal key from this file instead of stdin
    #[arg(long, env = "VAULT_INIT_UNSEAL_KEY_FILE")]
    unseal_key_file: Option<PathBuf>,
}

impl From<Args> for CliOverrides {
    fn from(args: Args) -> Self {
        Self {
            smtp_from: args.smtp_from,
            smtp_host: args.smtp_host,
            vault_url: args.vault_url,
            keybase_url: args.keybase_url,
            keybase: args.keybase,
            secret_threshold: args.secret_threshold,
            cluster_name: args.cluster_name,
            timeout_secs: args.timeout_secs,
            rekey: args.rekey,
            nonce: args.nonce,
            unseal_key_file: args.unseal_key_file,
        }
    }
}

/// Unseal key from a file, a no-echo terminal prompt, or one line of piped
/// stdin; root token to stdout.
struct ConsoleOperator {
    unseal_key_file: Option<PathBuf>,
}

impl Operator for ConsoleOperator {
    fn unseal_key(&mut self, session: Option<&RekeyProgress>) -> Result<Zeroizing<String>> {
        if let Some(path) = &self.unseal_key_file {
            let key = Zeroizing::new(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading unseal key from {}", path.display()))?,
            );
            return Ok(Zeroizing::new(key.trim().to_string()));
        }
        let prompt = match session {
            Some(progress) => format!(
                "Rekey {} in progress ({}/{}), please enter your unseal key: ",
                progress.nonce, progress.progress, progress.required
            ),
            None => "Starting a new rekey, please enter your unseal key: ".to_string(),
        };

        if std::io::stdin().is_terminal() {
            let key = Zeroizing::new(
                rpassword::prompt_password(prompt).context("reading unseal key from terminal")?,
            );
            return Ok(Zeroizing::new(key.trim().to_string()));
        }

        eprint!("{}", prompt);
        std::io::stderr().flush()?;
        let key = read_key_line(&mut std::io::stdin().lock());
        eprintln!();
        key
    }

    fn root_credential_issued(&mut self, root: &RootCredential) {
        println!();
        println!("Root token (store it now, it is not shown again): {}", root.expose());
        println!();
    }
}

/// One line of piped input, trimmed. EOF means no key was given.
fn read_key_line(reader: &mut impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    if reader.read_line(&mut line)? == 0 {
        return Err(anyhow!("no unseal key provided on stdin"));
    }
    Ok(Zeroizing::new(line.trim().to_string()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = RunConfig::load(args.into())?;
    let cluster = cfg.cluster_config()?;

    println!("=== Vault {} ===", match cfg.mode {
        Mode::Initialize => "initialization",
        Mode::Rekey { .. } => "rekey",
    });
    println!("Cluster:          {}", cluster.cluster_name());
    println!("Trustees:         {}", cfg.keybase_users.join(", "));
    println!("Total shares:     {}", cluster.share_count());
    println!("Secret threshold: {}", cluster.threshold());
    println!();

    log::info!("checking smtp relay {}", cfg.smtp_host);
    let mailer = SmtpMailer::new(SmtpConfig::new(&cfg.smtp_host, &cfg.smtp_from, cfg.timeout));
    mailer.verify_relay()?;

    let control = HttpControlPlane::new(&cfg.vault_url, cfg.timeout)?;
    let lookup = KeybaseLookup::new(&cfg.keybase_url, cfg.timeout)?;
    let mut operator = ConsoleOperator {
        unseal_key_file: cfg.unseal_key_file.clone(),
    };

    let outcome = Bootstrap::new(cluster, &control, &lookup, &mailer).run(&cfg.mode, &mut operator)?;
    match &outcome {
        RunOutcome::AlreadyInitialized => {
            println!("Cluster is already initialized, nothing to do");
        }
        RunOutcome::RekeyPending(progress) => {
            println!("Unseal key accepted: {}/{}", progress.progress, progress.required);
            println!("Next trustee resumes with:");
            println!("  vault_init --rekey --nonce {} ...", progress.nonce);
        }
        RunOutcome::Initialized { .. } | RunOutcome::Rekeyed { .. } => {}
    }

    if let Some(report) = outcome.report() {
        print_report(report);
        if !report.is_clean() {
            std::process::exit(2);
        }
    }
    Ok(())
}

fn print_report(report: &DistributionReport) {
    println!("=== Distribution ===");
    for delivery in &report.delivered {
        println!(
            "  share {} ({}) -> {}",
            delivery.share_index, delivery.trustee, delivery.recipient
        );
    }
    println!("{}", report.summary());
    for failure in &report.failures {
        println!(
            "  FAILED share {} ({}) -> {}: {}",
            failure.share_index,
            failure.trustee,
            failure.recipient.as_deref().unwrap_or("<no address>"),
            failure.reason
        );
        println!("    {}", failure.share);
    }
    if !report.is_clean() {
        println!("Resend the failed shares manually; they are still encrypted for their trustee.");
    }
}
