use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sb_install::config::{Config, ConfigOverrides};
use sb_install::enroll::{self, EfivarfsStore, EnrollOutcome, TrustBundle};
use sb_install::esp::EspPaths;
use sb_install::gc::{self, RetentionPolicy};
use sb_install::install::{Enrollment, Installer};
use sb_install::preflight;
use sb_install::signer::SbsignSigner;
use sb_install::stage::hex;
use sb_install::verify;

#[derive(Parser)]
#[command(
    name = "sb-install",
    version,
    about = "Install NixOS generations as signed Secure Boot entries"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage, build, sign and write boot entries, then collect garbage
    Install(InstallArgs),
    /// Enroll the PKI bundle's keys into the firmware
    Enroll(EnrollArgs),
    /// Check that boot entries still match the kernels and initrds they bind
    Verify(VerifyArgs),
    /// Apply the configuration limit without installing anything
    Gc(GcArgs),
}

#[derive(Args)]
struct ConfigArg {
    /// Configuration file [default: /etc/sb-install/config.toml]
    #[arg(long, env = "SB_INSTALL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct InstallArgs {
    #[command(flatten)]
    config: ConfigArg,
    #[arg(long)]
    esp: Option<PathBuf>,
    /// Unsigned base stub
    #[arg(long)]
    stub: Option<PathBuf>,
    #[arg(long)]
    pki_bundle: Option<PathBuf>,
    #[arg(long)]
    configuration_limit: Option<NonZeroUsize>,
    #[arg(long, conflicts_with = "no_enroll_keys")]
    enroll_keys: bool,
    #[arg(long)]
    no_enroll_keys: bool,
    /// Generation links to install; all generations in the profile when omitted
    links: Vec<PathBuf>,
}

#[derive(Args)]
struct EnrollArgs {
    #[command(flatten)]
    config: ConfigArg,
    #[arg(long)]
    pki_bundle: Option<PathBuf>,
    #[arg(long)]
    efivars: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    #[command(flatten)]
    config: ConfigArg,
    #[arg(long)]
    esp: Option<PathBuf>,
    /// Entries to check; all entries on the ESP when omitted
    entries: Vec<PathBuf>,
}

#[derive(Args)]
struct GcArgs {
    #[command(flatten)]
    config: ConfigArg,
    #[arg(long)]
    esp: Option<PathBuf>,
    #[arg(long)]
    configuration_limit: Option<NonZeroUsize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Install(args) => install(args),
        Commands::Enroll(args) => enroll_keys(args),
        Commands::Verify(args) => verify_entries(args),
        Commands::Gc(args) => collect(args),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config: &ConfigArg, overrides: ConfigOverrides) -> Result<Config> {
    Ok(Config::load(config.config.as_deref())?.apply(overrides))
}

fn install(args: InstallArgs) -> Result<()> {
    let enroll_keys = match (args.enroll_keys, args.no_enroll_keys) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    };
    let config = load_config(
        &args.config,
        ConfigOverrides {
            esp: args.esp,
            stub: args.stub,
            pki_bundle: args.pki_bundle,
            configuration_limit: args.configuration_limit,
            enroll_keys,
            efivars_dir: None,
        },
    )?;
    if !config.enable {
        info!("installer disabled in configuration; nothing to do");
        return Ok(());
    }

    let stub_path = config.require_stub()?;
    let bundle = TrustBundle::open(config.require_pki_bundle()?)?;
    preflight::check_signing_tools()?;

    let base_stub = fs::read(stub_path)
        .with_context(|| format!("reading base stub '{}'", stub_path.display()))?;
    let (key, cert) = bundle.signing_key();
    let signer = SbsignSigner::new(key, cert);
    let mut store = EfivarfsStore::new(&config.efivars_dir);

    let mut installer = Installer::new(
        EspPaths::new(&config.esp),
        &config.store_dir,
        &config.profiles_dir,
        base_stub,
        &signer,
    )
    .with_policy(RetentionPolicy::new(config.configuration_limit))
    .with_enrollment(Enrollment {
        store: &mut store,
        bundle: &bundle,
        enroll_keys: config.enroll_keys,
    });
    if let Some(bootloader) = &config.bootloader {
        installer = installer.with_bootloader(bootloader);
    }

    let report = installer.run(&args.links)?;
    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("  {failure}");
        }
        bail!(
            "{} of {} generation(s) failed to install",
            failures.len(),
            report.generations.len()
        );
    }
    println!(
        "Installed {} generation(s){}",
        report.generations.len(),
        if report.changed() { "" } else { " (no changes)" }
    );
    Ok(())
}

fn enroll_keys(args: EnrollArgs) -> Result<()> {
    let config = load_config(
        &args.config,
        ConfigOverrides {
            pki_bundle: args.pki_bundle,
            efivars_dir: args.efivars,
            ..Default::default()
        },
    )?;
    let bundle = TrustBundle::open(config.require_pki_bundle()?)?;
    let mut store = EfivarfsStore::new(&config.efivars_dir);

    // An explicit `enroll` always enrolls, whatever `enroll_keys` says.
    match enroll::enroll(&mut store, &bundle, true)? {
        EnrollOutcome::Enrolled => println!("Enrolled keys from {}", bundle.root.display()),
        EnrollOutcome::AlreadyEnrolled => println!("Keys already enrolled"),
        EnrollOutcome::Skipped => {}
    }
    Ok(())
}

fn verify_entries(args: VerifyArgs) -> Result<()> {
    let config = load_config(
        &args.config,
        ConfigOverrides {
            esp: args.esp,
            ..Default::default()
        },
    )?;
    let esp = EspPaths::new(&config.esp);

    let results = if args.entries.is_empty() {
        verify::verify_all(&esp)?
    } else {
        args.entries
            .into_iter()
            .map(|entry| {
                let result = verify::verify_entry(&esp, &entry);
                (entry, result)
            })
            .collect()
    };

    let mut failed = 0usize;
    for (entry, result) in &results {
        match result {
            Ok(params) => println!("OK    {} ({})", display_name(entry), short(&params.initrd_hash)),
            Err(err) => {
                failed += 1;
                println!("FAIL  {}: {err:#}", display_name(entry));
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} entries failed verification", results.len());
    }
    Ok(())
}

fn collect(args: GcArgs) -> Result<()> {
    let config = load_config(
        &args.config,
        ConfigOverrides {
            esp: args.esp,
            configuration_limit: args.configuration_limit,
            ..Default::default()
        },
    )?;
    let report = gc::collect(
        &EspPaths::new(&config.esp),
        &config.profiles_dir,
        &RetentionPolicy::new(config.configuration_limit),
    )?;
    println!(
        "Removed {} entries and {} artifacts",
        report.removed_entries.len(),
        report.removed_artifacts.len()
    );
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn short(hash: &[u8; 32]) -> String {
    hex(&hash[..6])
}
