// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use eip130_mbox::secure_boot::{self, RsaKey};
use eip130_mbox::sim::{SimConfig, SimEngine};
use eip130_mbox::{Config, Eip130, Error, FirmwareImage};
use eip130_regs::{MailboxNumber, MailboxStatus, ModuleStatus, Options, Options2, Version};
use eip130_token::pk::{self, RsaPadding};
use eip130_token::policy::PolicyVersion;
use eip130_token::system::SystemInfo;
use log::{debug as okay, info, warn};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
enum Command {
    /// Split a firmware image into its header token and body
    SplitImage {
        /// firmware image (binary)
        #[clap(short = 'i', long = "in")]
        src_img: PathBuf,

        /// write the 256 byte header token here
        #[clap(long)]
        header_out: Option<PathBuf>,

        /// write the image body here
        #[clap(long)]
        body_out: Option<PathBuf>,
    },
    /// Decode raw register values
    DecodeRegs {
        #[clap(long, value_parser = parse_int::parse::<u32>)]
        version: Option<u32>,

        #[clap(long, value_parser = parse_int::parse::<u32>)]
        options: Option<u32>,

        #[clap(long, value_parser = parse_int::parse::<u32>)]
        options2: Option<u32>,

        #[clap(long, value_parser = parse_int::parse::<u32>)]
        module_status: Option<u32>,

        #[clap(long, value_parser = parse_int::parse::<u32>)]
        mailbox_status: Option<u32>,
    },
    /// Decode an asset policy
    Policy {
        #[arg(value_parser = parse_int::parse::<u64>)]
        bits: u64,

        #[clap(long, value_enum, default_value = "v2")]
        policy_version: PolicyVersion,

        /// print JSON instead of text
        #[clap(long)]
        json: bool,
    },
    /// Build the key blob the engine takes for an RSA public key
    KeyBlob {
        /// public key (PEM, PKCS#1 or SubjectPublicKeyInfo)
        key: PathBuf,

        /// also convert this signature (binary, big endian)
        #[clap(long)]
        signature: Option<PathBuf>,

        /// output file for the key blob (binary)
        #[clap(short = 'o', long = "out")]
        dest_blob: Option<PathBuf>,
    },
    /// Run a bring-up sequence against the simulated engine
    Simulate {
        #[clap(flatten)]
        run: RunArgs,
    },
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[clap(short, long)]
    verbose: bool,

    /// TOML file with `driver` and `engine` tables
    #[clap(long)]
    config: Option<PathBuf>,

    /// firmware image to download first
    #[clap(long)]
    firmware: Option<PathBuf>,

    /// read the public data object at this static index
    #[clap(long = "read", value_parser = parse_int::parse::<u32>)]
    read: Vec<u32>,

    /// read the rollback counter at this static index
    #[clap(long, value_parser = parse_int::parse::<u32>)]
    rollback: Vec<u32>,

    /// enter FIPS mode with these four user identities
    #[clap(long, num_args = 4, value_parser = parse_int::parse::<u32>)]
    fips_users: Option<Vec<u32>>,

    #[clap(flatten)]
    verify: VerifyArgs,
}

#[derive(Debug, Parser)]
struct VerifyArgs {
    /// public key to check `--message` and `--signature` with
    #[clap(long, requires_all = ["message", "signature"])]
    verify_key: Option<PathBuf>,

    #[clap(long, requires = "verify_key")]
    message: Option<PathBuf>,

    #[clap(long, requires = "verify_key")]
    signature: Option<PathBuf>,

    #[clap(long, value_enum, default_value = "pkcs1v15")]
    padding: RsaPadding,
}

#[derive(Debug, Parser)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

/// Contents of the `simulate --config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
struct SimulateConfig {
    driver: Config,
    engine: SimConfig,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    firmware_state: String,
    firmware_attempts: u32,
    system: Option<SystemInfo>,
    public_data: Vec<PublicData>,
    rollback: Vec<Rollback>,
    signature_valid: Option<bool>,
    fips: bool,
}

#[derive(Debug, Serialize)]
struct PublicData {
    index: u32,
    data: Option<String>,
}

#[derive(Debug, Serialize)]
struct Rollback {
    index: u32,
    count: u32,
}

fn main() -> Result<()> {
    let cmd = Opts::parse();

    // Simulate has a custom logger; everyone else can use the default
    if !matches!(cmd.cmd, Command::Simulate { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cmd.cmd {
        Command::SplitImage {
            src_img,
            header_out,
            body_out,
        } => {
            let image =
                std::fs::read(&src_img).with_context(|| format!("could not open {src_img:?}"))?;
            let fw = FirmwareImage::parse(&image)?;
            let (header, body) = image.split_at(FirmwareImage::HEADER_BYTES);
            println!("header: {} bytes, sha256 {}", header.len(), sha256_hex(header));
            println!(
                "body:   {} bytes ({} words), sha256 {}",
                body.len(),
                fw.body.len(),
                sha256_hex(body)
            );
            if fw.body.is_empty() {
                warn!("image has no body, only the header will be checked");
            }
            if let Some(path) = header_out {
                std::fs::write(&path, header)?;
                info!("header written to {}", path.display());
            }
            if let Some(path) = body_out {
                std::fs::write(&path, body)?;
                info!("body written to {}", path.display());
            }
        }
        Command::DecodeRegs {
            version,
            options,
            options2,
            module_status,
            mailbox_status,
        } => {
            let mut mailboxes = 4;
            if let Some(raw) = version {
                decode_version(Version::from_raw(raw));
            }
            if let Some(raw) = options {
                let options = Options::from_raw(raw);
                mailboxes = options.nr_of_mailboxes().min(MailboxNumber::MAX);
                decode_options(options);
            }
            if let Some(raw) = options2 {
                decode_options2(Options2::from_raw(raw));
            }
            if let Some(raw) = module_status {
                decode_module_status(ModuleStatus::from_raw(raw));
            }
            if let Some(raw) = mailbox_status {
                decode_mailbox_status(MailboxStatus(raw), mailboxes);
            }
        }
        Command::Policy {
            bits,
            policy_version,
            json,
        } => {
            let policy = policy_version.decode(bits);
            let flags = policy.flag_names();
            if json {
                let value = serde_json::json!({
                    "bits": format!("{bits:#018x}"),
                    "version": policy_version,
                    "family": format!("{:?}", policy.family()),
                    "direction": policy.direction().map(|d| format!("{d:?}")),
                    "exportable": policy.is_exportable(),
                    "temporary": policy.is_temporary(),
                    "non_modifiable": policy.is_non_modifiable(),
                    "public_data": policy.is_public_data(),
                    "flags": flags,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{:#018x} ({policy_version:?})", bits);
                println!("  family    {:?}", policy.family());
                if let Some(d) = policy.direction() {
                    println!("  direction {d:?}");
                }
                println!("  flags     {}", flags.join(" | "));
            }
        }
        Command::KeyBlob {
            key,
            signature,
            dest_blob,
        } => {
            let public_key = read_public_key(&key)?;
            let modulus = public_key.n().to_bytes_be();
            let exponent = public_key.e().to_bytes_be();
            let blob = pk::rsa_public_key_blob(&modulus, &exponent)
                .context("could not build key blob")?;
            let asset_len = secure_boot::rsa_key_asset_len(RsaKey {
                modulus: &modulus,
                exponent: &exponent,
            })?;
            println!(
                "{}-bit key, asset length {asset_len}, sha256 {}",
                modulus.len() * 8,
                sha256_hex(&blob)
            );
            match dest_blob {
                Some(path) => {
                    std::fs::write(&path, &blob)?;
                    info!("key blob written to {}", path.display());
                }
                None => println!("{}", hex::encode(&blob)),
            }
            if let Some(path) = signature {
                let sig =
                    std::fs::read(&path).with_context(|| format!("could not open {path:?}"))?;
                let sig_blob = pk::rsa_signature_blob(&sig, modulus.len())
                    .context("could not build signature blob")?;
                println!("signature: {}", hex::encode(sig_blob));
            }
        }
        Command::Simulate { run } => simulate(run)?,
    }

    Ok(())
}

/// Driver crates log at debug (trace with `verbose`), everything else only
/// warns. `RUST_LOG` still overrides. Trace lines name their module.
fn init_simulate_logger(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Warn);
    for (module, level) in simulate_log_levels(verbose) {
        builder.filter_module(module, level);
    }
    builder
        .parse_default_env()
        .format(|buf, record| {
            let tag = match record.level() {
                log::Level::Error => format!("{:>4}", "fail").red().bold(),
                log::Level::Warn => format!("{:>4}", "warn").yellow(),
                log::Level::Info => format!("{:>4}", "").normal(),
                log::Level::Debug => format!("{:>4}", "ok").green(),
                log::Level::Trace => format!("{:>4}", "..").dimmed(),
            };
            let text = record.args().to_string().replace('\n', "\n       ");
            if record.level() == log::Level::Trace {
                writeln!(buf, "{tag}  {} {text}", record.target().dimmed())
            } else {
                writeln!(buf, "{tag}  {text}")
            }
        })
        .init();
}

const DRIVER_CRATES: [&str; 4] = ["eip130_mbox", "eip130_regs", "eip130_token", "eip130_tool"];

fn simulate_log_levels(verbose: bool) -> Vec<(&'static str, log::LevelFilter)> {
    let level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Debug
    };
    DRIVER_CRATES.iter().map(|m| (*m, level)).collect()
}

fn simulate(run: RunArgs) -> Result<()> {
    let cfg: SimulateConfig = match &run.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("could not open {path:?}"))?;
            toml::from_str(&text).with_context(|| format!("could not parse {path:?}"))?
        }
        None => SimulateConfig::default(),
    };
    init_simulate_logger(run.verbose);

    let mailbox = cfg.driver.mailbox;
    let identity = cfg.driver.identity;
    let mut eip = Eip130::new(SimEngine::new(cfg.engine), cfg.driver);
    let mut report = Report::default();

    let state = eip.firmware_check().context("firmware check failed")?;
    report.firmware_state = format!("{state:?}");
    if let Some(path) = &run.firmware {
        let image = std::fs::read(path).with_context(|| format!("could not open {path:?}"))?;
        let fw = FirmwareImage::parse(&image)?;
        report.firmware_attempts = eip
            .firmware_load(mailbox, &fw.header, &fw.body)
            .context("firmware download failed")?;
        okay!("firmware running after {} attempt(s)", report.firmware_attempts);
    }
    eip.firmware_login(mailbox, identity, true)
        .context("login failed")?;

    {
        let mut session = eip.open().context("could not open a session")?;
        report.system = Some(session.system_info()?);
        okay!("linked mailbox {}", session.mailbox());

        for &index in &run.read {
            let len = match session.public_data_read(index, None) {
                Ok(len) => len,
                Err(Error::NotFound(_)) => {
                    warn!("no public data at index {index}");
                    report.public_data.push(PublicData { index, data: None });
                    continue;
                }
                Err(e) => return Err(e).context(format!("reading public data {index}")),
            };
            let mut buf = vec![0u8; len];
            let n = session.public_data_read(index, Some(&mut buf))?;
            report.public_data.push(PublicData {
                index,
                data: Some(hex::encode(&buf[..n])),
            });
        }

        for &index in &run.rollback {
            let count = session
                .rollback_counter(index)
                .with_context(|| format!("reading rollback counter {index}"))?;
            report.rollback.push(Rollback { index, count });
        }

        if let Some(key_path) = &run.verify.verify_key {
            report.signature_valid = Some(verify(&mut session, key_path, &run.verify)?);
        }

        if let Some(users) = &run.fips_users {
            let users: [u32; 4] = users
                .as_slice()
                .try_into()
                .context("FIPS mode needs four user identities")?;
            session.set_fips_mode(users).context("could not enter FIPS mode")?;
        }
        report.fips = session.module_status().fips_mode();
    }

    let stats = eip.io_mut().stats().clone();
    info!(
        "{} tokens, {} module status reads, {} firmware words",
        stats.tokens_processed, stats.module_status_reads, stats.body_words_written
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn verify(
    session: &mut eip130_mbox::Session<'_, SimEngine>,
    key_path: &Path,
    args: &VerifyArgs,
) -> Result<bool> {
    let (Some(message), Some(signature)) = (&args.message, &args.signature) else {
        bail!("--verify-key needs --message and --signature");
    };
    let public_key = read_public_key(key_path)?;
    let modulus = public_key.n().to_bytes_be();
    let exponent = public_key.e().to_bytes_be();
    let message =
        std::fs::read(message).with_context(|| format!("could not open {message:?}"))?;
    let signature =
        std::fs::read(signature).with_context(|| format!("could not open {signature:?}"))?;

    let key = RsaKey {
        modulus: &modulus,
        exponent: &exponent,
    };
    match session.rsa_verify(key, &signature, &message, args.padding) {
        Ok(()) => {
            okay!("signature verified");
            Ok(true)
        }
        Err(Error::VerificationFailed(e)) => {
            warn!("signature rejected: {e}");
            Ok(false)
        }
        Err(e) => Err(e).context("signature check failed"),
    }
}

fn read_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = std::fs::read_to_string(path).with_context(|| format!("could not open {path:?}"))?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(&pem))
        .with_context(|| format!("{path:?} is not an RSA public key"))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn yes_no(b: bool) -> colored::ColoredString {
    if b {
        "yes".green()
    } else {
        "no".red()
    }
}

fn decode_version(v: Version) {
    println!("{}", "EIP_VERSION".bold());
    let sig = format!("{:#06x}", v.signature());
    println!(
        "  signature {} (supported: {})",
        sig,
        yes_no(v.is_supported())
    );
    println!(
        "  version   {}.{}.{}",
        v.major_version(),
        v.minor_version(),
        v.patch_level()
    );
}

fn decode_options(o: Options) {
    println!("{}", "EIP_OPTIONS".bold());
    println!("  mailboxes        {}", o.nr_of_mailboxes());
    println!("  mailbox size     {} bytes", o.mailbox_size());
    println!("  host ids         {:#04x}", o.host_ids());
    println!("  secure host ids  {:#04x}", o.secure_host_ids());
    println!("  master id        {}", o.master_id());
    println!("  my host id       {}", o.my_host_id());
    println!("  protection       {}", yes_no(o.protection_available()));
    println!("  my protection    {}", yes_no(o.my_protection()));
}

fn decode_options2(o: Options2) {
    println!("{}", "EIP_OPTIONS2".bold());
    println!("  engines          {:#04x}", o.engines());
    println!("  custom engines   {:#x}", o.custom_engines());
    println!("  firmware RAM     {}", yes_no(o.firmware_ram()));
    println!("  bus interface    {}", o.bus_interface());
}

fn decode_module_status(s: ModuleStatus) {
    println!("{}", "MODULE_STATUS".bold());
    let mode = match (s.fips_bit(), s.non_fips()) {
        (true, false) => "FIPS".green(),
        (false, true) => "non-FIPS".yellow(),
        (false, false) => "starting".normal(),
        (true, true) => "inconsistent".red(),
    };
    println!("  mode             {mode}");
    let crc = if s.crc24_error() {
        "error".red()
    } else if s.crc24_busy() {
        "busy".yellow()
    } else if s.crc24_ok() {
        "ok".green()
    } else {
        "idle".normal()
    };
    println!("  CRC24            {crc}");
    println!("  firmware written {}", yes_no(s.firmware_written()));
    println!("  checks busy      {}", yes_no(s.firmware_checks_busy()));
    println!("  accepted         {}", yes_no(s.firmware_accepted()));
    if s.fatal_error() {
        println!("  {}", "FATAL ERROR".red().bold());
    }
}

fn decode_mailbox_status(s: MailboxStatus, mailboxes: u8) {
    println!("{}", "MAILBOX_STAT".bold());
    for nr in 1..=mailboxes {
        let Some(m) = MailboxNumber::new(nr) else {
            continue;
        };
        println!(
            "  mailbox {nr}: in {} out {} {}",
            if s.in_full(m) { "full" } else { "free" },
            if s.out_full(m) { "full" } else { "empty" },
            if s.linked(m) {
                "linked".green()
            } else if s.available(m) {
                "available".normal()
            } else {
                "unavailable".red()
            }
        );
    }
}
