//! `tpmmgr-agent`: one-shot TPM commands and the provisioning service.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::{error, info, info_span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt, reload};

use tpmmgr::config::Config;
use tpmmgr::introspect::ModuleStatus;
use tpmmgr::module::SecurityModule;
use tpmmgr::service::{FileConfigFeed, ProcessLock, ServiceLoop, TouchFile};
use tpmmgr::sim::SimModule;
use tpmmgr::tpm::TssModule;
use tpmmgr::TpmManager;

const AGENT_NAME: &str = "tpmmgr";
const QUOTE_NONCE: &[u8] = b"nonce";

#[derive(Parser)]
#[clap(name = "tpmmgr-agent", about = "TPM identity, NV secrets and ECDH payload agent")]
struct Cli {
    /// Force debug logging
    #[clap(short, long)]
    debug: bool,

    /// Partition this agent runs from
    #[clap(short = 'c', long, default_value = "")]
    current_partition: String,

    /// Use the software module, keeping its state in this file
    #[clap(long, value_name = "STATE_FILE")]
    simulator: Option<PathBuf>,

    /// TCTI in tpm2-tools syntax, e.g. `device:/dev/tpmrm0` or `swtpm:port=2321`
    #[clap(long, env = "TPM2TOOLS_TCTI")]
    tcti: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replace the device key, EK, SRK and AK
    GenKey,
    /// Restore the device certificate file from NV
    ReadDeviceCert,
    /// Store the device certificate file in NV
    WriteDeviceCert,
    /// Restore the credential cache file from NV
    ReadCredentials,
    /// Create the owner credential unless the module already has one
    GenCredentials,
    /// Wait for global config, provision identity keys, keep running
    RunAsService,
    /// Print vendor, model and firmware version
    PrintCapability,
    /// Print the SHA-256 PCR bank
    PrintPcrs,
    /// Check that the module and software agree on an ECDH shared point
    TestEcdhSupport,
    /// Seal a message to the device certificate and open it through the module
    TestEcdhAes,
}

fn filter_for(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// PCR bank, then an AK quote over PCRs 0-8. A failed quote is reported
/// without failing the listing.
fn print_pcrs<M: SecurityModule>(manager: &TpmManager<M>, out: &mut impl Write) -> anyhow::Result<()> {
    for pcr in manager.pcrs().context("reading PCRs")? {
        writeln!(out, "{pcr}")?;
    }
    match manager.quote(QUOTE_NONCE) {
        Ok(quote) => writeln!(out, "{}", quote.attestation)?,
        Err(e) => error!(error = %e, "quote failed"),
    }
    Ok(())
}

fn dispatch<M: SecurityModule>(manager: &TpmManager<M>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::GenKey => manager.provision_all().context("creating keys")?,
        Command::ReadDeviceCert => manager
            .read_device_cert()
            .context("reading device certificate")?,
        Command::WriteDeviceCert => manager
            .write_device_cert()
            .context("writing device certificate")?,
        Command::ReadCredentials => {
            manager.read_credentials().context("reading credentials")?;
        }
        Command::GenCredentials => {
            manager
                .generate_credentials()
                .context("generating credentials")?;
        }
        Command::RunAsService => {
            info!("starting {AGENT_NAME}");
            let paths = &manager.config().paths;
            let _lock = ProcessLock::acquire(&paths.lock_file)?;
            if manager.status() == ModuleStatus::NotFound {
                info!("no TPM on this platform");
            }
            let service = ServiceLoop::new(
                manager,
                FileConfigFeed::new(&paths.global_config),
                TouchFile::new(&paths.liveness_touch),
            );
            match service.run()? {}
        }
        Command::PrintCapability => println!("{}", manager.hardware_info()?),
        Command::PrintPcrs => print_pcrs(manager, &mut std::io::stdout().lock())?,
        Command::TestEcdhSupport => {
            let agreed = manager.test_ecdh_support()?;
            println!("shared secret {}", if agreed { "matches" } else { "MISMATCH" });
            anyhow::ensure!(agreed, "module and software derived different shared points");
        }
        Command::TestEcdhAes => {
            let recovered = manager.test_ecdh_exchange()?;
            println!("decryption {}", if recovered { "succeeded" } else { "FAILED" });
            anyhow::ensure!(recovered, "decrypted payload does not match");
        }
    }
    Ok(())
}

fn try_main(cli: Cli, reload: reload::Handle<EnvFilter, tracing_subscriber::Registry>) -> anyhow::Result<()> {
    let config = Config {
        debug_override: cli.debug,
        ..Config::default()
    };
    let hook = move |enabled: bool| {
        if let Err(e) = reload.modify(|filter| *filter = filter_for(enabled)) {
            error!(error = %e, "failed to change log level");
        }
    };

    match &cli.simulator {
        Some(state) => {
            let module = SimModule::with_state_file(state)?;
            dispatch(&TpmManager::new(module, config).with_debug_hook(hook), cli.command)
        }
        None => {
            let module = TssModule::from_tcti_name(cli.tcti.as_deref(), &config.paths.device_node)?;
            dispatch(&TpmManager::new(module, config).with_debug_hook(hook), cli.command)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (filter, reload) = reload::Layer::new(filter_for(cli.debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let span = info_span!("agent", name = AGENT_NAME, partition = %cli.current_partition);
    let _guard = span.enter();

    match try_main(cli, reload) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_and_command() {
        let cli = Cli::try_parse_from([
            "tpmmgr-agent",
            "-d",
            "-c",
            "IMGA",
            "--simulator",
            "/tmp/sim.bin",
            "print-pcrs",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.current_partition, "IMGA");
        assert!(matches!(cli.command, Command::PrintPcrs));
    }

    #[test]
    fn gen_key_then_self_test_against_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.credential_cache = dir.path().join("tpm_credential");
        config.paths.ecc_public_key = dir.path().join("tpm.eccpubk.der");
        let manager = TpmManager::new(SimModule::new(), config);

        dispatch(&manager, Command::GenCredentials).unwrap();
        dispatch(&manager, Command::GenKey).unwrap();
        dispatch(&manager, Command::TestEcdhSupport).unwrap();
        assert!(dir.path().join("tpm.eccpubk.der").exists());
    }

    #[test]
    fn print_pcrs_lists_bank_and_quote() {
        let manager = TpmManager::new(SimModule::new(), Config::default());
        manager.provision_identity().unwrap();

        let mut out = Vec::new();
        print_pcrs(&manager, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("PCR 0: "));
        assert!(text.contains("PCR 22: "));
        assert!(text.contains("Quote: "));
        assert!(text.contains("Signature: "));
    }

    #[test]
    fn print_pcrs_survives_a_failed_quote() {
        let manager = TpmManager::new(SimModule::new(), Config::default());

        let mut out = Vec::new();
        print_pcrs(&manager, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 23);
        assert!(!text.contains("Quote: "));
    }
}
