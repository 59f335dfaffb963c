use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drifter::cli::{Cli, Command};
use drifter::config::{self, LocalConfig};
use drifter::error::DrifterError;
use drifter::hypervisor::Vmrun;
use drifter::instance::{self, Instance};
use drifter::pipeline::Pipeline;
use drifter::{pack, resolver, ssh, store};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("drifter=info".parse().expect("valid log directive")),
        )
        .init();

    let deadline =
        (cli.timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(cli.timeout_secs));

    // make-boxcar works without a config file; everything else needs one.
    if let Command::MakeBoxcar { path } = &cli.command {
        let config = config::load_or_default(&cli.config_file)?;
        pack::make_boxcar(&config.app_config, path).await?;
        return Ok(());
    }

    let config = config::load_discovered(&cli.config_file)?;
    let app = &config.app_config;
    let vmrun = Vmrun::new(&app.vmrun_binary_path);

    match cli.command {
        Command::MakeBoxcar { .. } => unreachable!(),
        Command::Fetch => {
            config.require_boxcar()?;
            store::fetch(&config.boxcar, &app.boxcars_dir()).await?;
        }
        Command::Start => cmd_start(&config, &vmrun, deadline).await?,
        Command::Stop { force } => {
            let vm = Instance::load(app, config.require_instance()?)?;
            vmrun.stop(&vm.vmx_file, force).await?;
        }
        Command::Suspend => {
            let vm = Instance::load(app, config.require_instance()?)?;
            return Err(vmrun.suspend_interactive(&vm.vmx_file).into());
        }
        Command::IpAddr => {
            let vm = Instance::load(app, config.require_instance()?)?;
            let ip_addr = current_ip(&vm, &vmrun).await?;
            println!("{ip_addr}");
        }
        Command::Ssh { args } => {
            let vm = Instance::load(app, config.require_instance()?)?;
            let ip_addr = current_ip(&vm, &vmrun).await?;
            return Err(ssh::interactive(&vm.key_path, &app.guest_user, &ip_addr, &args).into());
        }
        Command::SshConfig => {
            let vm = Instance::load(app, config.require_instance()?)?;
            let ip_addr = current_ip(&vm, &vmrun).await?;
            print!(
                "{}",
                ssh::render_config_clause(&vm.name, &ip_addr, &app.guest_user, &vm.key_path)
            );
        }
        Command::Ls => {
            for vmx in vmrun.list().await? {
                let name = vmx
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "?".into());
                println!("{name}\t{}", vmx.display());
            }
        }
        Command::Rm => cmd_rm(&config, &vmrun).await?,
    }

    Ok(())
}

/// The committed address is preferred; resolution only happens the first
/// time, via the guest-tools query.
async fn current_ip(vm: &Instance, vmrun: &Vmrun) -> Result<String, DrifterError> {
    if !vm.metadata.ip_addr.is_empty() {
        return Ok(vm.metadata.ip_addr.clone());
    }
    vmrun.guest_ip(&vm.vmx_file).await
}

async fn cmd_start(
    config: &LocalConfig,
    vmrun: &Vmrun,
    deadline: Option<Instant>,
) -> Result<(), DrifterError> {
    let name = config.require_instance()?;
    let vm = match Instance::load(&config.app_config, name) {
        Ok(vm) => vm,
        Err(DrifterError::NotFound { .. }) => {
            // Never provisioned: the pipeline fetches, clones, bootstraps
            // and leaves the instance running and committed.
            config.require_boxcar()?;
            Pipeline::new(config, deadline)?.run().await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    println!("Starting {}", vm.vmx_file.display());
    vmrun.start(&vm.vmx_file).await?;

    let ip_addr = current_ip(&vm, vmrun).await?;
    if !resolver::wait_for_reachable(&ip_addr, resolver::LOGIN_PORT, deadline).await {
        // The recorded address may be stale; the tools answer is
        // authoritative for this session, but the record is kept as is.
        let fresh = vmrun.guest_ip(&vm.vmx_file).await?;
        tracing::info!(recorded = %ip_addr, fresh = %fresh, "recorded address unreachable");
        println!("Instance running on {fresh}");
        return Ok(());
    }
    println!("Instance running on {ip_addr}");
    Ok(())
}

async fn cmd_rm(config: &LocalConfig, vmrun: &Vmrun) -> Result<(), DrifterError> {
    let vm = Instance::load(&config.app_config, config.require_instance()?)?;

    let confirmed = inquire::Confirm::new("Permanently remove vm and all data?")
        .with_default(false)
        .prompt()
        .map_err(|_| DrifterError::Declined)?;
    if !confirmed {
        return Err(DrifterError::Declined);
    }

    instance::remove(vmrun, &vm).await
}
