use std::fs;
use std::sync::Arc;

use clap::Parser;
use colourado::{ColorPalette, PaletteType};
use itertools::zip;
use tracing_subscriber::EnvFilter;

use marionette::config::{Config, Mode};
use marionette::host;
use marionette::{
    load_programs, DispatchOptions, Dispatcher, FleetRegistry, HostProbe, HostSource,
    MarionetteError, SshTransport,
};

async fn run_fleet(cli: &Config) -> Result<(), MarionetteError> {
    let programs = load_programs(&cli.programs_file)?;
    let transport = Arc::new(SshTransport::new(cli.transport_config()));
    let probe = HostProbe::new(transport.clone(), cli.query_timeout());
    let mut fleet = FleetRegistry::connect(HostSource::File(cli.hosts_file.clone()), probe).await?;
    for fault in fleet.faults() {
        eprintln!("[Marionette] WARNING: {}", fault);
    }
    eprintln!(
        "[Marionette] {} of {} hosts connected",
        fleet.connected_host_number(),
        fleet.host_count()
    );

    let mut dispatcher = Dispatcher::new(cli.dispatch_options());
    dispatcher.add_programs(programs);
    let result = dispatcher.run(&mut fleet).await;

    if let Some(path) = &cli.report {
        fs::write(path, dispatcher.log().render())?;
        eprintln!("[Marionette] Report written to '{}'", path.display());
    }
    transport.close().await;

    let summary = result?;
    eprintln!(
        "[Marionette] {} programs: {} completed, {} failed",
        summary.total, summary.completed, summary.failed
    );
    Ok(())
}

async fn run_try(cli: &Config) -> Result<(), MarionetteError> {
    let mut dispatcher = Dispatcher::new(DispatchOptions::default());
    dispatcher.add_programs(load_programs(&cli.programs_file)?);
    let result = dispatcher.try_run().await;
    for event in dispatcher.log().events() {
        println!("{}", event);
    }
    result?;
    eprintln!("[Marionette] Every program passed the dry run.");
    Ok(())
}

async fn run_local(cli: &Config) -> Result<(), MarionetteError> {
    let mut dispatcher = Dispatcher::new(DispatchOptions::default());
    dispatcher.add_programs(load_programs(&cli.programs_file)?);
    let result = dispatcher.run_local().await;
    for event in dispatcher.log().events() {
        println!("{}", event);
    }
    let summary = result?;
    eprintln!("[Marionette] {} programs ran locally.", summary.total);
    Ok(())
}

async fn run_status(cli: &Config) -> Result<(), MarionetteError> {
    let transport = Arc::new(SshTransport::new(cli.transport_config()));
    let probe = HostProbe::new(transport.clone(), cli.query_timeout());
    let mut fleet = FleetRegistry::connect(HostSource::File(cli.hosts_file.clone()), probe).await?;

    let capacity = fleet.refresh_capacity().await;
    let used_memory = fleet.used_memory().await;
    let uptimes = fleet.uptimes().await;
    let colors = ColorPalette::new(fleet.host_count() as u32, PaletteType::Pastel, false).colors;
    for (((descriptor, color), (_, used)), (_, load)) in
        zip(zip(zip(fleet.hosts(), colors), used_memory), uptimes)
    {
        let slots = capacity
            .iter()
            .find(|entry| entry.identity == descriptor.identity())
            .map_or(0, |entry| entry.available_slots);
        println!(
            "{} cpus: {}, memory: {} kB, used: {}, load: {}, free slots: {}",
            host::prettify(descriptor.identity(), color),
            descriptor.processor_count(),
            descriptor.total_memory_kb(),
            used.map_or_else(|| "-".to_string(), |kb| format!("{} kB", kb)),
            load,
            slots
        );
    }
    for fault in fleet.faults() {
        eprintln!("[Marionette] WARNING: {}", fault);
    }
    transport.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), MarionetteError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("marionette=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();

    match cli.mode {
        Mode::Run => {
            eprintln!("[Marionette] Dispatching programs over the fleet!");
            run_fleet(&cli).await?;
        }
        Mode::Try => {
            eprintln!("[Marionette] Dry run!");
            run_try(&cli).await?;
        }
        Mode::Local => {
            eprintln!("[Marionette] Running programs on this machine!");
            run_local(&cli).await?;
        }
        Mode::Status => {
            run_status(&cli).await?;
        }
    };

    Ok(())
}
