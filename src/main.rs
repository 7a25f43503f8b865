use clap::Parser;
use color_eyre::eyre::WrapErr;
use serial_bridge::{
    cli,
    config::Config,
    logging, server,
    signals::Signals,
};
use tracing::{debug, info};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = &cli.command {
        match command {
            cli::Commands::Examples(example) => match example {
                cli::Examples::Config => {
                    let c = Config::example();
                    println!("{}", c.serialize_pretty()?);
                    return Ok(());
                }
            },
        }
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)
            .wrap_err_with(|| format!("Loading configuration from {config_path:?}"))?
    } else {
        Config::default()
    };
    cli.apply(&mut config)?;
    config.validate()?;

    logging::init(&config.log);
    debug!(?config, "Configuration");

    let signals = Signals::install()?;
    let exit = server::run(&config, || signals.take())?;
    drop(signals);

    info!(?exit, "Done");

    if exit.code() != 0 {
        std::process::exit(exit.code());
    }

    Ok(())
}
