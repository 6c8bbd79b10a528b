use clap::Parser;
use domecap::configuration::config::{CliArgs, Config};
use domecap::controller::controller_handler::Controller;
use log::{error, info};

#[tokio::main]
async fn main() {
    // RUST_LOG overrides the default level
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    let args = CliArgs::parse();

    let mut config = match args.config_file {
        Some(ref path) => {
            info!("Importing configuration from {}", path.display());
            Config::from_file(path).unwrap_or_else(|e| {
                error!("Unable to import configuration from file: {}", e);
                std::process::exit(1);
            })
        }
        None => {
            info!("No configuration file given, using defaults");
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    config.apply_cli(&args);

    let controller = Controller::new(config)
        .unwrap_or_else(|e| {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        })
        .with_simulated_nodes(
            args.simulate_nodes,
            std::env::temp_dir().join("domecap-simulated"),
        );

    if let Err(e) = controller.run().await {
        error!("Error occured in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}
