use clap::Parser;

use dualcam_recorder::cli::{self, Args, Command};
use dualcam_recorder::config::Config;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Some(Command::ListCameras) => cli::list_cameras(&config),
        Some(Command::Record(record)) => cli::record(record, &config),
        Some(Command::Export(export)) => cli::export(export, &config),
        Some(Command::Config { action }) => {
            cli::handle_config_action(action, args.config.as_deref(), &config)
        }
        None => {}
    }
}
