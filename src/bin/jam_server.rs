use clap::Parser;
use log::info;
use netmix_rust::{
    common::{box_error::BoxError, config::Config},
    server::mix_server::{self, server_defaults, ServerSettings},
};

/// Mix the audio of every connected client and send each one its own mix
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// UDP port to listen on (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// settings file
    #[arg(short, long, default_value = "server_settings.json")]
    config: String,

    /// key file or base64 key, leave out for no encryption
    #[arg(short, long)]
    key: Option<String>,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(&args.config, server_defaults())?;
    if let Some(port) = args.port {
        config.set_value("port", port)?;
    }
    if let Some(key) = args.key {
        config.set_value("key", key)?;
    }
    let settings = ServerSettings::from_config(&config)?;
    info!("jam_server starting on port {}", settings.port);
    mix_server::run(&settings)?;
    Ok(())
}
