use std::process;
use std::sync::mpsc;

use clap::{Arg, Command};
use log::{error, info};

use ndnfwd::config::Config;
use ndnfwd::dataplane::DataPlane;

fn main() {
    env_logger::init();

    let matches = Command::new("ndnfwd")
        .version("0.1.0")
        .about("ndnfwd - NDN forwarding data plane")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/ndnfw/ndnfwd.conf"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    info!("starting ndnfwd, config file: {}", config_path);

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let mut dataplane = DataPlane::new(config);
    if let Err(e) = dataplane.launch() {
        error!("failed to launch data plane: {}", e);
        process::exit(1);
    }
    info!("ndnfwd running; face drivers attach via the management API");

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install signal handler");
    let _ = rx.recv();

    info!("shutting down ndnfwd");
    dataplane.stop();
}
