use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use log::info;

use raftkv::{Backend, Node, NodeConfig, NodeError};

fn main() -> Result<(), NodeError> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LOG_LEVEL", "info"))
        .init();

    let matches = App::new("raftkv")
        .about("replicated key-value store node")
        .arg(
            Arg::with_name("ip")
                .long("ip")
                .value_name("HOST:PORT")
                .help("address of this node; doubles as its identity")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("peers")
                .long("peers")
                .value_name("IP1:PORT1,IP2:PORT2")
                .help("comma separated addresses of other nodes in the cluster")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("SECONDS")
                .help("interval after which all peers get a liveness ping")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("store")
                .short("s")
                .long("store")
                .possible_values(&["memory", "database"])
                .help("data storage layer")
                .takes_value(true)
                .default_value("memory"),
        )
        .arg(
            Arg::with_name("database")
                .short("d")
                .long("database")
                .value_name("NAME")
                .help("database name; only used with --store database")
                .takes_value(true)
                .default_value("default.db"),
        )
        .arg(
            Arg::with_name("volume")
                .short("v")
                .long("volume")
                .value_name("DIR")
                .help("directory for the ordered log and database files")
                .takes_value(true)
                .default_value("data"),
        )
        .get_matches();

    let mut config = NodeConfig::new(matches.value_of("ip").unwrap());

    if let Some(peers) = matches.value_of("peers") {
        config.peers = peers
            .split(',')
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty())
            .collect();
    }

    let seconds: f64 = matches
        .value_of("timeout")
        .unwrap()
        .parse()
        .unwrap_or(1.0);
    config.ping_interval = Duration::from_secs_f64(seconds);

    config.backend = match matches.value_of("store") {
        Some("database") => Backend::Database,
        _ => Backend::Memory,
    };
    config.database = matches.value_of("database").unwrap().to_string();

    // DATA_DIR wins over --volume, like the rest of the env overrides
    if env::var("DATA_DIR").is_err() {
        config.data_dir = PathBuf::from(matches.value_of("volume").unwrap());
    }

    let node = Node::new(config)?;
    node.run();
    info!("node {} running", node.addr());

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
