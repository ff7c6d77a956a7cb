use ballast::handle::TlsServerConfig;
use ballast::manager::Manager;
use clap::{App, Arg};
use lux::logging;
use merger::config::MergerConfig;
use merger::service::MergerService;
use std::sync::Arc;

fn main() {
    let matches = App::new("Layer Merger")
        .version("1.0")
        .about("Merges layers of DMX channel values into one universe, driven by framed JSON commands.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(false),
        )
        .get_matches();

    let config = match matches.value_of("CONFIG_FILE") {
        Some(path) => MergerConfig::load(path),
        None => MergerConfig::default(),
    };

    let log = logging::init();

    let com = Arc::new(Manager::new(&log).expect("Error creating communication manager"));
    let service = MergerService::new(&com, &log);
    service.attach();

    com.listen_unix(&config.server.socket)
        .expect("Error binding unix socket");
    logging::info!(log, "listening"; "socket" => %config.server.socket.display());

    if let Some(port) = config.server.port {
        let tls = config
            .server
            .tls_cert
            .as_ref()
            .map(|cert| TlsServerConfig::new(cert));
        com.listen(port, config.server.ipv6, tls)
            .expect("Error binding TCP port");
        logging::info!(log, "listening"; "port" => port, "ipv6" => config.server.ipv6);
    }

    com.main();
}
