use clap::{App, Arg};
use flare::logging;
use flare::time::timestamp_secs;
use probetun::config::ServerConfig;
use probetun::net::server::{Connection, Server};
use probetun::net::socket::SocketState;
use std::thread;
use std::time::Duration;

// Polling cadence of the per-connection handler; reads are non-blocking.
const HANDLER_IDLE_SLEEP: Duration = Duration::from_millis(50);

pub fn main() {
    let matches = App::new("Probetun Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the 802.11 probe-request tunnel server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = ServerConfig::load(config_file_path);

    // Initialize logging
    let logger = logging::init_with_level(&config.log_level);

    logging::info!(logger, "starting tunnel server";
                   "srv_id" => config.srv_id,
                   "max_connections" => config.max_connections,
                   "netlink_group" => config.netlink_group);

    let mut server = Server::new(&logger);
    server.set_tx_vendor_ie(config.tx_vendor_ie);
    server.set_netlink_group(config.netlink_group);
    server.set_idle_timeout(config.idle_timeout());

    server.bind(config.srv_id).expect("Error binding tunnel server");
    server
        .listen(config.max_connections)
        .expect("Error entering listen state");

    while let Some(connection) = server.accept() {
        logging::info!(
            logger,
            "accepted connection";
            "client_id" => connection.client_id(),
            "mtu" => connection.mtu(),
            "tx_vendor_ie" => connection.tx_vendor_ie_allowed(),
            "rx_vendor_ie" => connection.rx_vendor_ie_possible(),
            "client_sa" => connection.client_sa_first().map(|sa| sa.to_string()).unwrap_or_default(),
            "accepted_at" => timestamp_secs()
        );

        let handler_log = logger.new(logging::o!("client_id" => connection.client_id()));
        thread::spawn(move || echo_loop(connection, handler_log));
    }

    server.unbind();
}

/// Bounces every inbound chunk straight back to the client, standing in for
/// a real connection handler.
fn echo_loop(connection: Connection, log: logging::Logger) {
    while connection.state() == SocketState::Open {
        if !connection.has_in_data() {
            thread::sleep(HANDLER_IDLE_SLEEP);
            continue;
        }

        let data = connection.read(connection.mtu());
        if data.is_empty() {
            continue;
        }

        logging::debug!(log, "echoing chunk"; "len" => data.len());
        connection.send(&data);
    }

    logging::info!(log, "connection handler finished");
}
