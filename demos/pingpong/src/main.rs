//! Ping-pong demo: `pingpong pong` serves the interface, `pingpong ping`
//! attaches to it and bounces a message back and forth.

mod config;
mod interface;

use clap::{App, Arg, SubCommand};
use config::DemoConfig;
use dsibase::logging::{self, Logger};
use dsinet::{
    ClientCtx, ClientState, CommEngine, Config, Proxy, RequestHandle, ResponseHandle, ServerCtx,
    ServerState, Stub,
};

struct PongServer {
    log: Logger,
}

impl Stub for PongServer {
    fn process_request(&mut self, request: &RequestHandle, ctx: &mut ServerCtx) {
        match interface::decode_ping(request) {
            Some(message) => {
                logging::info!(self.log, "ping"; "message" => &message);
                interface::response_pong(ctx, &message);
            }
            None => {
                logging::warn!(self.log, "unknown request"; "id" => request.request_id());
                ctx.send_error(request.request_id(), None);
            }
        }
    }
}

struct PingClient {
    log: Logger,
    remaining: u32,
}

impl Proxy for PingClient {
    fn component_connected(&mut self, ctx: &mut ClientCtx) {
        logging::info!(self.log, "connected, starting to ping");
        interface::request_ping(ctx, "Message from proxy");
    }

    fn component_disconnected(&mut self, ctx: &mut ClientCtx) {
        logging::info!(self.log, "server went away");
        ctx.stop(1);
    }

    fn process_response(&mut self, response: &ResponseHandle, ctx: &mut ClientCtx) {
        match interface::decode_pong(response) {
            Some(message) => {
                logging::info!(self.log, "pong"; "message" => &message,
                               "remaining" => self.remaining);

                self.remaining = self.remaining.saturating_sub(1);

                if self.remaining == 0 {
                    ctx.stop(0);
                } else {
                    interface::request_ping(ctx, &message);
                }
            }
            None => {
                logging::warn!(self.log, "request failed"; "id" => response.update_id());
                ctx.stop(1);
            }
        }
    }
}

fn engine_config(demo: &DemoConfig) -> Config {
    let mut cfg = Config::from_env();

    if let Some(broker) = &demo.broker {
        cfg.broker = broker.clone();
    }

    cfg
}

fn run_pong(demo: &DemoConfig, log: Logger) -> i32 {
    let mut engine = match CommEngine::new(engine_config(demo), log.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "cannot create engine"; "error" => %err);
            return -1;
        }
    };

    engine.add_server(
        ServerState::new(
            interface::INTERFACE,
            "demo",
            interface::MAJOR,
            interface::MINOR,
            false,
            interface::response_of,
        ),
        Box::new(PongServer {
            log: log.new(logging::o!("role" => "pong")),
        }),
    );

    engine.run()
}

fn run_ping(demo: &DemoConfig, log: Logger) -> i32 {
    let mut engine = match CommEngine::new(engine_config(demo), log.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "cannot create engine"; "error" => %err);
            return -1;
        }
    };

    engine.add_client(
        ClientState::new(
            interface::INTERFACE,
            "demo",
            interface::MAJOR,
            interface::MINOR,
        ),
        Box::new(PingClient {
            log: log.new(logging::o!("role" => "ping")),
            remaining: demo.count,
        }),
    );

    engine.run()
}

fn main() {
    let matches = App::new("pingpong")
        .about("DSI ping-pong demo")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .help("TOML configuration file"),
        )
        .subcommand(SubCommand::with_name("ping").about("Run the ping client"))
        .subcommand(SubCommand::with_name("pong").about("Run the pong server"))
        .get_matches();

    let demo = match matches.value_of("config") {
        Some(path) => DemoConfig::load(path),
        None => DemoConfig::default(),
    };

    let log = logging::terminal(&demo.log_level);

    let exitcode = match matches.subcommand_name() {
        Some("ping") => run_ping(&demo, log),
        Some("pong") => run_pong(&demo, log),
        _ => {
            eprintln!("{}", matches.usage());
            2
        }
    };

    std::process::exit(exitcode);
}
