//! Shared scaffolding for the integration scenarios: the in-process
//! servicebroker, the generated-style ping-pong interface and an engine
//! runner for the server side of each test.

#![allow(dead_code)]

pub mod broker;
pub mod pingpong;

use dsibase::logging;
use dsinet::{CommEngine, Config, StopHandle};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

pub use broker::TestBroker;

/// Engine configuration pointing at the test's broker instance.
pub fn config_for(broker: &TestBroker) -> Config {
    Config {
        broker: broker.path().to_owned(),
        ..Config::default()
    }
}

/// A server engine running in its own thread, like a separate server
/// process would.
pub struct ServerRunner {
    stop: StopHandle,
    thread: JoinHandle<i32>,
}

impl ServerRunner {
    /// Stop the engine and return its exit code.
    pub fn shutdown(self) -> i32 {
        self.stop.stop(0);
        self.thread.join().expect("server engine thread panicked")
    }
}

/// Spawn an engine thread, let `build` add the server endpoints, then run.
pub fn spawn_server<F>(cfg: Config, build: F) -> ServerRunner
where
    F: FnOnce(&mut CommEngine) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let mut engine = CommEngine::new(cfg, logging::discard()).expect("server engine");

        build(&mut engine);

        tx.send(engine.stop_handle()).expect("handing out stop handle");
        engine.run()
    });

    let stop = rx.recv().expect("server engine failed to start");

    ServerRunner { stop, thread }
}

/// Client engine for the main test thread.
pub fn client_engine(cfg: Config) -> CommEngine {
    CommEngine::new(cfg, logging::discard()).expect("client engine")
}
