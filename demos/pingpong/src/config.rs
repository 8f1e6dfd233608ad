//! Demo configuration, loadable from a TOML file.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct DemoConfig {
    /// Servicebroker mount point, overriding `DSISERVICEBROKER`.
    pub broker: Option<String>,
    /// Number of round trips the ping side performs.
    pub count: u32,
    pub log_level: String,
}

impl Default for DemoConfig {
    fn default() -> DemoConfig {
        DemoConfig {
            broker: None,
            count: 10,
            log_level: "info".to_owned(),
        }
    }
}

impl DemoConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> DemoConfig {
        serdeconv::from_toml_file(path).expect("Error loading demo configuration file")
    }
}
