/* Service configuration: INI file with compiled-in defaults. Loaded by the daemon at
 * startup and by the client library to locate the control socket and event port dir. */
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use tracing::{debug, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/uisd.conf";
const DEFAULT_DEVICE_DIR: &str = "/dev/input/hid";
const DEFAULT_RUNTIME_DIR: &str = "/run/uisd";

/* Everything uisd needs to know about its environment. */
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /* Directory scanned and watched for device pseudo-files. */
    pub device_dir: PathBuf,
    /* Directory holding the control socket and client event ports. */
    pub runtime_dir: PathBuf,
    /* Control-channel socket path. */
    pub control_socket: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let runtime_dir = PathBuf::from(DEFAULT_RUNTIME_DIR);
        ServiceConfig {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            control_socket: runtime_dir.join("control.sock"),
            runtime_dir,
        }
    }
}

impl ServiceConfig {
    /* Path of the event-port socket a client registered under `port`. */
    pub fn port_path(&self, port: i32) -> PathBuf {
        port_path(&self.runtime_dir, port)
    }
}

pub fn port_path(runtime_dir: &Path, port: i32) -> PathBuf {
    runtime_dir.join(format!("{port}.port"))
}

/* Load the config from `$UISD_CONFIG` or the default location. A missing file is not
 * an error; every key falls back to its default. */
pub fn load() -> ServiceConfig {
    let path = PathBuf::from(
        std::env::var("UISD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    load_from(&path)
}

pub fn load_from(path: &Path) -> ServiceConfig {
    let mut ini = Ini::new();

    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return ServiceConfig::default();
    }

    if let Err(err) = ini.load(path) {
        warn!("Failed to parse {:?}: {}, using defaults", path, err);
        return ServiceConfig::default();
    }

    parse(&ini)
}

fn parse(ini: &Ini) -> ServiceConfig {
    let defaults = ServiceConfig::default();

    let device_dir = ini
        .get("service", "device_dir")
        .map(PathBuf::from)
        .unwrap_or(defaults.device_dir);
    let runtime_dir = ini
        .get("service", "runtime_dir")
        .map(PathBuf::from)
        .unwrap_or(defaults.runtime_dir);
    /* The socket default follows runtime_dir rather than the compiled-in path. */
    let control_socket = ini
        .get("service", "control_socket")
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir.join("control.sock"));

    ServiceConfig {
        device_dir,
        runtime_dir,
        control_socket,
    }
}
