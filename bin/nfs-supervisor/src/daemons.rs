//! The daemons run inside the NFS container.

use std::path::Path;

use keel_core::process::{ManagedProcess, Preparation};

const RPCBIND_PATH: &str = "/sbin/rpcbind";
const DBUS_DAEMON_PATH: &str = "/usr/bin/dbus-daemon";
const DBUS_UUIDGEN_PATH: &str = "/usr/bin/dbus-uuidgen";
const DBUS_RUNTIME_DIR: &str = "/run/dbus";
const GANESHA_PATH: &str = "/usr/bin/ganesha.nfsd";

/// The supervised processes, in start order.
pub struct Daemons {
    pub rpcbind: ManagedProcess,
    pub bus: ManagedProcess,
    pub nfs: ManagedProcess,
}

impl Daemons {
    /// Returns the standard daemon set, with the NFS server reading the given configuration file.
    pub fn standard(ganesha_config_file: &Path) -> Self {
        Self {
            rpcbind: rpcbind(),
            bus: dbus(),
            nfs: ganesha(ganesha_config_file),
        }
    }
}

/// The portmapper, kept in the foreground.
fn rpcbind() -> ManagedProcess {
    ManagedProcess::new("rpcbind", RPCBIND_PATH, ["-f"])
}

/// The system message bus. Needs its runtime directory and a machine ID before it will start.
fn dbus() -> ManagedProcess {
    ManagedProcess::new("dbus", DBUS_DAEMON_PATH, ["--system", "--nofork", "--nopidfile"])
        .with_preparation(Preparation::CreateDir(DBUS_RUNTIME_DIR.into()))
        .with_preparation(Preparation::Command {
            program: DBUS_UUIDGEN_PATH.into(),
            args: vec!["--ensure".to_string()],
        })
}

/// The NFS server, kept in the foreground and logging to standard output.
fn ganesha(config_file: &Path) -> ManagedProcess {
    let config_file = config_file.display().to_string();
    ManagedProcess::new(
        "ganesha",
        GANESHA_PATH,
        ["-F", "-f", config_file.as_str(), "-L", "/dev/stdout"],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_command_lines() {
        let daemons = Daemons::standard(Path::new("/config/ganesha.conf"));

        assert_eq!(daemons.rpcbind.program(), Path::new("/sbin/rpcbind"));
        assert_eq!(daemons.rpcbind.args(), ["-f"]);

        assert_eq!(daemons.bus.program(), Path::new("/usr/bin/dbus-daemon"));
        assert_eq!(daemons.bus.args(), ["--system", "--nofork", "--nopidfile"]);

        assert_eq!(daemons.nfs.name(), "ganesha");
        assert_eq!(daemons.nfs.program(), Path::new("/usr/bin/ganesha.nfsd"));
        assert_eq!(
            daemons.nfs.args(),
            ["-F", "-f", "/config/ganesha.conf", "-L", "/dev/stdout"]
        );
        assert!(!daemons.nfs.is_running());
    }
}
