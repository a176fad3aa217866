//! Bootstrap of the shared embedded PostgreSQL cluster.
//!
//! Unless `PG_RUNTIME_DIR` and `PG_DATA_DIR` are both set, the install and
//! data directories live under `target/pg-embed/coordinator` while the
//! cluster starts. The override goes through `env-lock` so concurrent tests
//! never observe a half-written environment.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use pg_embedded_setup_unpriv::ClusterHandle;

use super::atexit_cleanup;

static STARTUP: OnceLock<Mutex<()>> = OnceLock::new();

/// Attempts made when the binary download fails transiently.
const DOWNLOAD_ATTEMPTS: u32 = 4;
const FIRST_BACKOFF: Duration = Duration::from_millis(500);

/// Error fragments of download and connect failures worth retrying.
const TRANSIENT: [&str; 6] = [
    "error decoding response body",
    "connection reset",
    "connection refused",
    "timed out",
    "temporarily unavailable",
    "dns error",
];

fn cluster_dirs() -> std::io::Result<(PathBuf, PathBuf)> {
    let target = std::env::var_os("CARGO_TARGET_DIR").map_or_else(
        || PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target"),
        PathBuf::from,
    );
    let base = target.join("pg-embed").join("coordinator");
    let install = base.join("install");
    let data = base.join("data");
    std::fs::create_dir_all(&install)?;
    std::fs::create_dir_all(&data)?;
    Ok((install, data))
}

fn is_transient(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT.iter().any(|fragment| message.contains(fragment))
}

/// Start, or reuse, the cluster shared by every test of this binary.
pub fn shared_cluster() -> Result<&'static ClusterHandle, String> {
    let _startup = STARTUP
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner());

    let dirs_configured =
        std::env::var_os("PG_RUNTIME_DIR").is_some() && std::env::var_os("PG_DATA_DIR").is_some();
    let _env = if dirs_configured {
        None
    } else {
        let (install, data) = cluster_dirs().map_err(|err| err.to_string())?;
        Some(env_lock::lock_env([
            ("PG_RUNTIME_DIR", Some(install.display().to_string())),
            ("PG_DATA_DIR", Some(data.display().to_string())),
        ]))
    };

    let mut backoff = FIRST_BACKOFF;
    let mut attempt = 1;
    loop {
        let error = match atexit_cleanup::shared_cluster_handle() {
            Ok(cluster) => return Ok(cluster),
            Err(err) => format!("{err:?}"),
        };
        if attempt >= DOWNLOAD_ATTEMPTS || !is_transient(&error) {
            return Err(error);
        }
        eprintln!("pg-embed: attempt {attempt}/{DOWNLOAD_ATTEMPTS} failed, retrying in {backoff:?}: {error}");
        std::thread::sleep(backoff);
        backoff *= 2;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    #[rstest]
    #[case("Connection refused (os error 111)", true)]
    #[case("request TIMED OUT", true)]
    #[case("initdb: permission denied", false)]
    fn only_network_failures_are_retried(#[case] message: &str, #[case] expected: bool) {
        assert_eq!(super::is_transient(message), expected);
    }
}
