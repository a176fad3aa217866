//! Process-exit shutdown of the shared embedded PostgreSQL cluster.
//!
//! The shared cluster handle lives for the whole test process. Under
//! `nextest` every test binary is its own process, and a PostgreSQL left
//! running blocks the next binary from starting on the same data directory.
//! Bootstraps are serialised across processes with an `flock`, and a
//! `libc::atexit` handler stops the postmaster when the binary exits.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use color_eyre::eyre::eyre;
use pg_embedded_setup_unpriv::{BootstrapError, BootstrapResult, ClusterHandle};

const BOOTSTRAP_ATTEMPTS: usize = 5;
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_millis(500);
const BOOTSTRAP_LOCK_FILE: &str = "coordinator-pg-embedded-shared-cluster.lock";
const STABLE_PASSWORD: &str = "coordinator_embedded_test";

/// Postmaster to stop at exit: its data directory and PID.
static POSTMASTER: OnceLock<(PathBuf, i32)> = OnceLock::new();
/// Held for the life of the process once the bootstrap lock is taken.
static BOOTSTRAP_LOCK: OnceLock<File> = OnceLock::new();

fn lock_bootstrap() -> BootstrapResult<()> {
    if BOOTSTRAP_LOCK.get().is_some() {
        return Ok(());
    }
    let path = std::env::temp_dir().join(BOOTSTRAP_LOCK_FILE);
    let file = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| {
            BootstrapError::from(eyre!("open bootstrap lock '{}': {err}", path.display()))
        })?;

    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;

        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(BootstrapError::from(eyre!(
                "lock bootstrap file '{}': {err}",
                path.display()
            )));
        }
    }

    // Another thread may have won; dropping our handle releases its lock.
    let _ = BOOTSTRAP_LOCK.set(file);
    Ok(())
}

/// Shared cluster handle, with PostgreSQL stopped when the test binary exits.
pub fn shared_cluster_handle() -> BootstrapResult<&'static ClusterHandle> {
    pin_password();
    lock_bootstrap()?;

    let mut attempt = 1;
    loop {
        match pg_embedded_setup_unpriv::test_support::shared_cluster_handle() {
            Ok(handle) => {
                register_exit_shutdown(handle);
                return Ok(handle);
            }
            Err(err) if attempt >= BOOTSTRAP_ATTEMPTS => return Err(err),
            Err(_) => {
                std::thread::sleep(BOOTSTRAP_RETRY_DELAY);
                attempt += 1;
            }
        }
    }
}

/// Pin `PG_PASSWORD` so processes reusing one data directory authenticate.
///
/// `initdb` only runs for a fresh data directory; a random password per
/// process would fail later binaries with `28P01`.
fn pin_password() {
    if std::env::var_os("PG_PASSWORD").is_none() {
        // SAFETY: runs before the cluster bootstrap spawns threads.
        unsafe {
            std::env::set_var("PG_PASSWORD", STABLE_PASSWORD);
        }
    }
}

/// First line of `postmaster.pid` in `data_dir`.
fn read_postmaster_pid(data_dir: &Path) -> Option<i32> {
    let dir = cap_std::fs::Dir::open_ambient_dir(data_dir, cap_std::ambient_authority()).ok()?;
    let content = dir.read_to_string("postmaster.pid").ok()?;
    content.lines().next()?.trim().parse().ok()
}

#[cfg(unix)]
extern "C" fn stop_postmaster() {
    let Some((data_dir, pid)) = POSTMASTER.get() else {
        return;
    };
    // A different PID on disk means ours already exited and the number may
    // have been reused.
    if read_postmaster_pid(data_dir) != Some(*pid) {
        return;
    }

    // SAFETY: `pid` matches the running postmaster of our data directory.
    if unsafe { libc::kill(*pid, libc::SIGTERM) } != 0 {
        return;
    }
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(100));
        // SAFETY: signal 0 only checks whether the process exists.
        if unsafe { libc::kill(*pid, 0) } != 0 {
            return;
        }
    }
    // SAFETY: same process as above, still alive after five seconds.
    unsafe {
        libc::kill(*pid, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn register_exit_shutdown(handle: &ClusterHandle) {
    let data_dir = handle.settings().data_dir.clone();
    let Some(pid) = read_postmaster_pid(&data_dir) else {
        return;
    };
    if POSTMASTER.set((data_dir, pid)).is_err() {
        return;
    }

    // SAFETY: `stop_postmaster` is a plain `extern "C"` function.
    let rc = unsafe { libc::atexit(stop_postmaster) };
    if rc != 0 {
        eprintln!("pg-embed: atexit registration failed (rc={rc}); postmaster {pid} may outlive the tests");
    }
}

#[cfg(not(unix))]
fn register_exit_shutdown(_handle: &ClusterHandle) {}

#[cfg(test)]
mod tests {
    use cap_std::ambient_authority;
    use cap_std::fs::Dir;
    use rstest::rstest;

    #[rstest]
    #[case("12345\n/srv/data\n5432\n", Some(12345))]
    #[case("not-a-pid\n", None)]
    fn postmaster_pid_is_the_first_line(#[case] content: &str, #[case] expected: Option<i32>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = Dir::open_ambient_dir(temp.path(), ambient_authority()).expect("open dir");
        dir.write("postmaster.pid", content).expect("write pid file");

        assert_eq!(super::read_postmaster_pid(temp.path()), expected);
    }

    #[rstest]
    fn missing_pid_file_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(super::read_postmaster_pid(temp.path()), None);
    }

    #[rstest]
    fn existing_password_is_kept() {
        let _guard = env_lock::lock_env([("PG_PASSWORD", Some("custom_value"))]);
        super::pin_password();
        assert_eq!(
            std::env::var("PG_PASSWORD").expect("PG_PASSWORD set"),
            "custom_value"
        );
    }
}
