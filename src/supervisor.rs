//! Standalone bootstrap: run `php -S` as the only server and babysit it.
//!
//! Stale interpreter servers are killed and the port is freed before the
//! child starts. The supervisor exits with the child's own exit code, or 0
//! when it was asked to stop by a signal.

use crate::config::{ Config, InterpreterConfig };
use crate::error::SupervisorError;
use std::net::{ SocketAddr, TcpStream };
use std::path::{ Path, PathBuf };
use std::process::{ Child, Command, Stdio };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread;
use std::time::{ Duration, Instant };

const SETTLE_DELAY: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    interpreter: InterpreterConfig,
    document_root: PathBuf,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            document_root: config.document_root.clone(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn run(&self) -> Result<i32, SupervisorError> {
        self.prepare()?;

        // before the spawn, so an early SIGINT cannot orphan the child
        crate::signals::install();
        self.launch(crate::signals::flag())
    }

    /// Spawns the server unless a stop was already requested, then watches it.
    fn launch(&self, stop: &AtomicBool) -> Result<i32, SupervisorError> {
        if stop.load(Ordering::SeqCst) {
            tracing::info!("stop requested before launch");
            return Ok(0);
        }

        let child = spawn_server(&self.interpreter, &self.document_root)?;
        tracing::info!(
            pid = child.id(),
            addr = %self.interpreter.standalone_addr(),
            "interpreter server started"
        );
        self.watch(child, stop)
    }

    /// Best-effort cleanup of whatever still holds the port. Refuses to go
    /// on if something is still listening afterwards.
    fn prepare(&self) -> Result<(), SupervisorError> {
        let pattern = server_pattern(&self.interpreter.path);
        tracing::info!(pattern = %pattern, "killing stale interpreter servers");
        run_quietly("pkill", &["-f", &pattern]);
        thread::sleep(SETTLE_DELAY);

        let port = self.interpreter.standalone_port;
        if port_in_use(port) {
            tracing::warn!(port, "port still in use, trying to free it");
            run_quietly("fuser", &["-k", &format!("{}/tcp", port)]);
            thread::sleep(SETTLE_DELAY);

            if port_in_use(port) {
                return Err(SupervisorError::PortInUse(port));
            }
        }
        Ok(())
    }

    /// Polls `child` until it exits or `stop` is raised.
    pub fn watch(&self, mut child: Child, stop: &AtomicBool) -> Result<i32, SupervisorError> {
        loop {
            if stop.load(Ordering::SeqCst) {
                tracing::info!(pid = child.id(), "terminating interpreter server");
                terminate_child(&mut child, TERMINATE_GRACE);
                return Ok(0);
            }

            if let Some(status) = child.try_wait().map_err(SupervisorError::Wait)? {
                let code = status.code().unwrap_or(1);
                tracing::warn!(code, "interpreter server exited");
                return Ok(code);
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// `<program> -S <addr>` in the document root, output inherited.
pub fn spawn_server(interpreter: &InterpreterConfig, root: &Path) -> Result<Child, SupervisorError> {
    let addr = interpreter.standalone_addr();
    Command::new(&interpreter.path)
        .arg("-S")
        .arg(&addr)
        .current_dir(root)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: interpreter.path.clone(),
            addr,
            source,
        })
}

/// SIGTERM, then SIGKILL if the child is still around after `grace`.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }

    tracing::warn!(pid = child.id(), "interpreter ignored SIGTERM, killing");
    let _ = child.kill();
    let _ = child.wait();
}

pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
}

/// Command-line fragment identifying interpreter servers, e.g. `php -S`.
///
/// Matching on the bare program name would also hit this process.
fn server_pattern(program: &str) -> String {
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string());
    format!("{} -S", name)
}

fn run_quietly(program: &str, args: &[&str]) {
    let result = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::debug!(program, error = %e, "cleanup helper unavailable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn supervisor() -> Supervisor {
        Supervisor {
            interpreter: InterpreterConfig::default(),
            document_root: PathBuf::from("."),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_server_pattern() {
        assert_eq!(server_pattern("php"), "php -S");
        assert_eq!(server_pattern("/nix/store/abc-php-8.2/bin/php"), "php -S");
    }

    #[test]
    fn test_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
        drop(listener);
        assert!(!port_in_use(port));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_propagates() {
        let child = Command::new("/bin/sh").arg("-c").arg("exit 7").spawn().unwrap();
        let stop = AtomicBool::new(false);
        assert_eq!(supervisor().watch(child, &stop).unwrap(), 7);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_flag_terminates_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as libc::pid_t;
        let stop = AtomicBool::new(true);

        let started = Instant::now();
        assert_eq!(supervisor().watch(child, &stop).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        // reaped, so the pid is gone
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }

    #[test]
    fn test_stop_before_launch_spawns_nothing() {
        let mut supervisor = supervisor();
        // would fail with `Spawn` if it got that far
        supervisor.interpreter.path = "/nonexistent/php".to_string();
        let stop = AtomicBool::new(true);
        assert_eq!(supervisor.launch(&stop).unwrap(), 0);

        stop.store(false, Ordering::SeqCst);
        assert!(matches!(supervisor.launch(&stop), Err(SupervisorError::Spawn { .. })));
    }

    #[test]
    fn test_spawn_failure() {
        let interpreter = InterpreterConfig {
            path: "/nonexistent/php".to_string(),
            ..InterpreterConfig::default()
        };
        let err = spawn_server(&interpreter, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("-S 0.0.0.0:5000"));
    }
}
