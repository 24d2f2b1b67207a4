//! CGI bridge
//!
//! Turns a request into a CGI environment, runs a script through the
//! interpreter and converts whatever it printed back into a response.

use crate::error::CgiError;
use crate::http::{ HttpRequest, HttpResponse };
use std::collections::BTreeMap;
use std::io::{ self, Read, Write };
use std::path::{ Path, PathBuf };
use std::os::unix::process::CommandExt;
use std::process::{ Child, Command, Stdio };
use std::sync::mpsc::{ self, Receiver, RecvTimeoutError };
use std::thread;
use std::time::{ Duration, Instant };

pub type CgiEnvironment = BTreeMap<String, String>;

const DEFAULT_STATUS: &str = "200 OK";
const DEFAULT_CONTENT_TYPE: &str = "text/html";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a finished interpreter run produced.
#[derive(Debug, Clone, Default)]
pub struct InterpreterOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl InterpreterOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one script with an environment and optional stdin bytes.
///
/// The bridge never spawns processes itself, so tests can swap in a fake.
pub trait Interpreter: Send + Sync {
    fn execute(
        &self,
        script: &Path,
        env: &CgiEnvironment,
        input: Option<&[u8]>
    ) -> Result<InterpreterOutput, CgiError>;
}

/// `<program> -f <script>` as a child process, killed after `timeout`.
pub struct ProcessInterpreter {
    program: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ProcessInterpreter {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }
}

impl Interpreter for ProcessInterpreter {
    fn execute(
        &self,
        script: &Path,
        env: &CgiEnvironment,
        input: Option<&[u8]>
    ) -> Result<InterpreterOutput, CgiError> {
        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(script)
            .current_dir(&self.working_dir)
            .envs(env)
            .process_group(0)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| CgiError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        tracing::debug!(pid = child.id(), script = %script.display(), "interpreter started");
        let deadline = Instant::now() + self.timeout;

        // Body goes through a pipe fed from its own thread so a child that
        // writes before reading cannot deadlock against us.
        let writer = match (child.stdin.take(), input) {
            (Some(mut stdin), Some(body)) => {
                let body = body.to_vec();
                Some(pipe_thread(move || stdin.write_all(&body)))
            }
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    kill_group(&mut child);
                    return Err(e.into());
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(pid = child.id(), script = %script.display(), "interpreter timed out, killing");
                kill_group(&mut child);
                return Err(CgiError::Timeout(self.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Anything the script left running in the background still holds
        // the pipes, so collecting them is bounded by the same deadline.
        let collected = collect_pipes(writer, stdout_reader, stderr_reader, deadline);
        let (stdout, stderr) = match collected {
            Ok(output) => output,
            Err(Collect::TimedOut) => {
                tracing::warn!(pid = child.id(), script = %script.display(), "interpreter output still open at deadline, killing");
                kill_group(&mut child);
                return Err(CgiError::Timeout(self.timeout));
            }
            Err(Collect::Failed(e)) => {
                kill_group(&mut child);
                return Err(e.into());
            }
        };

        Ok(InterpreterOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

enum Collect {
    TimedOut,
    Failed(io::Error),
}

fn collect_pipes(
    writer: Option<Receiver<io::Result<()>>>,
    stdout: Option<Receiver<io::Result<Vec<u8>>>>,
    stderr: Option<Receiver<io::Result<Vec<u8>>>>,
    deadline: Instant
) -> Result<(Vec<u8>, Vec<u8>), Collect> {
    if let Some(rx) = writer {
        match collect(&rx, deadline) {
            Ok(()) => {}
            // the script is free to ignore its input
            Err(Collect::Failed(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => {
                return Err(e);
            }
        }
    }
    let stdout = match stdout {
        Some(rx) => collect(&rx, deadline)?,
        None => Vec::new(),
    };
    let stderr = match stderr {
        Some(rx) => collect(&rx, deadline)?,
        None => Vec::new(),
    };
    Ok((stdout, stderr))
}

fn pipe_thread<T, F>(work: F) -> Receiver<io::Result<T>>
    where T: Send + 'static, F: FnOnce() -> io::Result<T> + Send + 'static
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(work());
    });
    rx
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> Receiver<io::Result<Vec<u8>>> {
    pipe_thread(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect<T>(rx: &Receiver<io::Result<T>>, deadline: Instant) -> Result<T, Collect> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map_err(Collect::Failed),
        Err(RecvTimeoutError::Timeout) => Err(Collect::TimedOut),
        Err(RecvTimeoutError::Disconnected) => {
            Err(Collect::Failed(io::Error::other("interpreter pipe thread panicked")))
        }
    }
}

/// SIGKILL for the child and everything it spawned, then reap the child.
fn kill_group(child: &mut Child) {
    // the child leads its own group, see `process_group(0)`
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// The script a request will run, and the name it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    pub filename: PathBuf,
    /// Logical path with a leading slash, e.g. `/router.php`.
    pub name: String,
}

impl ScriptTarget {
    pub fn new(filename: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            filename: filename.into(),
            name: format!("/{}", name.trim_start_matches('/')),
        }
    }
}

pub struct CgiBridge {
    interpreter: Box<dyn Interpreter>,
    document_root: PathBuf,
    server_name: String,
    server_port: u16,
}

impl CgiBridge {
    pub fn new(
        interpreter: Box<dyn Interpreter>,
        document_root: impl Into<PathBuf>,
        server_name: impl Into<String>,
        server_port: u16
    ) -> Self {
        Self {
            interpreter,
            document_root: document_root.into(),
            server_name: server_name.into(),
            server_port,
        }
    }

    /// Runs `script` for `req`. Failures become a single plain-text 500.
    pub fn handle(&self, req: &HttpRequest, script: &ScriptTarget) -> HttpResponse {
        match self.run(req, script) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(script = %script.name, error = %e, "CGI execution failed");
                HttpResponse::internal_error(e.to_string())
            }
        }
    }

    pub fn run(&self, req: &HttpRequest, script: &ScriptTarget) -> Result<HttpResponse, CgiError> {
        let env = self.build_env(req, script);
        let input = if req.body.is_empty() { None } else { Some(req.body.as_slice()) };

        let output = self.interpreter.execute(&script.filename, &env, input)?;

        if !output.stderr.is_empty() {
            tracing::warn!(
                script = %script.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "interpreter wrote to stderr"
            );
        }
        if !output.success() {
            let status = match output.exit_code {
                Some(code) => format!("exit status {}", code),
                None => "a signal".to_string(),
            };
            return Err(CgiError::ExitStatus(status));
        }

        Ok(parse_output(&output.stdout))
    }

    /// CGI variables for one run. The child also inherits our own
    /// environment; these entries take precedence.
    pub fn build_env(&self, req: &HttpRequest, script: &ScriptTarget) -> CgiEnvironment {
        let mut env = CgiEnvironment::new();

        for (name, value) in &req.headers {
            // `Proxy` would land in HTTP_PROXY, which HTTP clients in the script honour
            if name == "content-type" || name == "content-length" || name == "proxy" {
                continue;
            }
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            env.insert(key, value.clone());
        }

        let query = req.query();
        let path = req.path();
        let request_uri = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query)
        };

        let server_name = req
            .host_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.server_name.clone());

        env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
        env.insert("SERVER_PROTOCOL".to_string(), req.version.clone());
        env.insert("SERVER_SOFTWARE".to_string(), concat!("phpgate/", env!("CARGO_PKG_VERSION")).to_string());
        env.insert("SERVER_NAME".to_string(), server_name);
        env.insert("SERVER_PORT".to_string(), self.server_port.to_string());
        env.insert("DOCUMENT_ROOT".to_string(), self.document_root.display().to_string());
        env.insert("REDIRECT_STATUS".to_string(), "200".to_string());

        env.insert("QUERY_STRING".to_string(), query.to_string());
        env.insert("REQUEST_METHOD".to_string(), req.method.clone());
        env.insert("SCRIPT_FILENAME".to_string(), script.filename.display().to_string());
        env.insert("SCRIPT_NAME".to_string(), script.name.clone());
        env.insert("REQUEST_URI".to_string(), request_uri);

        let carries_body = req.method.eq_ignore_ascii_case("POST") || !req.body.is_empty();
        if carries_body && req.content_length() > 0 {
            env.insert("CONTENT_LENGTH".to_string(), req.body.len().to_string());
            env.insert(
                "CONTENT_TYPE".to_string(),
                req.header("content-type").unwrap_or_default().to_string()
            );
        }

        env
    }
}

/// Splits raw interpreter output into status, headers and body.
///
/// Output without a blank-line separator is all body, served as
/// `200 OK` HTML. Header lines without a colon are dropped.
pub fn parse_output(output: &[u8]) -> HttpResponse {
    let (header_part, body_part) = match split_header_block(output) {
        Some(parts) => parts,
        None => {
            return HttpResponse::new(DEFAULT_STATUS)
                .header("Content-Type", DEFAULT_CONTENT_TYPE)
                .body(output.to_vec());
        }
    };

    let mut status = DEFAULT_STATUS.to_string();
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in String::from_utf8_lossy(header_part).lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with("HTTP/") {
            if let Some((_, text)) = line.split_once(' ') {
                if !text.trim().is_empty() {
                    status = text.trim().to_string();
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                let name = name.trim();
                if name.eq_ignore_ascii_case("status") {
                    status = value.trim().to_string();
                } else {
                    headers.push((name.to_string(), value.trim().to_string()));
                }
            }
            _ => {
                tracing::debug!(line, "dropping malformed CGI header line");
            }
        }
    }

    let mut response = HttpResponse {
        status,
        headers,
        body: body_part.to_vec(),
    };
    if !response.has_header("content-length") {
        response.headers.push(("Content-Length".to_string(), response.body.len().to_string()));
    }
    response
}

/// Only a CRLF blank line ends the header block. CLI builds of PHP print
/// bare page content, where a lone `\n\n` is just part of the body.
fn split_header_block(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = find_bytes(output, b"\r\n\r\n")?;
    Some((&output[..end], &output[end + 4..]))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
