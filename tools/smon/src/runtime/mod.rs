use crate::errors::{CommandError, CommandErrorKind, SmonError};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SmonError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, SmonError>;
    fn kill(&self, handle: u64) -> Result<(), SmonError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, SmonError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, SmonError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SmonError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), SmonError>;
    fn exists(&self, path: &Path) -> bool;
    fn len(&self, path: &Path) -> Result<u64, SmonError>;
    /// Reads at most `max_bytes` starting at byte `offset`.
    fn read_range(&self, path: &Path, offset: u64, max_bytes: u64) -> Result<Vec<u8>, SmonError>;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), SmonError>;
    fn draw(&self, frame: &str) -> Result<(), SmonError>;
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, SmonError> {
    mutex
        .lock()
        .map_err(|_| SmonError::Io(format!("{what} lock poisoned")))
}

fn io_error(path: &Path, error: std::io::Error) -> SmonError {
    match error.kind() {
        std::io::ErrorKind::NotFound => CommandError::new(
            CommandErrorKind::NotFound,
            path.display().to_string(),
            error.to_string(),
        )
        .into(),
        std::io::ErrorKind::PermissionDenied => CommandError::new(
            CommandErrorKind::PermissionDenied,
            path.display().to_string(),
            error.to_string(),
        )
        .into(),
        _ => SmonError::Io(format!("{}: {error}", path.display())),
    }
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SmonError> {
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SmonError> {
        std::fs::write(path, contents).map_err(|e| io_error(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SmonError> {
        std::fs::create_dir_all(path).map_err(|e| io_error(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn len(&self, path: &Path) -> Result<u64, SmonError> {
        std::fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|e| io_error(path, e))
    }

    fn read_range(&self, path: &Path, offset: u64, max_bytes: u64) -> Result<Vec<u8>, SmonError> {
        let mut file = std::fs::File::open(path).map_err(|e| io_error(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_error(path, e))?;
        let mut buf = Vec::new();
        file.take(max_bytes)
            .read_to_end(&mut buf)
            .map_err(|e| io_error(path, e))?;
        Ok(buf)
    }
}

struct RunningChild {
    child: std::process::Child,
    program: String,
    timeout: Option<Duration>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

#[derive(Default)]
struct ProcessTable {
    next_handle: u64,
    children: HashMap<u64, RunningChild>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessTable>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessTable::default()),
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SmonError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CommandError::from_io(&request.program, &e))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut state = lock(&self.state, "process")?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(
            handle,
            RunningChild {
                child,
                program: request.program,
                timeout: request.timeout,
                stdout,
                stderr,
            },
        );
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, SmonError> {
        let running = lock(&self.state, "process")?.children.remove(&handle);
        let RunningChild {
            mut child,
            program,
            timeout,
            stdout,
            stderr,
        } = running.ok_or_else(|| SmonError::Io(format!("unknown process handle {handle}")))?;

        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
        let status = loop {
            match child
                .try_wait()
                .map_err(|e| CommandError::from_io(&program, &e))?
            {
                Some(status) => break status,
                None => {
                    if let Some((deadline, limit)) = deadline {
                        if Instant::now() >= deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(CommandError::new(
                                CommandErrorKind::Timeout,
                                program,
                                format!("no exit after {:.1}s", limit.as_secs_f64()),
                            )
                            .into());
                        }
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    fn kill(&self, handle: u64) -> Result<(), SmonError> {
        let mut running = lock(&self.state, "process")?
            .children
            .remove(&handle)
            .ok_or_else(|| SmonError::Io(format!("unknown process handle {handle}")))?;

        running
            .child
            .kill()
            .map_err(|e| CommandError::from_io(&running.program, &e).into())
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), SmonError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| SmonError::Io(e.to_string()))
    }

    fn draw(&self, frame: &str) -> Result<(), SmonError> {
        self.write_line(frame)
    }
}

#[derive(Clone)]
pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<SmonError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        if let Ok(mut files) = fs.files.lock() {
            files.insert(path.into(), contents.into());
        }
        fs
    }

    pub fn set_fail_next(&self, error: SmonError) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(error);
        }
    }

    pub fn append(&self, path: &Path, contents: &str) {
        if let Ok(mut files) = self.files.lock() {
            files
                .entry(path.to_path_buf())
                .or_default()
                .push_str(contents);
        }
    }

    fn maybe_fail(&self) -> Result<(), SmonError> {
        if let Some(err) = lock(&self.fail_next, "fail")?.take() {
            return Err(err);
        }
        Ok(())
    }

    fn missing(path: &Path) -> SmonError {
        CommandError::new(
            CommandErrorKind::NotFound,
            path.display().to_string(),
            "missing file",
        )
        .into()
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SmonError> {
        self.maybe_fail()?;
        lock(&self.files, "files")?
            .get(path)
            .cloned()
            .ok_or_else(|| Self::missing(path))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SmonError> {
        self.maybe_fail()?;
        lock(&self.files, "files")?.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SmonError> {
        self.maybe_fail()?;
        lock(&self.dirs, "dirs")?.push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }

    fn len(&self, path: &Path) -> Result<u64, SmonError> {
        self.maybe_fail()?;
        lock(&self.files, "files")?
            .get(path)
            .map(|contents| contents.len() as u64)
            .ok_or_else(|| Self::missing(path))
    }

    fn read_range(&self, path: &Path, offset: u64, max_bytes: u64) -> Result<Vec<u8>, SmonError> {
        self.maybe_fail()?;
        let files = lock(&self.files, "files")?;
        let contents = files.get(path).ok_or_else(|| Self::missing(path))?;
        let bytes = contents.as_bytes();
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(max_bytes as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
    draws: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn drawn_frames(&self) -> Vec<String> {
        self.draws.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), SmonError> {
        lock(&self.writes, "writes")?.push(line.to_string());
        Ok(())
    }

    fn draw(&self, frame: &str) -> Result<(), SmonError> {
        lock(&self.draws, "draw")?.push(frame.to_string());
        Ok(())
    }
}

type FakeResponse = Result<ProcessOutput, SmonError>;

/// Scripted process runner. Responses queued for a specific program win
/// over the shared queue.
#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<VecDeque<FakeResponse>>>,
    program_responses: Arc<Mutex<HashMap<String, VecDeque<FakeResponse>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    kills: Arc<Mutex<Vec<u64>>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: FakeResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(output);
        }
    }

    pub fn push_program_response(&self, program: &str, output: FakeResponse) {
        if let Ok(mut responses) = self.program_responses.lock() {
            responses
                .entry(program.to_string())
                .or_default()
                .push_back(output);
        }
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn spawned_programs(&self) -> Vec<String> {
        self.spawned()
            .into_iter()
            .map(|request| request.program)
            .collect()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SmonError> {
        let mut spawned = lock(&self.spawned, "spawned")?;
        spawned.push(request);
        Ok((spawned.len() - 1) as u64)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, SmonError> {
        let program = lock(&self.spawned, "spawned")?
            .get(handle as usize)
            .map(|request| request.program.clone())
            .ok_or_else(|| SmonError::Io(format!("unknown process handle {handle}")))?;
        if let Some(queued) = lock(&self.program_responses, "responses")?
            .get_mut(&program)
            .and_then(VecDeque::pop_front)
        {
            return queued;
        }
        lock(&self.responses, "responses")?
            .pop_front()
            .unwrap_or_else(|| Err(SmonError::Io(format!("no fake response queued for {program}"))))
    }

    fn kill(&self, handle: u64) -> Result<(), SmonError> {
        lock(&self.kills, "kills")?.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_runner_prefers_program_specific_responses() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput::success("shared")));
        runner.push_program_response("sinfo", Ok(ProcessOutput::success("nodes")));

        let nodes = runner
            .run(ProcessRequest::new("sinfo", &[]))
            .expect("sinfo");
        let shared = runner
            .run(ProcessRequest::new("squeue", &[]))
            .expect("squeue");
        assert_eq!(nodes.stdout, "nodes");
        assert_eq!(shared.stdout, "shared");
        assert_eq!(runner.spawned_programs(), vec!["sinfo", "squeue"]);
    }

    #[test]
    fn fake_file_system_reads_byte_ranges() {
        let fs = FakeFileSystem::with_file("/log", "0123456789");
        assert_eq!(fs.len(Path::new("/log")).expect("len"), 10);
        assert_eq!(fs.read_range(Path::new("/log"), 7, 100).expect("tail"), b"789");
        assert_eq!(fs.read_range(Path::new("/log"), 2, 3).expect("mid"), b"234");
        let missing = fs.len(Path::new("/nope")).expect_err("missing");
        assert!(matches!(
            missing,
            SmonError::Command(CommandError {
                kind: CommandErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn production_runner_reports_missing_executable_as_not_available() {
        let runner = ProductionProcessRunner::new();
        let err = runner
            .run(ProcessRequest::new("/definitely/not/installed/squeue", &[]))
            .expect_err("must fail");
        assert!(matches!(
            err,
            SmonError::Command(CommandError {
                kind: CommandErrorKind::NotAvailable,
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_kills_children_past_their_timeout() {
        let runner = ProductionProcessRunner::new();
        let started = Instant::now();
        let err = runner
            .run(ProcessRequest::new("sleep", &["5"]).with_timeout(Duration::from_millis(100)))
            .expect_err("timeout");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(
            err,
            SmonError::Command(CommandError {
                kind: CommandErrorKind::Timeout,
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_captures_output_and_exit_code() {
        let runner = ProductionProcessRunner::new();
        let out = runner
            .run(ProcessRequest::new("sh", &["-c", "echo out; echo err >&2; exit 3"]))
            .expect("ran");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn production_file_system_reads_ranges_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slurm-1.out");
        std::fs::write(&path, "line1\nline2\n").expect("write");
        let fs = ProductionFileSystem;
        assert_eq!(fs.len(&path).expect("len"), 12);
        assert_eq!(fs.read_range(&path, 6, 64).expect("range"), b"line2\n");
    }
}
