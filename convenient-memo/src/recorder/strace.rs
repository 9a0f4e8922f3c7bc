//! Traced recorder built on `strace`
//!
//! Each invocation runs as
//! `strace -f -q -y [--kill-on-exit] -o <trace-file> -e trace=file,process,fchdir -- <program> <args>`
//! with a trace file of its own, so concurrent invocations never see each
//! other's accesses. `-y` makes strace print the path behind every
//! descriptor argument (`3</w/include>`), which is what lets `openat` and
//! `fchdir` relative to an open directory be resolved. Once the process
//! exits the trace is parsed by [`TraceParser`], which follows
//! working-directory changes per pid and classifies every successful file
//! syscall as a read or a write.

use super::{is_ignored, normalize, AccessSet, Recorder, RecorderKind, ResolvedCommand, Session};
use crate::error::{MemoError, MemoResult};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Whether `strace` can trace a trivial command on this host.
///
/// Fails on hosts without the binary and in containers that forbid ptrace.
pub fn is_usable(strace: &Path) -> bool {
    runs_quietly(strace, &["-f", "-q", "-o", "/dev/null", "--", "true"])
}

/// Whether this `strace` understands `--kill-on-exit` (strace 6.1 and later)
pub fn supports_kill_on_exit(strace: &Path) -> bool {
    runs_quietly(
        strace,
        &["--kill-on-exit", "-f", "-q", "-o", "/dev/null", "--", "true"],
    )
}

fn runs_quietly(program: &Path, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Syscall-tracing backend
#[derive(Debug, Clone)]
pub struct StraceRecorder {
    strace: PathBuf,
    ignore: Vec<PathBuf>,
    kill_on_exit: bool,
}

impl StraceRecorder {
    /// Recorder running `strace`, dropping paths under `ignore`.
    ///
    /// Asks the tracer once whether it can take its tracees down with it.
    pub fn new(strace: PathBuf, ignore: Vec<PathBuf>) -> Self {
        let kill_on_exit = supports_kill_on_exit(&strace);
        if !kill_on_exit {
            warn!(
                "`{}` lacks --kill-on-exit; tracees rely on process-group cleanup",
                strace.display()
            );
        }
        Self {
            strace,
            ignore,
            kill_on_exit,
        }
    }
}

impl Recorder for StraceRecorder {
    fn kind(&self) -> RecorderKind {
        RecorderKind::Traced
    }

    fn isolates_concurrent(&self) -> bool {
        true
    }

    fn begin(&self, command: &ResolvedCommand) -> MemoResult<Box<dyn Session>> {
        let trace = tempfile::Builder::new()
            .prefix("memo-trace-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| MemoError::Trace(format!("cannot create trace file: {e}")))?;
        debug!("Tracing `{}` into {}", command.identity, trace.path().display());

        Ok(Box::new(StraceSession {
            strace: self.strace.clone(),
            ignore: self.ignore.clone(),
            kill_on_exit: self.kill_on_exit,
            command: command.clone(),
            trace,
        }))
    }
}

struct StraceSession {
    strace: PathBuf,
    ignore: Vec<PathBuf>,
    kill_on_exit: bool,
    command: ResolvedCommand,
    trace: NamedTempFile,
}

impl StraceSession {
    fn tracer_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-f".into(), "-q".into(), "-y".into()];
        if self.kill_on_exit {
            args.push("--kill-on-exit".into());
        }
        args.push("-o".into());
        args.push(self.trace.path().into());
        args.extend(["-e", "trace=file,process,fchdir", "--"].map(OsString::from));
        args.push(self.command.executable.clone().into());
        args.extend(self.command.args.iter().map(OsString::from));
        args
    }
}

impl Session for StraceSession {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.strace);
        let _ = command
            .args(self.tracer_args())
            .current_dir(&self.command.cwd)
            .envs(&self.command.env);
        command
    }

    fn finish(self: Box<Self>) -> MemoResult<AccessSet> {
        let bytes = fs::read(self.trace.path()).map_err(|e| {
            MemoError::Trace(format!("cannot read {}: {e}", self.trace.path().display()))
        })?;
        let text = String::from_utf8_lossy(&bytes);

        let mut parser = TraceParser::new(&self.command.cwd)?;
        for line in text.lines() {
            parser.feed(line);
        }
        let mut accesses = parser.finish().map_err(|e| match e {
            MemoError::Trace(reason) => {
                MemoError::Trace(format!("`{}`: {reason}", self.command.identity))
            }
            other => other,
        })?;

        let ignore = &self.ignore;
        accesses.retain(|path| {
            if is_ignored(ignore, path) {
                return false;
            }
            // Directories, sockets and files deleted before exit are not tracked.
            let keep = path.is_file();
            if !keep {
                debug!("Dropping non-file access {}", path.display());
            }
            keep
        });

        debug!(
            "Trace of `{}`: {} inputs, {} outputs",
            self.command.identity,
            accesses.inputs().len(),
            accesses.outputs().len()
        );
        Ok(accesses)
    }
}

/// Incremental parser for `strace -f` output
pub struct TraceParser {
    /// `<pid>  <rest>`
    pid_regex: Regex,
    /// `name(args) = result`
    call_regex: Regex,
    /// `name(partial-args <unfinished ...>`
    unfinished_regex: Regex,
    /// `<... name resumed>rest`
    resumed_regex: Regex,

    root_cwd: PathBuf,
    cwds: BTreeMap<u32, PathBuf>,
    /// Pids whose working directory was guessed before their parent's
    /// fork returned
    assumed: BTreeSet<u32>,
    pending: BTreeMap<u32, String>,
    accesses: AccessSet,
    /// Accesses that could not be pinned to a path
    unresolved: Vec<String>,
}

impl TraceParser {
    /// Parser for a process tree started in `cwd`
    pub fn new(cwd: impl Into<PathBuf>) -> MemoResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| MemoError::Trace(format!("bad pattern: {e}")))
        };
        Ok(Self {
            pid_regex: compile(r"^(\d+)\s+(.*)$")?,
            call_regex: compile(r"^(\w+)\((.*)\)\s+=\s+(-?\d+|\?)")?,
            unfinished_regex: compile(r"^(\w+\(.*?)\s*<unfinished \.\.\.>$")?,
            resumed_regex: compile(r"^<\.\.\. \w+ resumed>\s?(.*)$")?,
            root_cwd: cwd.into(),
            cwds: BTreeMap::new(),
            assumed: BTreeSet::new(),
            pending: BTreeMap::new(),
            accesses: AccessSet::new(),
            unresolved: Vec::new(),
        })
    }

    /// Consume one line of trace output
    pub fn feed(&mut self, line: &str) {
        let line = line.trim_end();
        let (pid, body) = match self.pid_regex.captures(line) {
            Some(caps) => {
                let pid = caps[1].parse::<u32>().unwrap_or(0);
                (pid, caps.get(2).map_or("", |m| m.as_str()).to_string())
            }
            None => (0, line.to_string()),
        };

        if let Some(caps) = self.unfinished_regex.captures(&body) {
            let _ = self.pending.insert(pid, caps[1].to_string());
            return;
        }

        let resumed = self
            .resumed_regex
            .captures(&body)
            .map(|caps| caps[1].to_string());
        let body = match resumed {
            Some(rest) => match self.pending.remove(&pid) {
                Some(head) => format!("{head}{rest}"),
                None => return,
            },
            None => body,
        };

        let Some(caps) = self.call_regex.captures(&body) else {
            // Signals, exit notices, and anything else that is not a call.
            return;
        };
        let result = &caps[3];
        let Ok(result) = result.parse::<i64>() else {
            return;
        };
        if result < 0 {
            return;
        }
        let name = caps[1].to_string();
        let args = split_args(&caps[2]);
        self.apply(pid, &name, &args, result);
    }

    /// Accesses seen so far.
    ///
    /// Fails when some access was relative to a descriptor the trace does
    /// not name: a partial record would let a later run be skipped wrongly.
    pub fn finish(self) -> MemoResult<AccessSet> {
        match self.unresolved.first() {
            None => Ok(self.accesses),
            Some(first) => Err(MemoError::Trace(format!(
                "{} accesses through unnamed descriptors (first: {first})",
                self.unresolved.len()
            ))),
        }
    }

    fn cwd(&mut self, pid: u32) -> PathBuf {
        if let Some(cwd) = self.cwds.get(&pid) {
            return cwd.clone();
        }
        let _ = self.cwds.insert(pid, self.root_cwd.clone());
        let _ = self.assumed.insert(pid);
        self.root_cwd.clone()
    }

    /// Absolute path for `path` relative to `dirfd`.
    ///
    /// A relative path under a descriptor without a `<path>` decoration is
    /// noted as unresolved. An empty path (`AT_EMPTY_PATH`) names the
    /// descriptor itself, which may be a pipe or socket and is then skipped.
    fn resolve(&mut self, pid: u32, dirfd: Option<&str>, path: Option<PathBuf>) -> Option<PathBuf> {
        let path = path?;
        if path.is_absolute() {
            return Some(normalize(&path));
        }
        let fd = match dirfd {
            None | Some("AT_FDCWD") => return Some(normalize(&self.cwd(pid).join(path))),
            Some(fd) => fd,
        };
        match descriptor_path(fd) {
            Some(dir) if dir.is_absolute() => Some(normalize(&dir.join(path))),
            _ if path.as_os_str().is_empty() => None,
            _ => {
                self.unresolved
                    .push(format!("{} relative to descriptor {fd}", path.display()));
                None
            }
        }
    }

    fn path_arg(&mut self, pid: u32, args: &[String], dirfd: Option<usize>, path: usize) -> Option<PathBuf> {
        let dirfd = dirfd.and_then(|i| args.get(i)).map(String::as_str);
        let path = args.get(path).and_then(|a| unquote(a));
        self.resolve(pid, dirfd, path)
    }

    fn apply(&mut self, pid: u32, name: &str, args: &[String], result: i64) {
        match name {
            "open" | "creat" | "openat" | "openat2" => {
                let (dirfd, path, flags) = match name {
                    "open" => (None, 0, Some(1)),
                    "creat" => (None, 0, None),
                    _ => (Some(0), 1, Some(2)),
                };
                let Some(path) = self.path_arg(pid, args, dirfd, path) else {
                    return;
                };
                let writes = match flags {
                    None => true,
                    Some(i) => args.get(i).is_some_and(|f| is_write_flags(f)),
                };
                if writes {
                    self.accesses.write(path);
                } else {
                    self.accesses.read(path);
                }
            }
            "stat" | "lstat" | "stat64" | "lstat64" | "access" | "readlink" | "execve" => {
                if let Some(path) = self.path_arg(pid, args, None, 0) {
                    self.accesses.read(path);
                }
            }
            "newfstatat" | "fstatat64" | "statx" | "faccessat" | "faccessat2" | "readlinkat"
            | "execveat" => {
                if let Some(path) = self.path_arg(pid, args, Some(0), 1) {
                    self.accesses.read(path);
                }
            }
            "truncate" | "truncate64" => {
                if let Some(path) = self.path_arg(pid, args, None, 0) {
                    self.accesses.write(path);
                }
            }
            "chdir" => {
                if let Some(path) = self.path_arg(pid, args, None, 0) {
                    let _ = self.cwds.insert(pid, path);
                    let _ = self.assumed.remove(&pid);
                }
            }
            "fchdir" => match args.first().and_then(|fd| descriptor_path(fd)) {
                Some(dir) if dir.is_absolute() => {
                    let _ = self.cwds.insert(pid, normalize(&dir));
                    let _ = self.assumed.remove(&pid);
                }
                _ => self.unresolved.push(format!(
                    "fchdir({}) by pid {pid}",
                    args.first().map_or("", String::as_str)
                )),
            },
            "rename" | "link" | "renameat" | "renameat2" | "linkat" => {
                let (old, new) = if name == "rename" || name == "link" {
                    (
                        self.path_arg(pid, args, None, 0),
                        self.path_arg(pid, args, None, 1),
                    )
                } else {
                    (
                        self.path_arg(pid, args, Some(0), 1),
                        self.path_arg(pid, args, Some(2), 3),
                    )
                };
                if name.starts_with("rename") {
                    if let Some(old) = old {
                        self.accesses.remove(&old);
                    }
                }
                if let Some(new) = new {
                    self.accesses.write(new);
                }
            }
            "symlink" | "symlinkat" => {
                let link = if name == "symlink" {
                    self.path_arg(pid, args, None, 1)
                } else {
                    self.path_arg(pid, args, Some(1), 2)
                };
                if let Some(link) = link {
                    self.accesses.write(link);
                }
            }
            "unlink" | "unlinkat" | "rmdir" => {
                let path = if name == "unlinkat" {
                    self.path_arg(pid, args, Some(0), 1)
                } else {
                    self.path_arg(pid, args, None, 0)
                };
                if let Some(path) = path {
                    self.accesses.remove(&path);
                }
            }
            "clone" | "clone3" | "fork" | "vfork" => {
                let Ok(child) = u32::try_from(result) else {
                    return;
                };
                if child == 0 {
                    return;
                }
                let parent_cwd = self.cwd(pid);
                if !self.cwds.contains_key(&child) || self.assumed.contains(&child) {
                    let _ = self.cwds.insert(child, parent_cwd);
                    let _ = self.assumed.remove(&child);
                }
            }
            _ => {}
        }
    }
}

fn is_write_flags(flags: &str) -> bool {
    ["O_WRONLY", "O_RDWR", "O_CREAT", "O_TRUNC", "O_APPEND"]
        .iter()
        .any(|flag| flags.contains(flag))
}

/// Split a syscall argument list at top-level commas. `<...>` counts as
/// nesting so descriptor decorations stay whole.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in args.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '(' | '[' | '{' | '<' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' | '>' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Decode a C string literal as printed by strace
fn unquote(arg: &str) -> Option<PathBuf> {
    decode(arg.strip_prefix('"')?, Some('"'))
}

/// Path behind a `-y` decorated descriptor such as `3</w/include>`
fn descriptor_path(arg: &str) -> Option<PathBuf> {
    let (fd, rest) = arg.split_once('<')?;
    let _ = fd.trim().parse::<i64>().ok()?;
    decode(rest.strip_suffix('>')?, None)
}

/// Undo strace's escaping up to the unescaped `terminator`, or to the end
/// of `text` when there is none
fn decode(text: &str, terminator: Option<char>) -> Option<PathBuf> {
    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if Some(c) == terminator => return Some(bytes_to_path(bytes)),
            '\\' => match chars.next()? {
                'n' => bytes.push(b'\n'),
                't' => bytes.push(b'\t'),
                'r' => bytes.push(b'\r'),
                'v' => bytes.push(0x0b),
                'f' => bytes.push(0x0c),
                'x' => {
                    let mut value = 0u8;
                    for _ in 0..2 {
                        let digit = chars.peek().and_then(|d| d.to_digit(16))?;
                        value = value.wrapping_mul(16).wrapping_add(digit as u8);
                        let _ = chars.next();
                    }
                    bytes.push(value);
                }
                d @ '0'..='7' => {
                    let mut value = d as u32 - '0' as u32;
                    for _ in 0..2 {
                        match chars.peek().and_then(|d| d.to_digit(8)) {
                            Some(digit) => {
                                value = value * 8 + digit;
                                let _ = chars.next();
                            }
                            None => break,
                        }
                    }
                    bytes.push(value as u8);
                }
                other => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            },
            other => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    match terminator {
        Some(_) => None,
        None => Some(bytes_to_path(bytes)),
    }
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(cwd: &str, trace: &str) -> TraceParser {
        let mut parser = TraceParser::new(cwd).unwrap();
        for line in trace.lines() {
            parser.feed(line);
        }
        parser
    }

    fn parse(cwd: &str, trace: &str) -> AccessSet {
        parser(cwd, trace).finish().unwrap()
    }

    fn paths(set: &BTreeSet<PathBuf>) -> Vec<&str> {
        set.iter().map(|p| p.to_str().unwrap()).collect()
    }

    #[test]
    fn test_reads_and_writes_are_classified() {
        let set = parse(
            "/w",
            r#"100   execve("/bin/sh", ["sh", "-c", "cat a.o b.o > lib.a"], 0x7ffd /* 20 vars */) = 0
100   openat(AT_FDCWD, "/etc/ld.so.cache", O_RDONLY|O_CLOEXEC) = 3
100   openat(AT_FDCWD, "lib.a", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 3
100   openat(AT_FDCWD, "a.o", O_RDONLY) = 3
100   openat(AT_FDCWD, "b.o", O_RDONLY) = 3
100   openat(AT_FDCWD, "missing.h", O_RDONLY) = -1 ENOENT (No such file or directory)
100   +++ exited with 0 +++"#,
        );
        assert_eq!(
            paths(set.inputs()),
            vec!["/bin/sh", "/etc/ld.so.cache", "/w/a.o", "/w/b.o"]
        );
        assert_eq!(paths(set.outputs()), vec!["/w/lib.a"]);
    }

    #[test]
    fn test_unfinished_and_resumed_calls_are_joined() {
        let set = parse(
            "/w",
            r#"100   openat(AT_FDCWD, "a.c", O_RDONLY <unfinished ...>
101   openat(AT_FDCWD, "b.o", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 4
100   <... openat resumed>) = 3"#,
        );
        assert_eq!(paths(set.inputs()), vec!["/w/a.c"]);
        assert_eq!(paths(set.outputs()), vec!["/w/b.o"]);
    }

    #[test]
    fn test_chdir_is_tracked_per_process_and_inherited() {
        let set = parse(
            "/w",
            r#"100   chdir("runtime") = 0
100   clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|CLONE_CHILD_SETTID|SIGCHLD, child_tidptr=0x7f) = 101
101   openat(AT_FDCWD, "lmem.c", O_RDONLY) = 3
100   chdir("/elsewhere") = 0
101   openat(AT_FDCWD, "../include/maxhash.h", O_RDONLY) = 3
100   openat(AT_FDCWD, "log", O_WRONLY|O_CREAT|O_APPEND, 0644) = 3"#,
        );
        assert_eq!(
            paths(set.inputs()),
            vec!["/w/include/maxhash.h", "/w/runtime/lmem.c"]
        );
        assert_eq!(paths(set.outputs()), vec!["/elsewhere/log"]);
    }

    #[test]
    fn test_child_seen_before_fork_returns_gets_parent_cwd() {
        let set = parse(
            "/w",
            r#"100   chdir("sub") = 0
100   vfork( <unfinished ...>
101   openat(AT_FDCWD, "x.c", O_RDONLY) = 3
100   <... vfork resumed>) = 101
101   openat(AT_FDCWD, "y.c", O_RDONLY) = 3"#,
        );
        assert!(set.inputs().contains(Path::new("/w/sub/y.c")));
    }

    #[test]
    fn test_rename_moves_output_and_unlink_forgets_temporary() {
        let set = parse(
            "/w",
            r#"100   openat(AT_FDCWD, "/tmp/ccXYZ.s", O_RDWR|O_CREAT|O_EXCL, 0600) = 3
100   openat(AT_FDCWD, "lib.a.tmp", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 4
100   renameat2(AT_FDCWD, "lib.a.tmp", AT_FDCWD, "lib.a", RENAME_NOREPLACE) = 0
100   unlink("/tmp/ccXYZ.s") = 0"#,
        );
        assert!(set.inputs().is_empty());
        assert_eq!(paths(set.outputs()), vec!["/w/lib.a"]);
    }

    #[test]
    fn test_stat_family_counts_as_read() {
        let set = parse(
            "/w",
            r#"100   newfstatat(AT_FDCWD, "a.o", {st_mode=S_IFREG|0644, st_size=8, ...}, 0) = 0
100   statx(AT_FDCWD, "b.o", AT_STATX_SYNC_AS_STAT, STATX_ALL, {stx_mask=STATX_ALL, ...}) = 0
100   access("c.o", R_OK) = 0"#,
        );
        assert_eq!(paths(set.inputs()), vec!["/w/a.o", "/w/b.o", "/w/c.o"]);
    }

    #[test]
    fn test_open_relative_to_directory_descriptor() {
        let set = parse(
            "/w",
            r#"100   openat(AT_FDCWD, "include", O_RDONLY|O_NONBLOCK|O_CLOEXEC|O_DIRECTORY) = 3</w/include>
100   openat(3</w/include>, "maxhash.h", O_RDONLY) = 4</w/include/maxhash.h>
100   newfstatat(4</w/include/maxhash.h>, "", {st_mode=S_IFREG|0644, st_size=120, ...}, AT_EMPTY_PATH) = 0
100   newfstatat(1<pipe:[81234]>, "", {st_mode=S_IFIFO|0600, st_size=0, ...}, AT_EMPTY_PATH) = 0
100   openat(3</w/include>, "../gen/slic.o", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 5</w/gen/slic.o>"#,
        );
        assert_eq!(paths(set.inputs()), vec!["/w/include", "/w/include/maxhash.h"]);
        assert_eq!(paths(set.outputs()), vec!["/w/gen/slic.o"]);
    }

    #[test]
    fn test_fchdir_moves_working_directory() {
        let set = parse(
            "/w",
            r#"100   openat(AT_FDCWD, "include", O_RDONLY|O_DIRECTORY) = 3</w/include>
100   fchdir(3</w/include>) = 0
100   openat(AT_FDCWD, "slic.h", O_RDONLY) = 4</w/include/slic.h>
100   clone(child_stack=NULL, flags=SIGCHLD) = 101
101   openat(AT_FDCWD, "maxhash.h", O_RDONLY) = 3</w/include/maxhash.h>"#,
        );
        assert_eq!(
            paths(set.inputs()),
            vec!["/w/include", "/w/include/maxhash.h", "/w/include/slic.h"]
        );
    }

    #[test]
    fn test_unnamed_descriptor_makes_trace_unrecordable() {
        let relative = parser(
            "/w",
            r#"100   openat(5, "entry", O_RDONLY) = 3
100   openat(5, "/abs/file", O_RDONLY) = 4"#,
        );
        let err = relative.finish().unwrap_err();
        assert!(matches!(err, MemoError::Trace(_)));
        assert!(err.to_string().contains("entry relative to descriptor 5"));

        let moved = parser("/w", "100   fchdir(3) = 0");
        assert!(matches!(moved.finish(), Err(MemoError::Trace(_))));
    }

    #[test]
    fn test_descriptor_path_is_decoded() {
        assert_eq!(descriptor_path("3</w/include>"), Some(PathBuf::from("/w/include")));
        assert_eq!(
            descriptor_path(r"7</w/odd\x3e\x20name>"),
            Some(PathBuf::from("/w/odd> name"))
        );
        assert_eq!(descriptor_path("1<pipe:[81234]>"), Some(PathBuf::from("pipe:[81234]")));
        assert_eq!(descriptor_path("AT_FDCWD"), None);
        assert_eq!(descriptor_path("3"), None);
    }

    #[test]
    fn test_escaped_path_is_decoded() {
        assert_eq!(
            unquote(r#""dir with \"quotes\"\\x\303\251.c""#),
            Some(PathBuf::from("dir with \"quotes\"\\xé.c"))
        );
        assert_eq!(unquote("AT_FDCWD"), None);
    }

    #[test]
    fn test_split_args_respects_nesting_and_strings() {
        assert_eq!(
            split_args(r#"AT_FDCWD, "a, b", {st_mode=S_IFREG, st_size=1}, 0"#),
            vec!["AT_FDCWD", "\"a, b\"", "{st_mode=S_IFREG, st_size=1}", "0"]
        );
        assert_eq!(
            split_args(r#"3</w/a, b>, "x.h", O_RDONLY"#),
            vec!["3</w/a, b>", "\"x.h\"", "O_RDONLY"]
        );
    }

    #[test]
    fn test_missing_tracer_is_unusable() {
        assert!(!is_usable(Path::new("/nonexistent/strace")));
        assert!(!supports_kill_on_exit(Path::new("/nonexistent/strace")));
    }

    #[test]
    fn test_tracer_arguments_name_descriptors() {
        let trace = NamedTempFile::new().unwrap();
        let session = StraceSession {
            strace: PathBuf::from("strace"),
            ignore: Vec::new(),
            kill_on_exit: true,
            command: ResolvedCommand {
                identity: crate::identity::CommandIdentity::new("cc", ["-c", "a.c"]),
                executable: PathBuf::from("/usr/bin/cc"),
                args: vec!["-c".into(), "a.c".into()],
                cwd: PathBuf::from("/w"),
                candidates: Vec::new(),
                previous_outputs: Vec::new(),
                env: BTreeMap::new(),
            },
            trace,
        };
        let args = session.tracer_args();
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert!(args.contains(&"-y"));
        assert!(args.contains(&"--kill-on-exit"));
        assert!(args.contains(&"trace=file,process,fchdir"));
        assert_eq!(&args[args.len() - 3..], ["/usr/bin/cc", "-c", "a.c"]);
    }
}
