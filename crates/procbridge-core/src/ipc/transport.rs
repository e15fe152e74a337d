//! Child process spawning for worker executables.
//!
//! A worker is addressed by a command line: either a `"`-quoted program path
//! or a bare program path ending at the first space, optionally followed by
//! arguments. The child runs in the program's directory, with all three
//! standard streams piped back to the parent and one extra environment
//! variable naming the shared memory segment.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use crate::error::{Error, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A worker command line split into program and argument text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: PathBuf,
    args: String,
}

impl CommandLine {
    /// Split a command line into its program path and remaining arguments.
    ///
    /// An unterminated quote takes the rest of the line as the program.
    pub fn parse(line: &str) -> Result<Self> {
        if line.contains('\0') {
            return Err(Error::PathConversion(format!(
                "command line contains a NUL byte: {:?}",
                line
            )));
        }

        let (program, rest) = match line.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match line.find(' ') {
                Some(end) => (&line[..end], &line[end..]),
                None => (line, ""),
            },
        };

        if program.is_empty() {
            return Err(Error::PathConversion(format!(
                "command line has no program: {:?}",
                line
            )));
        }

        Ok(Self {
            program: PathBuf::from(program),
            args: rest.trim().to_string(),
        })
    }

    /// The program path as written.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Raw argument text following the program.
    pub fn args(&self) -> &str {
        &self.args
    }

    /// Absolute directory containing the program.
    ///
    /// A bare program name resolves against the current directory.
    pub fn working_directory(&self) -> Result<PathBuf> {
        let absolute = std::path::absolute(&self.program).map_err(|e| {
            Error::PathConversion(format!(
                "cannot resolve '{}': {}",
                self.program.display(),
                e
            ))
        })?;
        absolute
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::PathConversion(format!(
                    "'{}' has no parent directory",
                    absolute.display()
                ))
            })
    }

    /// Program to hand to the OS.
    ///
    /// Paths with a directory component are made absolute so they do not
    /// depend on the child's working directory; bare names go through the
    /// normal executable search.
    fn resolved_program(&self) -> Result<PathBuf> {
        if self.program.components().count() > 1 {
            std::path::absolute(&self.program).map_err(|e| {
                Error::PathConversion(format!(
                    "cannot resolve '{}': {}",
                    self.program.display(),
                    e
                ))
            })
        } else {
            Ok(self.program.clone())
        }
    }

    fn build_command(&self) -> Result<Command> {
        let mut command = Command::new(self.resolved_program()?);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            if !self.args.is_empty() {
                command.raw_arg(&self.args);
            }
            command.creation_flags(CREATE_NO_WINDOW);
        }

        #[cfg(not(windows))]
        command.args(split_args(&self.args));

        Ok(command)
    }
}

/// Split argument text on whitespace, honoring double quotes.
#[cfg_attr(windows, allow(dead_code))]
fn split_args(text: &str) -> Vec<OsString> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    args.push(OsString::from(std::mem::take(&mut current)));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(OsString::from(current));
    }
    args
}

/// Kills and reaps a started child unless it is disarmed.
///
/// Holds the child between process creation and the point where its owner
/// has everything it needs, so a failure in between never leaks a process.
#[derive(Debug)]
pub struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Process id of the guarded child.
    pub fn id(&self) -> u32 {
        self.child.as_ref().map(Child::id).unwrap_or_default()
    }

    /// Release the child to its owner.
    pub fn disarm(mut self) -> Child {
        match self.child.take() {
            Some(child) => child,
            None => unreachable!("child guard disarmed twice"),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!("Reaping partially started worker {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A freshly started child and the parent ends of its pipes.
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: ChildGuard,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Start a worker for `command_line` with `env_name=env_value` added to the
/// inherited environment.
pub fn spawn(command_line: &str, env_name: &str, env_value: &str) -> Result<SpawnedChild> {
    let parsed = CommandLine::parse(command_line)?;
    let working_dir = parsed.working_directory()?;

    let mut command = parsed.build_command()?;
    command
        .current_dir(&working_dir)
        .env(env_name, env_value)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| Error::ProcessSpawn {
        command: command_line.to_string(),
        source,
    })?;

    // Take the pipes before arming the guard so all exits below release them.
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let guard = ChildGuard::new(child);

    let missing = |name: &str| Error::ProcessSpawn {
        command: command_line.to_string(),
        source: io::Error::other(format!("child {} was not captured", name)),
    };
    let stdin = stdin.ok_or_else(|| missing("stdin"))?;
    let stdout = stdout.ok_or_else(|| missing("stdout"))?;
    let stderr = stderr.ok_or_else(|| missing("stderr"))?;

    tracing::debug!(
        "Spawned worker {} for '{}' in {}",
        guard.id(),
        command_line,
        working_dir.display()
    );

    Ok(SpawnedChild {
        child: guard,
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_path() {
        let cmd = CommandLine::parse("tools/worker.exe --fast mode").unwrap();
        assert_eq!(cmd.program(), Path::new("tools/worker.exe"));
        assert_eq!(cmd.args(), "--fast mode");
    }

    #[test]
    fn test_parse_quoted_path() {
        let cmd = CommandLine::parse("\"C:/Program Files/w/worker.exe\" -x").unwrap();
        assert_eq!(cmd.program(), Path::new("C:/Program Files/w/worker.exe"));
        assert_eq!(cmd.args(), "-x");
    }

    #[test]
    fn test_parse_unterminated_quote() {
        let cmd = CommandLine::parse("\"dir with space/worker").unwrap();
        assert_eq!(cmd.program(), Path::new("dir with space/worker"));
        assert_eq!(cmd.args(), "");
    }

    #[test]
    fn test_parse_rejects_empty_program() {
        assert!(matches!(
            CommandLine::parse(""),
            Err(Error::PathConversion(_))
        ));
        assert!(matches!(
            CommandLine::parse("\"\" arg"),
            Err(Error::PathConversion(_))
        ));
        assert!(matches!(
            CommandLine::parse("worker\0.exe"),
            Err(Error::PathConversion(_))
        ));
    }

    #[test]
    fn test_working_directory_is_absolute_parent() {
        let temp = tempfile::TempDir::new().unwrap();
        let exe = temp.path().join("worker");
        let cmd = CommandLine::parse(&format!("\"{}\" a b", exe.display())).unwrap();
        assert_eq!(cmd.working_directory().unwrap(), temp.path());

        let relative = CommandLine::parse("bin/worker").unwrap();
        let dir = relative.working_directory().unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("bin"));
    }

    #[test]
    fn test_split_args() {
        assert_eq!(
            split_args(r#"--tag "a b" plain  "" end"#),
            vec![
                OsString::from("--tag"),
                OsString::from("a b"),
                OsString::from("plain"),
                OsString::from(""),
                OsString::from("end"),
            ]
        );
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn("/definitely/not/here/worker", "BRIDGE_FMO", "x").unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_passes_environment_and_directory() {
        use std::io::Read;

        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("print-env.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf '%s|%s' \"$BRIDGE_FMO\" \"$(pwd -P)\"\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let spawned = spawn(&format!("\"{}\"", script.display()), "BRIDGE_FMO", "segment-1").unwrap();
        let mut stdout = spawned.stdout;
        let mut output = String::new();
        stdout.read_to_string(&mut output).unwrap();
        let mut child = spawned.child.disarm();
        child.wait().unwrap();

        let expected_dir = temp.path().canonicalize().unwrap();
        assert_eq!(output, format!("segment-1|{}", expected_dir.display()));
    }
}
