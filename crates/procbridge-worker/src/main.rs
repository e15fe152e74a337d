//! Reference worker for the procbridge process bridge.
//!
//! Answers one framed request on stdin with one framed reply on stdout.
//! A request is `<command>` or `<command>:<argument>`:
//!
//! | command        | reply                                              |
//! |----------------|----------------------------------------------------|
//! | `echo:<bytes>` | the bytes                                          |
//! | `empty`        | zero-length frame                                  |
//! | `pid`          | process id                                         |
//! | `cwd`          | working directory                                  |
//! | `env`          | shared segment name from the environment           |
//! | `tag`          | value of `--tag`                                   |
//! | `invert`       | inverts the declared pixels, replies `WxH`         |
//! | `peek`         | the declared pixels                                |
//! | `fill:<byte>`  | fills the declared pixels, replies `ok`            |
//! | `stderr:<n>`   | writes `n` bytes to stderr, replies `ok`           |
//! | `sleep:<ms>`   | sleeps, replies `ok`                               |
//! | `exit`         | exits without replying                             |

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use procbridge_core::config::DEFAULT_ENV_VAR;
use procbridge_core::{FrameServer, SharedMemoryView};

#[derive(Parser)]
#[command(name = "procbridge-worker")]
#[command(about = "Reference worker answering bridge requests over stdin/stdout")]
#[command(version)]
struct Cli {
    /// Text replied by the `tag` command
    #[arg(long, default_value = "")]
    tag: String,

    /// Keep running after stdin closes
    #[arg(long)]
    linger: bool,
}

struct Worker {
    tag: String,
    view: Option<SharedMemoryView>,
}

impl Worker {
    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        let (command, arg) = match request.iter().position(|&b| b == b':') {
            Some(i) => (&request[..i], &request[i + 1..]),
            None => (request, &[][..]),
        };
        tracing::debug!(
            "Handling {} ({} argument bytes)",
            String::from_utf8_lossy(command),
            arg.len()
        );

        match command {
            b"echo" => arg.to_vec(),
            b"empty" => Vec::new(),
            b"pid" => std::process::id().to_string().into_bytes(),
            b"cwd" => match std::env::current_dir() {
                Ok(dir) => dir.to_string_lossy().into_owned().into_bytes(),
                Err(e) => format!("err:{}", e).into_bytes(),
            },
            b"env" => std::env::var(DEFAULT_ENV_VAR).unwrap_or_default().into_bytes(),
            b"tag" => self.tag.clone().into_bytes(),
            b"invert" => self.with_pixels(|view| {
                for byte in view.body_mut() {
                    *byte = !*byte;
                }
                let header = view.header();
                format!("{}x{}", header.width, header.height).into_bytes()
            }),
            b"peek" => self.with_pixels(|view| view.body().to_vec()),
            b"fill" => match parse_arg::<u8>(arg) {
                Some(value) => self.with_pixels(|view| {
                    view.body_mut().fill(value);
                    b"ok".to_vec()
                }),
                None => b"err:arg".to_vec(),
            },
            b"stderr" => match parse_arg::<usize>(arg) {
                Some(n) => {
                    // The host may have closed our stderr; the reply still goes out.
                    let _ = std::io::stderr().write_all(&vec![b'x'; n]);
                    b"ok".to_vec()
                }
                None => b"err:arg".to_vec(),
            },
            b"sleep" => match parse_arg::<u64>(arg) {
                Some(ms) => {
                    std::thread::sleep(Duration::from_millis(ms));
                    b"ok".to_vec()
                }
                None => b"err:arg".to_vec(),
            },
            b"exit" => std::process::exit(0),
            _ => b"err:unknown".to_vec(),
        }
    }

    /// Run `f` on the shared segment, mapping it on first use.
    fn with_pixels(&mut self, f: impl FnOnce(&mut SharedMemoryView) -> Vec<u8>) -> Vec<u8> {
        if self.view.is_none() {
            match SharedMemoryView::from_env(DEFAULT_ENV_VAR) {
                Ok(view) => self.view = Some(view),
                Err(e) => {
                    tracing::warn!("Cannot map shared segment: {}", e);
                    return b"err:shm".to_vec();
                }
            }
        }
        match self.view.as_mut() {
            Some(view) => f(view),
            None => b"err:shm".to_vec(),
        }
    }
}

fn parse_arg<T: std::str::FromStr>(arg: &[u8]) -> Option<T> {
    std::str::from_utf8(arg).ok()?.trim().parse().ok()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries frames; logs go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut worker = Worker {
        tag: cli.tag,
        view: None,
    };
    FrameServer::stdio().serve(|request| Some(worker.handle(request)))?;
    tracing::debug!("Host closed stdin");

    if cli.linger {
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
    Ok(())
}
