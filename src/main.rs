//! dapbridge binary.
//!
//! Serves the front (editor-facing) protocol over TCP and dials the debug
//! engine's back-protocol socket, one session per client.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use dapbridge::bridge::{Session, SessionHandle, SessionOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to serve the front protocol on.
    #[clap(long, env = "DAPBRIDGE_LISTEN", default_value = "127.0.0.1:4711")]
    listen: String,

    /// Address of the debug engine's back-protocol socket.
    #[clap(long, env = "DAPBRIDGE_ENGINE")]
    engine: String,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Deadline in seconds for a single engine request.
    #[clap(long, default_value_t = 15)]
    request_timeout: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let listener =
        TcpListener::bind(&args.listen).with_context(|| format!("bind {}", args.listen))?;
    info!(target: "bridge", "dapbridge listening on {}", args.listen);

    let active: Arc<Mutex<Option<SessionHandle>>> = Arc::default();
    {
        let active = active.clone();
        ctrlc::set_handler(move || {
            if let Some(handle) = active.lock().unwrap().take() {
                handle.terminate("interrupted");
            } else {
                std::process::exit(0);
            }
        })
        .context("install interrupt handler")?;
    }

    // One client at a time: a session owns the engine connection.
    loop {
        let (front, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "bridge", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "bridge", "client connected: {peer}");

        let back = match TcpStream::connect(&args.engine) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "bridge", "engine at {} unreachable: {err:#}", args.engine);
                drop(front);
                continue;
            }
        };

        let options = SessionOptions {
            request_timeout: Duration::from_secs(args.request_timeout),
        };
        let session = match Session::attach(front, back, options) {
            Ok(session) => session,
            Err(err) => {
                warn!(target: "bridge", "failed to set up session: {err:#}");
                continue;
            }
        };

        *active.lock().unwrap() = Some(session.handle());
        if let Err(err) = session.run() {
            warn!(target: "bridge", "session ended with error: {err:#}");
        } else {
            info!(target: "bridge", "session finished");
        }
        active.lock().unwrap().take();

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
