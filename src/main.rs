//! Collar provisioning demo driver
//!
//! Drives the command protocol engine against an in-process simulated
//! collar peripheral, running the same session the companion app performs:
//! scan for nearby networks, read the stored configuration, store
//! credentials for the strongest network, read it back, and finish.
//!
//! Transport write failures can be injected to watch the engine's retry
//! policy in action.

use clap::Parser;
use collard::{
    AccessPoint, CollarError, CommandEngine, CommandKind, EngineDelegate, Request, Response,
    Result, Transport,
};
use log::info;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "collard")]
#[command(about = "Simulated collar Wi-Fi provisioning session")]
struct Args {
    /// Number of networks the simulated collar reports in a scan
    #[arg(long, default_value = "3")]
    networks: u32,

    /// Inject this many consecutive transport write failures
    #[arg(long, default_value = "0")]
    fail_writes: u32,

    /// Password stored on the collar during the edit step
    #[arg(long, default_value = "hunter2")]
    password: String,

    /// Maximum transport write length in bytes
    #[arg(long, default_value = "512")]
    max_write: usize,
}

/// In-process stand-in for a connected collar peripheral
///
/// Captures engine writes instead of radioing them; the main loop pumps the
/// captured writes back through the engine as completions and synthesizes
/// the peripheral's responses.
struct SimulatedCollar {
    outbox: Mutex<VecDeque<Vec<u8>>>,
    failures_left: Mutex<u32>,
    saved_network: Mutex<Option<AccessPoint>>,
    network_count: u32,
    max_write: usize,
}

impl SimulatedCollar {
    fn new(network_count: u32, failures: u32, max_write: usize) -> Self {
        Self {
            outbox: Mutex::new(VecDeque::new()),
            failures_left: Mutex::new(failures),
            saved_network: Mutex::new(None),
            network_count,
            max_write,
        }
    }

    fn take_write(&self) -> Option<Vec<u8>> {
        self.outbox.lock().unwrap().pop_front()
    }

    fn take_injected_failure(&self) -> bool {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }

    /// Synthesize the peripheral's reply to one delivered request
    fn respond(&self, raw: &[u8]) -> Vec<Vec<u8>> {
        let Ok(request) = Request::decode(raw) else {
            return Vec::new();
        };

        let mut replies = Vec::new();
        match request.kind {
            CommandKind::Scan => {
                for index in 0..self.network_count {
                    let mut response = Response::new(request.sequence, 0, CommandKind::Scan);
                    response.payload = Some(AccessPoint::new(
                        format!("collar-net-{index}"),
                        -40 - 7 * index as i64,
                        index,
                        self.network_count,
                        1 + (index * 5) % 13,
                    ));
                    replies.push(response);
                }
            }
            CommandKind::Edit => {
                *self.saved_network.lock().unwrap() = request.payload.clone();
                replies.push(Response::new(request.sequence, 0, CommandKind::Edit));
            }
            CommandKind::Read => {
                let saved = self.saved_network.lock().unwrap().clone();
                let mut response =
                    Response::new(request.sequence, saved.is_none() as i64, CommandKind::Read);
                response.payload = saved;
                replies.push(response);
            }
            CommandKind::Delete | CommandKind::DeleteAll => {
                *self.saved_network.lock().unwrap() = None;
                replies.push(Response::new(request.sequence, 0, request.kind));
            }
            kind => {
                replies.push(Response::new(request.sequence, 0, kind));
            }
        }

        replies
            .into_iter()
            .filter_map(|response| response.encode().ok())
            .collect()
    }
}

impl Transport for SimulatedCollar {
    fn write(&self, payload: &[u8]) -> Result<()> {
        self.outbox.lock().unwrap().push_back(payload.to_vec());
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.max_write
    }
}

/// Prints the session the way the companion app's message table shows it
#[derive(Default)]
struct SessionPrinter {
    scanned: Mutex<Vec<AccessPoint>>,
}

impl SessionPrinter {
    /// Strongest network seen in scan responses so far
    fn best_network(&self) -> Option<AccessPoint> {
        self.scanned
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|ap| ap.rcpi)
            .cloned()
    }
}

impl EngineDelegate for SessionPrinter {
    fn on_response(&self, response: Response) {
        match &response.payload {
            Some(ap) => println!(
                "<- {} result={} ssid={:?} rcpi={} channel={} ({}/{})",
                response.kind,
                response.result_code,
                ap.ssid,
                ap.rcpi,
                ap.channel,
                ap.index + 1,
                ap.count
            ),
            None => println!("<- {} result={}", response.kind, response.result_code),
        }

        if response.kind == CommandKind::Scan {
            if let Some(ap) = response.payload {
                self.scanned.lock().unwrap().push(ap);
            }
        }
    }

    fn on_request_failed(&self, request: Request) {
        println!(
            "!! {} request (seq {}) failed permanently",
            request.kind, request.sequence
        );
    }

    fn on_message_too_large(&self, request: Request) {
        println!(
            "!! {} request (seq {}) is larger than the transport allows",
            request.kind, request.sequence
        );
    }

    fn on_disconnected(&self) {
        println!("!! collar disconnected");
    }
}

/// Deliver captured writes back to the engine until the queue drains
fn pump(engine: &CommandEngine, collar: &SimulatedCollar) {
    while let Some(raw) = collar.take_write() {
        if collar.take_injected_failure() {
            engine.on_write_completed(Err(CollarError::WriteFailed(
                "simulated radio glitch".to_string(),
            )));
            continue;
        }

        engine.on_write_completed(Ok(()));
        for payload in collar.respond(&raw) {
            engine.on_inbound_payload(&payload);
        }
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let collar = Arc::new(SimulatedCollar::new(
        args.networks,
        args.fail_writes,
        args.max_write,
    ));
    let printer = Arc::new(SessionPrinter::default());
    let engine = CommandEngine::new(collar.clone(), printer.clone());

    info!("Starting provisioning session against simulated collar");

    engine.submit(CommandKind::Scan, None);
    engine.submit(CommandKind::Read, None);
    pump(&engine, &collar);

    if let Some(best) = printer.best_network() {
        println!("-> storing credentials for {:?}", best.ssid);
        engine.submit_edit(&best, args.password.clone());
        engine.submit(CommandKind::Read, None);
        pump(&engine, &collar);
    }

    engine.submit(CommandKind::Finish, None);
    pump(&engine, &collar);

    if engine.pending_count() > 0 {
        println!(
            "session ended with {} request(s) stuck in the queue",
            engine.pending_count()
        );
    }
}
