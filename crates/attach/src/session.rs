//! One attachment handshake: listener, timeouts and the FSM owner loop

use std::io::Write as _;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use wgmesh_common::settings::AttachConfig;
use wgmesh_common::{Error, Result};

use crate::fsm::{AttachFsm, AttachState, DeviceReport, DiscoveryReply, Target};
use crate::server::{self, Event};

/// Bounded waits of the handshake phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub gathering: Duration,
    pub offering: Duration,
    pub observing: Duration,
    /// Progress display interval while gathering
    pub tick: Duration,
}

impl From<&AttachConfig> for Timeouts {
    fn from(config: &AttachConfig) -> Self {
        Self {
            gathering: config.gathering(),
            offering: config.offering(),
            observing: config.observing(),
            tick: config.tick(),
        }
    }
}

/// Picks one of the gathered devices; runs on a blocking thread
pub type Chooser = Box<dyn FnOnce(&[DeviceReport]) -> Result<usize> + Send + 'static>;

pub enum Mode {
    /// Gather devices, then let the chooser pick one
    Interactive(Chooser),
    /// Offer directly to a known device
    Preselected(Target),
}

/// Operator prompt on stdin; anything but a listed number cancels
pub fn stdin_chooser() -> Chooser {
    Box::new(|devices: &[DeviceReport]| {
        println!("Which node do you want to attach?");
        println!("Enter number or any other key to cancel. Check IP address for security purposes first!");
        print!("Enter number: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=devices.len()).contains(&n) => Ok(n - 1),
            _ => Err(Error::Cancelled(
                "No valid node number. Node attach canceled by user".to_string(),
            )),
        }
    })
}

/// Stops the listener when the session ends, however it ends
struct ShutdownGuard(watch::Sender<bool>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

pub struct Handshake {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    timeouts: Timeouts,
}

impl Handshake {
    pub fn new(listener: TcpListener, tls: Option<TlsAcceptor>, timeouts: Timeouts) -> Self {
        Self {
            listener,
            tls,
            timeouts,
        }
    }

    /// Serve `script` to the selected device and wait for its completion report.
    /// Returns the fields the device sent when it fetched the script.
    pub async fn run(self, script: String, mode: Mode) -> Result<DeviceReport> {
        let (events_tx, mut events) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _guard = ShutdownGuard(shutdown_tx);
        tokio::spawn(server::serve(
            self.listener,
            self.tls,
            server::router(events_tx),
            shutdown_rx,
        ));

        let mut owner = Owner {
            fsm: AttachFsm::new(),
            events: &mut events,
            script: &script,
        };
        let result = owner.drive(mode, self.timeouts).await;
        owner.fsm.reset();
        result
    }
}

/// Sole holder of the FSM for the duration of a handshake
struct Owner<'a> {
    fsm: AttachFsm,
    events: &'a mut mpsc::Receiver<Event>,
    script: &'a str,
}

impl Owner<'_> {
    async fn drive(&mut self, mode: Mode, timeouts: Timeouts) -> Result<DeviceReport> {
        let target = match mode {
            Mode::Preselected(target) => target,
            Mode::Interactive(chooser) => self.select(chooser, timeouts).await?,
        };
        let mac = target.mac.clone().unwrap_or_else(|| "unknown".to_string());
        let address = target.address;
        self.fsm.offer(target)?;
        info!(
            "Attempting to attach node [{}] at [{}]. This takes up to {} seconds...",
            mac,
            address,
            timeouts.offering.as_secs()
        );

        if !self.wait_while(AttachState::Offering, timeouts.offering).await? {
            return Err(Error::ProtocolTimeout {
                phase: "waiting for the node to request its config".to_string(),
                seconds: timeouts.offering.as_secs(),
            });
        }
        debug!("Sending node config successful. Listening for node responses...");
        if !self.wait_while(AttachState::Observing, timeouts.observing).await? {
            return Err(Error::ProtocolTimeout {
                phase: "waiting for the node to announce a successful run of its config script"
                    .to_string(),
                seconds: timeouts.observing.as_secs(),
            });
        }

        if self.fsm.state() != AttachState::Attached {
            return Err(Error::ProtocolState {
                state: self.fsm.state().to_string(),
                detail: "handshake ended without attaching".to_string(),
            });
        }
        self.fsm.reported().cloned().ok_or_else(|| Error::ProtocolState {
            state: self.fsm.state().to_string(),
            detail: "no bootstrap request was recorded".to_string(),
        })
    }

    async fn select(&mut self, chooser: Chooser, timeouts: Timeouts) -> Result<Target> {
        self.fsm.start_gathering()?;
        println!(
            "Waiting for incoming requests from nodes. This takes {} seconds...",
            timeouts.gathering.as_secs()
        );

        let deadline = Instant::now() + timeouts.gathering;
        let mut ticker = tokio::time::interval_at(Instant::now() + timeouts.tick, timeouts.tick);
        let mut seen = 0;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    let count = self.fsm.gathered().len();
                    print!("{}", if count != seen { '+' } else { '.' });
                    let _ = std::io::stdout().flush();
                    seen = count;
                }
                event = self.events.recv() => self.dispatch(event)?,
            }
        }
        println!();

        let devices: Vec<DeviceReport> = self.fsm.gathered().into_iter().cloned().collect();
        if devices.is_empty() {
            return Err(Error::ProtocolTimeout {
                phase: "gathering; no nodes tried to get a config".to_string(),
                seconds: timeouts.gathering.as_secs(),
            });
        }
        for (i, device) in devices.iter().enumerate() {
            println!(
                "{}: Node at [{}] telling hostname [{}] and MAC [{}]",
                i + 1,
                device.address,
                device.hostname().unwrap_or(""),
                device.mac().unwrap_or("")
            );
        }

        // Requests keep arriving while the operator decides
        let choice = tokio::task::spawn_blocking(move || {
            chooser(&devices).and_then(|i| {
                devices
                    .get(i)
                    .cloned()
                    .ok_or_else(|| Error::Cancelled(format!("no node number {}", i + 1)))
            })
        });
        tokio::pin!(choice);
        let device = loop {
            tokio::select! {
                joined = &mut choice => {
                    break joined.map_err(|e| Error::Cancelled(e.to_string()))??;
                }
                event = self.events.recv() => self.dispatch(event)?,
            }
        };

        Ok(Target {
            address: device.address,
            mac: device.mac().map(str::to_string),
        })
    }

    /// Process events while the FSM stays in `state`; `false` on timeout
    async fn wait_while(&mut self, state: AttachState, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.fsm.state() == state {
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(false),
                event = self.events.recv() => self.dispatch(event)?,
            }
        }
        Ok(true)
    }

    fn dispatch(&mut self, event: Option<Event>) -> Result<()> {
        match event {
            Some(Event::Discovery { report, reply }) => {
                let answer = match self.fsm.on_discovery(report) {
                    DiscoveryReply::Bootstrap => Some(self.script.to_string()),
                    DiscoveryReply::Ignored => None,
                };
                let _ = reply.send(answer);
                Ok(())
            }
            Some(Event::Response { from, text, reply }) => {
                let _ = reply.send(self.fsm.on_response(from.ip(), &text));
                Ok(())
            }
            None => Err(Error::Cancelled("attachment listener stopped".to_string())),
        }
    }
}
