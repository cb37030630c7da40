//! Keep the power channel of one light up to date
use std::{fmt, sync::Arc, time::Duration};

use log::{debug, warn};

use crate::{
    config::HandlerConfig,
    datatypes::{parse_power, PowerReading},
    error::{Error, Result},
    protocol::{DefaultProtocol, Protocol},
    scheduler::{Cancellation, Scheduler, TaskHandle},
    uri::CoapUri,
    CHANNEL_POWER,
};

/// Receives channel updates on behalf of the host
pub trait StateListener: Send + Sync {
    fn state_updated(&self, channel: &str, reading: PowerReading);
}

impl<F> StateListener for F
where
    F: Fn(&str, PowerReading) + Send + Sync,
{
    fn state_updated(&self, channel: &str, reading: PowerReading) {
        self(channel, reading)
    }
}

/// Commands the host may send to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Refresh,
    OnOff(bool),
    Percent(f64),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Refresh => f.write_str("REFRESH"),
            Command::OnOff(true) => f.write_str("ON"),
            Command::OnOff(false) => f.write_str("OFF"),
            Command::Percent(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Uninitialized,
    Active,
    Disposed,
}

/// Reads the power of one target and reports it
struct Poller {
    target: CoapUri,
    timeout: Duration,
    protocol: Arc<dyn Protocol>,
    listener: Arc<dyn StateListener>,
}

impl Poller {
    fn read_power(&self) -> Result<f64> {
        let payload = self.protocol.get(&self.target, self.timeout)?;
        debug!("{} answered {}", self.target, String::from_utf8_lossy(&payload));
        parse_power(&payload)
    }

    fn poll(&self) -> PowerReading {
        let reading = match self.read_power() {
            Ok(power) => PowerReading::Decimal(power),
            Err(err) => {
                warn!("Could not read power of {}: {}", self.target, err);
                PowerReading::Undefined
            }
        };
        self.listener.state_updated(CHANNEL_POWER, reading);
        reading
    }
}

enum State {
    Uninitialized,
    Active {
        poller: Arc<Poller>,
        refresh_job: TaskHandle,
    },
    Disposed,
}

pub struct LightHandler {
    protocol: Arc<dyn Protocol>,
    listener: Arc<dyn StateListener>,
    scheduler: Arc<dyn Scheduler>,
    state: State,
}

impl LightHandler {
    pub fn new(listener: Arc<dyn StateListener>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_protocol(listener, scheduler, Arc::new(DefaultProtocol::new()))
    }

    pub fn with_protocol(
        listener: Arc<dyn StateListener>,
        scheduler: Arc<dyn Scheduler>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self {
            protocol,
            listener,
            scheduler,
            state: State::Uninitialized,
        }
    }

    pub fn status(&self) -> HandlerStatus {
        match self.state {
            State::Uninitialized => HandlerStatus::Uninitialized,
            State::Active { .. } => HandlerStatus::Active,
            State::Disposed => HandlerStatus::Disposed,
        }
    }

    /// The URI being polled, once initialised
    pub fn target(&self) -> Option<&CoapUri> {
        match &self.state {
            State::Active { poller, .. } => Some(&poller.target),
            _ => None,
        }
    }

    /// Start polling `config.uri` right away and then every refresh interval
    pub fn initialize(&mut self, config: &HandlerConfig) -> Result<()> {
        debug!("Initializing IoTivity handler for {}", config.uri);
        if let State::Active { .. } | State::Disposed = self.state {
            return Err(Error::Other(format!(
                "Handler cannot be initialized while {:?}",
                self.status()
            )));
        }

        let poller = Arc::new(Poller {
            target: config.target()?,
            timeout: config.timeout(),
            protocol: Arc::clone(&self.protocol),
            listener: Arc::clone(&self.listener),
        });

        let task_poller = Arc::clone(&poller);
        let refresh_job = self.scheduler.schedule_at_fixed_rate(
            Duration::from_secs(0),
            config.refresh_interval(),
            Box::new(move || {
                let _ = task_poller.poll();
            }),
        )?;

        self.state = State::Active {
            poller,
            refresh_job,
        };
        Ok(())
    }

    /// Read the power once and report it; `Undefined` unless active
    pub fn poll_once(&self) -> PowerReading {
        match &self.state {
            State::Active { poller, .. } => poller.poll(),
            _ => {
                debug!("Ignoring poll while {:?}", self.status());
                PowerReading::Undefined
            }
        }
    }

    pub fn handle_command(&self, channel: &str, command: &Command) {
        match command {
            Command::Refresh if channel == CHANNEL_POWER => {
                let _ = self.poll_once();
            }
            Command::Refresh => debug!("Refresh for unknown channel {}", channel),
            _ => debug!(
                "Command {} is not supported for channel: {}",
                command, channel
            ),
        }
    }

    /// Stop polling. `None` when nothing was scheduled.
    pub fn dispose(&mut self) -> Option<Cancellation> {
        match std::mem::replace(&mut self.state, State::Disposed) {
            State::Active { refresh_job, .. } => {
                let outcome = refresh_job.cancel();
                debug!("Disposed IoTivity handler: {:?}", outcome);
                Some(outcome)
            }
            State::Uninitialized | State::Disposed => None,
        }
    }
}

impl Drop for LightHandler {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}
