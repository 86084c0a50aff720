//! Network link supervision
//!
//! A [`Supervisor`] task owns the [`Link`], retries failed joins a bounded
//! number of times and publishes every transition on a `watch` channel.
//! Anything that needs the network awaits [`Connectivity::wait_ready`].

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("link failed after {0} attempts")]
    Failed(u32),

    #[error("link supervisor stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Retrying { attempt: u32 },
    Failed { attempts: u32 },
}

/// A network interface that can be joined
pub trait Link: Send + 'static {
    /// One join attempt
    fn join(&mut self) -> impl Future<Output = Result<(), String>> + Send;

    /// Resolves when an established link drops
    fn disconnected(&mut self) -> impl Future<Output = ()> + Send;

    fn name(&self) -> &str;
}

/// Host link: the operating system already manages the network
pub struct AlwaysUp;

impl Link for AlwaysUp {
    async fn join(&mut self) -> Result<(), String> {
        Ok(())
    }

    async fn disconnected(&mut self) {
        std::future::pending::<()>().await
    }

    fn name(&self) -> &str {
        "host"
    }
}

/// Read side of the link state
#[derive(Clone)]
pub struct Connectivity {
    rx: watch::Receiver<LinkState>,
}

impl Connectivity {
    pub fn state(&self) -> LinkState {
        *self.rx.borrow()
    }

    /// Waits until the link is up
    ///
    /// Fails once the supervisor has given up or stopped.
    pub async fn wait_ready(&mut self) -> Result<(), ConnectivityError> {
        let state = *self
            .rx
            .wait_for(|s| matches!(s, LinkState::Connected | LinkState::Failed { .. }))
            .await
            .map_err(|_| ConnectivityError::Closed)?;

        match state {
            LinkState::Failed { attempts } => Err(ConnectivityError::Failed(attempts)),
            _ => Ok(()),
        }
    }

    /// Waits for the next transition
    pub async fn changed(&mut self) -> Result<LinkState, ConnectivityError> {
        self.rx
            .changed()
            .await
            .map_err(|_| ConnectivityError::Closed)?;
        Ok(*self.rx.borrow_and_update())
    }
}

/// Drives a [`Link`] through its join/retry cycle
pub struct Supervisor<L> {
    link: L,
    max_retries: u32,
    retry_delay: Duration,
    tx: watch::Sender<LinkState>,
}

impl<L: Link> Supervisor<L> {
    /// Starts supervising `link`
    ///
    /// A join is retried up to `max_retries` times after the first failure;
    /// the retry budget resets whenever the link comes up.
    pub fn spawn(
        link: L,
        max_retries: u32,
        retry_delay: Duration,
    ) -> (Connectivity, JoinHandle<()>) {
        let (tx, rx) = watch::channel(LinkState::Idle);
        let supervisor = Self {
            link,
            max_retries,
            retry_delay,
            tx,
        };

        (Connectivity { rx }, tokio::spawn(supervisor.run()))
    }

    async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            self.tx.send_replace(LinkState::Connecting);

            match self.link.join().await {
                Ok(()) => {
                    failures = 0;
                    self.tx.send_replace(LinkState::Connected);
                    info!(link = self.link.name(), "Link connected");

                    self.link.disconnected().await;
                    warn!(link = self.link.name(), "Link lost, reconnecting");
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.max_retries {
                        self.tx.send_replace(LinkState::Failed { attempts: failures });
                        warn!(
                            link = self.link.name(),
                            attempts = failures,
                            error = %e,
                            "Link failed"
                        );
                        return;
                    }

                    self.tx.send_replace(LinkState::Retrying { attempt: failures });
                    warn!(
                        link = self.link.name(),
                        attempt = failures,
                        max = self.max_retries,
                        error = %e,
                        "Join failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
