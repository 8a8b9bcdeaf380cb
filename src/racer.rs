//! Races connection attempts to several addresses ("happy eyeballs").
//!
//! Attempts are started one at a time, `stagger` apart. The first socket to
//! connect wins, and every other attempt still in flight is dropped, which
//! closes whatever it had opened.

use crate::deadline::{self, DeadlineScheduler};
use crate::destination::{Family, ResolvedAddress};
#[cfg(feature = "probes")]
use crate::probes;
use crate::transport::{SharedSocketFactory, Transport};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// Default delay between starting two attempts.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(250);

/// Why a single attempt failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("Connecting to {address} failed")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {address} timed out")]
    TimedOut { address: SocketAddr },
}

impl AttemptError {
    pub fn address(&self) -> SocketAddr {
        match self {
            AttemptError::Connect { address, .. } | AttemptError::TimedOut { address } => *address,
        }
    }

    #[cfg(feature = "probes")]
    const fn as_str(&self) -> &'static str {
        match self {
            AttemptError::Connect { .. } => "Connect",
            AttemptError::TimedOut { .. } => "TimedOut",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("No addresses to connect to")]
    NoAddresses,

    #[error("All {attempts} connection attempts failed")]
    AllAttemptsFailed {
        attempts: usize,
        #[source]
        last: AttemptError,
    },
}

/// Reorders `addresses` so that families alternate.
///
/// The family of the first address leads with `first_family_count`
/// addresses, after which families take turns one address at a time.
/// A count of zero keeps the original order.
pub fn interleave(addresses: Vec<ResolvedAddress>, first_family_count: usize) -> Vec<ResolvedAddress> {
    if first_family_count == 0 {
        return addresses;
    }

    // Families in order of first appearance.
    let mut by_family: Vec<(Family, VecDeque<ResolvedAddress>)> = Vec::new();
    for address in addresses {
        let family = address.family();
        match by_family.iter_mut().find(|(f, _)| *f == family) {
            Some((_, list)) => list.push_back(address),
            None => by_family.push((family, VecDeque::from([address]))),
        }
    }

    let mut reordered = Vec::new();
    if let Some((_, first)) = by_family.first_mut() {
        let lead = first_family_count.saturating_sub(1).min(first.len());
        reordered.extend(first.drain(..lead));
    }
    while by_family.iter().any(|(_, list)| !list.is_empty()) {
        for (_, list) in by_family.iter_mut() {
            reordered.extend(list.pop_front());
        }
    }
    reordered
}

/// Connects to the first reachable address of a host.
#[derive(Clone, Debug)]
pub struct Racer {
    stagger: Option<Duration>,
    interleave: usize,
    scheduler: DeadlineScheduler,
}

impl Default for Racer {
    fn default() -> Self {
        Self::new(Some(DEFAULT_STAGGER), 1)
    }
}

impl Racer {
    /// - stagger: Delay between starting attempts. `None` runs attempts
    ///   strictly one after another.
    /// - interleave: See [interleave].
    pub fn new(stagger: Option<Duration>, interleave: usize) -> Self {
        Self {
            stagger,
            interleave,
            scheduler: DeadlineScheduler::default(),
        }
    }

    /// Schedules per-attempt deadlines with `scheduler`.
    pub fn with_scheduler(self, scheduler: DeadlineScheduler) -> Self {
        Self { scheduler, ..self }
    }

    /// Races `addresses`, returning the winning socket and its address.
    ///
    /// Each attempt is bounded by its own deadline of `attempt_timeout`; a
    /// timeout counts as a failure of that attempt.
    #[instrument(level = "debug", skip_all, name = "Racer::connect")]
    pub async fn connect<S: Transport>(
        &self,
        factory: &SharedSocketFactory<S>,
        addresses: Vec<ResolvedAddress>,
        attempt_timeout: Option<Duration>,
    ) -> Result<(S, ResolvedAddress), Error> {
        if addresses.is_empty() {
            return Err(Error::NoAddresses);
        }
        let mut pending: VecDeque<_> = interleave(addresses, self.interleave).into();

        let scheduler = &self.scheduler;
        let attempt = move |address: ResolvedAddress| async move {
            #[cfg(feature = "probes")]
            probes::race__attempt__start!(|| address.address.to_string());
            event!(Level::DEBUG, address = %address.address, "Starting attempt");
            let deadline = scheduler.schedule(attempt_timeout);
            let result = match deadline::within(deadline.as_ref(), factory.connect(&address)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    return (
                        address,
                        Err(AttemptError::TimedOut {
                            address: address.address,
                        }),
                    )
                }
            };
            let result = result.map_err(|source| AttemptError::Connect {
                address: address.address,
                source,
            });
            (address, result)
        };

        let mut in_flight = FuturesUnordered::new();
        let mut started = 0;
        let mut last_connect_error = None;
        let mut last_timeout = None;

        loop {
            if in_flight.is_empty() {
                let Some(address) = pending.pop_front() else {
                    break;
                };
                in_flight.push(attempt(address));
                started += 1;
            }

            let stagger = self.stagger.unwrap_or_default();
            let can_stagger = self.stagger.is_some() && !pending.is_empty();
            tokio::select! {
                Some((address, result)) = in_flight.next() => match result {
                    Ok(socket) => {
                        event!(Level::DEBUG, address = %address.address, started, "Attempt won");
                        #[cfg(feature = "probes")]
                        probes::race__done!(|| (address.address.to_string(), started as u64));
                        // Dropping the rest of "in_flight" cancels the losers.
                        return Ok((socket, address));
                    }
                    Err(err) => {
                        event!(Level::DEBUG, ?err, "Attempt failed");
                        #[cfg(feature = "probes")]
                        probes::race__attempt__failed!(|| (address.address.to_string(), err.as_str()));
                        match err {
                            AttemptError::TimedOut { .. } => last_timeout = Some(err),
                            AttemptError::Connect { .. } => last_connect_error = Some(err),
                        }
                        // A failure hands its turn to the next address.
                        if let Some(next) = pending.pop_front() {
                            in_flight.push(attempt(next));
                            started += 1;
                        }
                    }
                },
                _ = tokio::time::sleep(stagger), if can_stagger => {
                    if let Some(next) = pending.pop_front() {
                        in_flight.push(attempt(next));
                        started += 1;
                    }
                }
            }
        }

        // Connection errors say more about the host than timeouts do.
        let last = last_connect_error
            .or(last_timeout)
            .ok_or(Error::NoAddresses)?;
        Err(Error::AllAttemptsFailed {
            attempts: started,
            last,
        })
    }
}
