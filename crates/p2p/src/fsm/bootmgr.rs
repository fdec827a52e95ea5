//! Bootstrap manager.
//!
//! Walks the node into the mesh: authenticate to a seed, then to reported
//! addresses learned through gossip, retrying on a randomized back-off when
//! candidates run out, until the low connection watermark is reached.
//!
//! Candidates are drawn uniformly at random, an address is never attempted
//! twice within the same cascade, and addresses that are authenticated or
//! mid-handshake are skipped.
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::common::addr::OverlayAddr;
use crate::common::peer::AddressSource;
use crate::common::time::Clock;
use crate::net::{LocalDuration, LocalTime};

use super::output::{SetTimer, Wire};

/// Bounds of the back-off before a bootstrap step is retried.
pub const RETRY_DELAY_MIN: LocalDuration = LocalDuration::from_mins(1);
pub const RETRY_DELAY_MAX: LocalDuration = LocalDuration::from_mins(2);

/// Where a bootstrap attempt drew its candidate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A configured seed address.
    Seed,
    /// An address learned through gossip.
    Reported,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seed => write!(fmt, "seed"),
            Self::Reported => write!(fmt, "reported"),
        }
    }
}

/// An event originating in the bootstrap manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A bootstrap cascade began.
    Started {
        /// Number of configured seeds.
        seeds: usize,
    },
    /// A candidate is being attempted.
    Attempting {
        /// The candidate address.
        addr: OverlayAddr,
        /// Where it came from.
        origin: Origin,
    },
    /// Out of candidates for now; a retry is scheduled.
    RetryScheduled {
        /// How long until the retry.
        delay: LocalDuration,
    },
    /// The low connection watermark was reached.
    Completed {
        /// Authenticated peers at completion.
        peers: usize,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started { seeds } => write!(fmt, "bootstrapping from {} seed(s)", seeds),
            Event::Attempting { addr, origin } => {
                write!(fmt, "attempting {} peer {}", origin, addr)
            }
            Event::RetryScheduled { delay } => {
                write!(fmt, "out of bootstrap candidates, retrying in {}", delay)
            }
            Event::Completed { peers } => {
                write!(fmt, "bootstrap complete with {} peer(s)", peers)
            }
        }
    }
}

/// A bootstrap step to retry after the back-off.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Try reported addresses next.
    Reported {
        /// Whether the cascade arrived here from the seed phase.
        from_seeds: bool,
    },
    /// Try the remaining seeds next.
    Seeds,
}

/// Walks the bootstrap cascade.
#[derive(Debug)]
pub struct BootstrapManager<U, C> {
    /// Configured seed addresses.
    seeds: Vec<OverlayAddr>,
    /// Seeds not yet attempted in the current cascade.
    remaining: Vec<OverlayAddr>,
    /// Addresses attempted in the current cascade.
    attempted: HashSet<OverlayAddr>,
    /// Attempts in flight, by address.
    pending: HashMap<OverlayAddr, Origin>,
    /// Delayed retry, if any.
    retry: Option<(LocalTime, Step)>,
    /// Stop expanding at this many authenticated peers.
    target: usize,
    /// Back-off bounds.
    delay: (LocalDuration, LocalDuration),
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> BootstrapManager<U, C> {
    /// Create a new bootstrap manager.
    pub fn new(
        seeds: Vec<OverlayAddr>,
        target: usize,
        delay: (LocalDuration, LocalDuration),
        rng: fastrand::Rng,
        upstream: U,
        clock: C,
    ) -> Self {
        Self {
            seeds,
            remaining: Vec::new(),
            attempted: HashSet::new(),
            pending: HashMap::new(),
            retry: None,
            target,
            delay,
            upstream,
            rng,
            clock,
        }
    }

    /// Remove an address from the seed set. Used when this node is itself a
    /// seed, once its own address is known.
    pub fn remove_seed(&mut self, addr: &OverlayAddr) -> bool {
        let len = self.seeds.len();

        self.seeds.retain(|s| s != addr);
        self.remaining.retain(|s| s != addr);

        self.seeds.len() != len
    }

    /// Whether a retry is pending.
    pub fn retry_scheduled(&self) -> bool {
        self.retry.is_some()
    }

    /// Begin a cascade over a fresh snapshot of the seed set. Returns the
    /// first candidate to authenticate to, if any.
    pub fn start<A: AddressSource>(
        &mut self,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        self.remaining = self.seeds.clone();
        self.attempted.clear();
        self.upstream.event(Event::Started {
            seeds: self.seeds.len(),
        });

        if let Some(addr) = self.next_seed(exclude) {
            Some(addr)
        } else if !addrs.is_empty() {
            self.try_reported(true, exclude, addrs)
        } else {
            self.schedule(Step::Reported { from_seeds: true });
            None
        }
    }

    /// An attempt we initiated authenticated. Returns the next candidate, if
    /// the cascade continues.
    pub fn handshake_succeeded<A: AddressSource>(
        &mut self,
        addr: &OverlayAddr,
        auth_count: usize,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        let origin = self.pending.remove(addr)?;

        if auth_count >= self.target {
            self.upstream.event(Event::Completed { peers: auth_count });
        }
        match origin {
            Origin::Seed => {
                if auth_count < self.target {
                    self.try_reported(true, exclude, addrs)
                } else {
                    self.schedule(Step::Reported { from_seeds: true });
                    None
                }
            }
            Origin::Reported => {
                if auth_count < self.target {
                    self.try_reported(false, exclude, addrs)
                } else {
                    None
                }
            }
        }
    }

    /// An attempt we initiated failed. Returns the next candidate, if the
    /// cascade continues.
    pub fn handshake_failed<A: AddressSource>(
        &mut self,
        addr: &OverlayAddr,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        let origin = self.pending.remove(addr)?;

        debug!(target: "p2p", "{}: bootstrap attempt to {} peer failed", addr, origin);

        match origin {
            Origin::Seed => {
                if let Some(next) = self.next_seed(exclude) {
                    Some(next)
                } else if !addrs.is_empty() {
                    self.try_reported(true, exclude, addrs)
                } else {
                    self.schedule(Step::Reported { from_seeds: true });
                    None
                }
            }
            Origin::Reported => {
                if let Some(next) = self.next_reported(exclude, addrs) {
                    Some(next)
                } else {
                    self.schedule(Step::Seeds);
                    None
                }
            }
        }
    }

    /// Called when a tick is received. Fires the delayed retry once its
    /// back-off elapsed; a retry begins a fresh cascade leg.
    pub fn received_wake<A: AddressSource>(
        &mut self,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        let now = self.clock.local_time();

        match self.retry {
            Some((due, step)) if now >= due => {
                self.retry = None;
                self.attempted.clear();

                match step {
                    Step::Reported { from_seeds } => self.try_reported(from_seeds, exclude, addrs),
                    Step::Seeds => self.try_seeds(exclude),
                }
            }
            _ => None,
        }
    }

    /// Try a reported address; fall through to the seeds when there are none.
    fn try_reported<A: AddressSource>(
        &mut self,
        from_seeds: bool,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        if let Some(addr) = self.next_reported(exclude, addrs) {
            Some(addr)
        } else if from_seeds {
            self.schedule(Step::Seeds);
            None
        } else {
            self.try_seeds(exclude)
        }
    }

    /// Try a remaining seed; schedule a reported retry when there are none.
    fn try_seeds(&mut self, exclude: &HashSet<OverlayAddr>) -> Option<OverlayAddr> {
        if let Some(addr) = self.next_seed(exclude) {
            Some(addr)
        } else {
            self.schedule(Step::Reported { from_seeds: false });
            None
        }
    }

    /// Pick a uniformly random remaining seed, excluding busy and
    /// already-attempted addresses.
    fn next_seed(&mut self, exclude: &HashSet<OverlayAddr>) -> Option<OverlayAddr> {
        let candidates: Vec<usize> = self
            .remaining
            .iter()
            .enumerate()
            .filter(|(_, a)| !exclude.contains(a) && !self.attempted.contains(a))
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return None;
        }
        let ix = candidates[self.rng.usize(..candidates.len())];
        let addr = self.remaining.swap_remove(ix);

        self.attempted.insert(addr.clone());
        self.pending.insert(addr.clone(), Origin::Seed);
        self.upstream.event(Event::Attempting {
            addr: addr.clone(),
            origin: Origin::Seed,
        });

        Some(addr)
    }

    /// Pick a uniformly random reported address, excluding busy and
    /// already-attempted addresses.
    fn next_reported<A: AddressSource>(
        &mut self,
        exclude: &HashSet<OverlayAddr>,
        addrs: &mut A,
    ) -> Option<OverlayAddr> {
        let mut exclude = exclude.clone();
        exclude.extend(self.attempted.iter().cloned());

        let addr = addrs.sample(&exclude)?;

        self.attempted.insert(addr.clone());
        self.pending.insert(addr.clone(), Origin::Reported);
        self.upstream.event(Event::Attempting {
            addr: addr.clone(),
            origin: Origin::Reported,
        });

        Some(addr)
    }

    /// Schedule a delayed retry of the given step.
    fn schedule(&mut self, step: Step) {
        let delay = super::random_delay(&mut self.rng, self.delay);

        self.retry = Some((self.clock.local_time() + delay, step));
        self.upstream.event(Event::RetryScheduled { delay });
        self.upstream.set_timer(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::peer::Source;
    use crate::common::time::{AdjustableClock, RefClock};
    use crate::fsm::output::{Io, Outbox};

    fn addr(host: &str) -> OverlayAddr {
        OverlayAddr::new(host, 9999)
    }

    /// Address source stub over a plain list.
    struct Addrs(Vec<OverlayAddr>, fastrand::Rng);

    impl Addrs {
        fn empty() -> Self {
            Self(Vec::new(), fastrand::Rng::with_seed(1))
        }
    }

    impl AddressSource for Addrs {
        fn sample(&mut self, exclude: &HashSet<OverlayAddr>) -> Option<OverlayAddr> {
            let candidates: Vec<&OverlayAddr> =
                self.0.iter().filter(|a| !exclude.contains(a)).collect();

            if candidates.is_empty() {
                return None;
            }
            Some(candidates[self.1.usize(..candidates.len())].clone())
        }

        fn record_local_address(&mut self, _addr: OverlayAddr) {}

        fn insert(&mut self, addrs: impl IntoIterator<Item = OverlayAddr>, _source: Source) {
            self.0.extend(addrs);
        }

        fn is_empty(&self) -> bool {
            self.0.is_empty()
        }
    }

    fn manager(
        seeds: Vec<OverlayAddr>,
    ) -> (
        BootstrapManager<Outbox, RefClock<LocalTime>>,
        Outbox,
        RefClock<LocalTime>,
    ) {
        let outbox = Outbox::new();
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = BootstrapManager::new(
            seeds,
            8,
            (RETRY_DELAY_MIN, RETRY_DELAY_MAX),
            fastrand::Rng::with_seed(5),
            outbox.clone(),
            clock.clone(),
        );

        (mgr, outbox, clock)
    }

    fn retry_delay(outputs: &[Io]) -> Option<LocalDuration> {
        outputs.iter().find_map(|io| match io {
            Io::SetTimer(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn test_seed_success_then_backoff() {
        let seeds = vec![addr("a.onion"), addr("b.onion"), addr("c.onion")];
        let (mut mgr, mut outbox, _) = manager(seeds.clone());
        let mut addrs = Addrs::empty();

        let first = mgr.start(&HashSet::new(), &mut addrs).expect("a seed is picked");
        assert!(seeds.contains(&first));

        // The seed authenticates; one peer is below the watermark, but with
        // no reported addresses the cascade backs off.
        let exclude: HashSet<OverlayAddr> = [first.clone()].into_iter().collect();
        let next = mgr.handshake_succeeded(&first, 1, &exclude, &mut addrs);

        assert_eq!(next, None);
        assert!(mgr.retry_scheduled());

        let outputs: Vec<Io> = outbox.collect();
        let delay = retry_delay(&outputs).expect("a retry timer is set");
        assert!(delay >= LocalDuration::from_mins(1) && delay <= LocalDuration::from_mins(2));
    }

    #[test]
    fn test_seed_fallback_on_failure() {
        let seeds = vec![addr("a.onion"), addr("b.onion")];
        let (mut mgr, _outbox, _) = manager(seeds.clone());
        let mut addrs = Addrs::empty();

        let first = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        let second = mgr
            .handshake_failed(&first, &HashSet::new(), &mut addrs)
            .expect("the other seed is attempted");

        assert_ne!(first, second);
        assert!(seeds.contains(&second));

        // The second seed authenticates; no candidates remain, a retry is
        // scheduled.
        let exclude: HashSet<OverlayAddr> = [second.clone()].into_iter().collect();
        let next = mgr.handshake_succeeded(&second, 1, &exclude, &mut addrs);

        assert_eq!(next, None);
        assert!(mgr.retry_scheduled());
    }

    #[test]
    fn test_all_seeds_fail_then_reported() {
        let seeds = vec![addr("a.onion"), addr("b.onion")];
        let (mut mgr, _outbox, _) = manager(seeds);
        let mut addrs = Addrs::empty();
        addrs.insert(vec![addr("gossip.onion")], Source::Peer);

        let first = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        let second = mgr.handshake_failed(&first, &HashSet::new(), &mut addrs).unwrap();

        // Both seeds down; the cascade falls through to reported addresses.
        let third = mgr
            .handshake_failed(&second, &HashSet::new(), &mut addrs)
            .expect("a reported address is attempted");
        assert_eq!(third, addr("gossip.onion"));
    }

    #[test]
    fn test_reported_success_repeats_until_watermark() {
        let (mut mgr, _outbox, _) = manager(vec![addr("seed.onion")]);
        let mut addrs = Addrs::empty();
        addrs.insert(vec![addr("r1.onion"), addr("r2.onion")], Source::Peer);

        let seed = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        let mut exclude: HashSet<OverlayAddr> = [seed.clone()].into_iter().collect();

        let r1 = mgr
            .handshake_succeeded(&seed, 1, &exclude, &mut addrs)
            .expect("a reported address follows the seed");
        exclude.insert(r1.clone());

        let r2 = mgr
            .handshake_succeeded(&r1, 2, &exclude, &mut addrs)
            .expect("the cascade keeps going below the watermark");
        exclude.insert(r2.clone());
        assert_ne!(r1, r2);

        // At the watermark the cascade stops without scheduling a retry.
        assert_eq!(mgr.handshake_succeeded(&r2, 8, &exclude, &mut addrs), None);
        assert!(!mgr.retry_scheduled());
    }

    #[test]
    fn test_no_address_attempted_twice_in_a_cascade() {
        let (mut mgr, _outbox, _) = manager(vec![addr("only.onion")]);
        let mut addrs = Addrs::empty();

        let first = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        assert_eq!(first, addr("only.onion"));

        // The failed seed is not re-picked, even though nothing else exists.
        assert_eq!(mgr.handshake_failed(&first, &HashSet::new(), &mut addrs), None);
        assert!(mgr.retry_scheduled());
    }

    #[test]
    fn test_delayed_retry_fires_on_wake() {
        let (mut mgr, _outbox, mut clock) = manager(vec![addr("a.onion"), addr("b.onion")]);
        let mut addrs = Addrs::empty();

        let first = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        let exclude: HashSet<OverlayAddr> = [first.clone()].into_iter().collect();
        assert_eq!(mgr.handshake_succeeded(&first, 1, &exclude, &mut addrs), None);

        // Before the back-off: nothing.
        assert_eq!(mgr.received_wake(&exclude, &mut addrs), None);

        // After the back-off the remaining seed is attempted.
        clock.set(LocalTime::from_secs(100_000 + 121));
        let retried = mgr
            .received_wake(&exclude, &mut addrs)
            .expect("the retry fires");
        assert_ne!(retried, first);
    }

    #[test]
    fn test_remove_seed() {
        let (mut mgr, _outbox, _) = manager(vec![addr("self.onion"), addr("other.onion")]);
        let mut addrs = Addrs::empty();

        assert!(mgr.remove_seed(&addr("self.onion")));
        assert!(!mgr.remove_seed(&addr("self.onion")));

        let first = mgr.start(&HashSet::new(), &mut addrs).unwrap();
        assert_eq!(first, addr("other.onion"));
    }
}
