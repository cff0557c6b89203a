use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, event::Source};
use slab::Slab;

/// Reserved token for the cross-thread waker; slab keys grow from zero and
/// never reach it.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// One fd's readiness, copied out of the mio event so owners can be driven
/// with the registry borrowed mutably.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// What one `poll_once` produced besides readiness.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopWake {
    /// The waker fired: a handoff or control message is queued.
    pub woken: bool,
    /// The periodic timer elapsed; value is the monotonically increasing
    /// tick counter.
    pub tick: Option<u64>,
}

/// Anything registrable: owners hand out the mio source living inside them.
pub trait HasSource {
    fn source(&mut self) -> &mut dyn Source;
}

/// Edge-triggered readiness multiplexer plus the fd→owner registry, one per
/// worker thread.
///
/// Owners are arbitrary `T` (the worker defines a tagged enum). A token is
/// the owner's dense registry slot; lookups are O(1) and a registered fd
/// always has a live owner — deregistering and removing happen together in
/// the owner's teardown path.
pub struct EventLoop<T> {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    owners: Slab<T>,
    tick_interval: Duration,
    last_tick: Instant,
    tick_count: u64,
}

impl<T> EventLoop<T> {
    pub fn new(tick_interval: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            owners: Slab::new(),
            tick_interval,
            last_tick: Instant::now(),
            tick_count: 0,
        })
    }

    /// Handle for other threads to interrupt a blocked poll.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Remove the fd from the poller. The owner slot stays until
    /// [`Self::remove`].
    pub fn deregister(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Release the owner slot, returning the owner so the caller can run its
    /// teardown (and drop the fd).
    pub fn remove(&mut self, token: Token) -> Option<T> {
        self.owners.try_remove(token.0)
    }

    #[inline]
    pub fn owner(&self, token: Token) -> Option<&T> {
        self.owners.get(token.0)
    }

    #[inline]
    pub fn owner_mut(&mut self, token: Token) -> Option<&mut T> {
        self.owners.get_mut(token.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &T)> {
        self.owners.iter().map(|(key, owner)| (Token(key), owner))
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.owners.iter().map(|(key, _)| Token(key)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    #[inline]
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Block until readiness, a wake, or the next timer tick is due; then
    /// copy readiness out into `out`.
    pub fn poll_once(&mut self, out: &mut Vec<Readiness>) -> io::Result<LoopWake> {
        out.clear();

        let until_tick = self.tick_interval.saturating_sub(self.last_tick.elapsed());
        match self.poll.poll(&mut self.events, Some(until_tick)) {
            Ok(()) => {}
            // Signal delivery lands here; the tick check below still runs.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut wake = LoopWake::default();
        for event in &self.events {
            if event.token() == WAKER_TOKEN {
                wake.woken = true;
                continue;
            }
            out.push(Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                error: event.is_error(),
            });
        }

        if self.last_tick.elapsed() >= self.tick_interval {
            self.last_tick = Instant::now();
            self.tick_count += 1;
            wake.tick = Some(self.tick_count);
        }
        Ok(wake)
    }
}

impl<T: HasSource> EventLoop<T> {
    /// Move `owner` into a registry slot and register its fd.
    ///
    /// On registration failure the owner is dropped, closing its fd.
    pub fn register(&mut self, owner: T, interest: Interest) -> io::Result<Token> {
        let entry = self.owners.vacant_entry();
        let token = Token(entry.key());
        let slot = entry.insert(owner);
        match self.poll.registry().register(slot.source(), token, interest) {
            Ok(()) => Ok(token),
            Err(e) => {
                self.owners.remove(token.0);
                Err(e)
            }
        }
    }

    /// Change the interest set for a registered owner's fd. Unknown tokens
    /// are a no-op (the owner raced a close in the same batch).
    pub fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let Some(owner) = self.owners.get_mut(token.0) else {
            return Ok(());
        };
        self.poll.registry().reregister(owner.source(), token, interest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_fires_and_counts_up() {
        let mut el: EventLoop<u8> = EventLoop::new(Duration::from_millis(10)).unwrap();
        let mut out = Vec::new();

        let mut ticks = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(200);
        while ticks.len() < 3 && Instant::now() < deadline {
            if let Some(t) = el.poll_once(&mut out).unwrap().tick {
                ticks.push(t);
            }
        }
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[test]
    fn waker_interrupts_poll() {
        let mut el: EventLoop<u8> = EventLoop::new(Duration::from_secs(60)).unwrap();
        let waker = el.waker();
        let handle = std::thread::spawn(move || waker.wake().unwrap());

        let mut out = Vec::new();
        let start = Instant::now();
        let wake = el.poll_once(&mut out).unwrap();
        handle.join().unwrap();

        assert!(wake.woken);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(out.is_empty());
    }

    struct ListenerOwner(mio::net::TcpListener);

    impl HasSource for ListenerOwner {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.0
        }
    }

    #[test]
    fn registry_slots_recycle() {
        let mut el: EventLoop<ListenerOwner> = EventLoop::new(Duration::from_secs(1)).unwrap();
        let listener =
            ListenerOwner(mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap());

        let token = el.register(listener, Interest::READABLE).unwrap();
        assert!(el.owner(token).is_some());
        assert_eq!(el.len(), 1);

        let mut listener = el.remove(token).unwrap();
        el.deregister(listener.source()).unwrap();
        assert!(el.is_empty());
        assert!(el.owner(token).is_none());
    }
}
