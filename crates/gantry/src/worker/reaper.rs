//! Heartbeat reaper: timer-driven scan for connections that missed their
//! keepalive window.

use std::time::{Duration, Instant};

use gantry_net::event_loop::EventLoop;
use mio::Token;

use crate::worker::Owner;

/// How many ticks apart two examinations of the same fd are. Each tick only
/// looks at the slice of fds whose token matches the tick modulo the stride,
/// smoothing the scan across the interval.
pub(crate) fn stride_ticks(stride: Duration, tick_interval: Duration) -> u64 {
    let ticks = stride.as_millis() / tick_interval.as_millis().max(1);
    (ticks as u64).max(1)
}

#[inline]
pub(crate) fn due_this_tick(token: Token, tick: u64, stride: u64) -> bool {
    token.0 as u64 % stride == tick % stride
}

/// Collect the connections in this tick's slice whose listener has a
/// heartbeat TTL and whose idle time exceeds it.
pub(crate) fn scan(el: &EventLoop<Owner>, tick: u64, stride: u64, now: Instant) -> Vec<Token> {
    el.iter()
        .filter(|(token, _)| due_this_tick(*token, tick, stride))
        .filter_map(|(token, owner)| match owner {
            Owner::Conn(conn) if conn.idle_expired(now) => Some(token),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_at_least_one_tick() {
        assert_eq!(stride_ticks(Duration::from_secs(60), Duration::from_secs(1)), 60);
        assert_eq!(stride_ticks(Duration::from_secs(1), Duration::from_secs(1)), 1);
        assert_eq!(stride_ticks(Duration::ZERO, Duration::from_secs(1)), 1);
    }

    #[test]
    fn each_slot_is_visited_once_per_stride() {
        let stride = 60;
        for token in [0usize, 7, 59, 60, 61] {
            let due: Vec<u64> =
                (0..stride * 2).filter(|t| due_this_tick(Token(token), *t, stride)).collect();
            assert_eq!(due.len(), 2, "token {token} visited twice over two strides");
            assert_eq!(due[1] - due[0], stride);
        }
    }
}
