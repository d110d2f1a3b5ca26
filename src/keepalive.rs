//! Keepalive supervisor (component C5 of spec.md §4.5).

use crate::clock::Clock;
use crate::connection::ClientConnection;
use crate::ClientId;

const PING_PAYLOAD: &[u8] = b"ping";

/// What the caller should do for one client as a result of a tick.
pub enum KeepaliveAction {
    /// Send a Ping frame with this payload.
    Ping(Vec<u8>),
    /// The client has been idle for too long; disconnect it.
    Timeout,
}

/// Drives the periodic ping/timeout logic of spec.md §4.5. Owns only
/// `last_run_ms` and the configured interval; clients live in the caller's
/// registry and are passed in by mutable reference each tick.
pub struct KeepaliveSupervisor {
    interval_ms: u64,
    last_run_ms: u64,
}

impl KeepaliveSupervisor {
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self { interval_ms, last_run_ms: now_ms }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Run one tick (spec.md §4.5, steps 1-4). `clients` yields every client
    /// currently in the registry, connected or not; disconnected ones are
    /// skipped. Returns the action to take per connected client, in
    /// iteration order.
    pub fn tick<'a>(
        &mut self,
        clock: &dyn Clock,
        clients: impl Iterator<Item = (&'a ClientId, &'a mut ClientConnection)>,
    ) -> Vec<(ClientId, KeepaliveAction)> {
        let now = clock.monotonic_ms();
        let elapsed = now.saturating_sub(self.last_run_ms);
        let clock_jumped = elapsed > (self.interval_ms * 3) / 2;

        let mut actions = Vec::new();
        for (id, client) in clients {
            if !client.is_connected() {
                continue;
            }
            // Host sleep/wake recovery: treat every connected client as
            // freshly ponged so the grace window doesn't mass-timeout them.
            if clock_jumped {
                client.last_pong_recv = now;
            }
            if now.saturating_sub(client.last_pong_recv) < 2 * self.interval_ms {
                client.last_ping_sent = now;
                actions.push((id.clone(), KeepaliveAction::Ping(PING_PAYLOAD.to_vec())));
            } else {
                actions.push((id.clone(), KeepaliveAction::Timeout));
            }
        }

        self.last_run_ms = now;
        actions
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::clock::FakeClock;

    fn connected_client(id: &str, last_pong_recv: u64) -> (ClientId, ClientConnection) {
        let cid = ClientId::new_for_test(id);
        let mut conn = ClientConnection::new(cid.clone(), None, 0);
        // Drive through the handshake so `is_connected()` is true.
        conn.feed(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            0,
        );
        conn.last_pong_recv = last_pong_recv;
        (cid, conn)
    }

    #[test]
    fn pings_recently_active_client() {
        let clock = FakeClock::new();
        clock.set(30_000);
        let mut sup = KeepaliveSupervisor::new(30_000, 0);
        let mut clients = HashMap::new();
        let (id, conn) = connected_client("c1", 29_000);
        clients.insert(id.clone(), conn);

        let actions = sup.tick(&clock, clients.iter_mut());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].1, KeepaliveAction::Ping(_)));
        assert_eq!(clients[&id].last_ping_sent, 30_000);
    }

    #[test]
    fn times_out_client_idle_past_two_intervals() {
        let clock = FakeClock::new();
        clock.set(61_000);
        let mut sup = KeepaliveSupervisor::new(30_000, 0);
        let mut clients = HashMap::new();
        let (id, _conn) = connected_client("c1", 0);
        clients.insert(id, connected_client("c1", 0).1);

        let actions = sup.tick(&clock, clients.iter_mut());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].1, KeepaliveAction::Timeout));
    }

    #[test]
    fn clock_jump_grants_grace_window_instead_of_mass_timeout() {
        let clock = FakeClock::new();
        let mut sup = KeepaliveSupervisor::new(30_000, 0);
        let mut clients = HashMap::new();
        let (id, conn) = connected_client("c1", 0);
        clients.insert(id.clone(), conn);

        // Simulate a host sleep: wall clock jumps by more than 1.5x interval
        // with no ticks in between.
        clock.set(200_000);
        let actions = sup.tick(&clock, clients.iter_mut());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].1, KeepaliveAction::Ping(_)));
        assert_eq!(clients[&id].last_pong_recv, 200_000);
    }

    #[test]
    fn disconnected_clients_are_skipped() {
        let clock = FakeClock::new();
        clock.set(100_000);
        let mut sup = KeepaliveSupervisor::new(30_000, 0);
        let mut clients = HashMap::new();
        let id = ClientId::new_for_test("c1");
        clients.insert(id, ClientConnection::new(ClientId::new_for_test("c1"), None, 0));

        let actions = sup.tick(&clock, clients.iter_mut());
        assert!(actions.is_empty());
    }
}
