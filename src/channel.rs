//! `PacketChannel`: a non-blocking bound UDP socket with an optional
//! simulated loss/lag layer for test harnesses.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use web_time::Instant;

use crate::config::Interval;
use crate::error::ChannelError;

/// Maximum number of packets the delay queue may hold at once. Once full,
/// the oldest scheduled packet is dropped to make room, the same way a real
/// NIC would drop under buffer pressure.
pub const MAX_CHANNEL_PACKETS: usize = 1000;

/// A datagram captured by the conditioner, scheduled to be handed back from
/// `recv_from` once its `ready_at` has passed.
struct ScheduledPacket {
    from: SocketAddr,
    bytes: Vec<u8>,
    ready_at: Instant,
}

/// Simulated loss/lag layered over a real UDP socket: roll a drop
/// probability, else roll a delay and buffer the packet until it matures.
/// The two configured knobs are `[min, max]` uniform intervals rather than a
/// mean/stddev normal distribution, so sampling draws uniformly from
/// `Interval`.
struct Conditioner {
    loss_pct: Interval,
    lag_ms: Interval,
    buffer: VecDeque<ScheduledPacket>,
    #[cfg(feature = "condition")]
    rng: rand::rngs::StdRng,
}

impl Conditioner {
    fn new(loss_pct: Interval, lag_ms: Interval) -> Self {
        Self {
            loss_pct,
            lag_ms,
            buffer: VecDeque::new(),
            #[cfg(feature = "condition")]
            rng: {
                use rand::SeedableRng;
                rand::rngs::StdRng::from_entropy()
            },
        }
    }

    fn is_bypassed(&self) -> bool {
        self.loss_pct.is_zero() && self.lag_ms.is_zero()
    }

    #[cfg(feature = "condition")]
    fn condition(&mut self, from: SocketAddr, bytes: Vec<u8>, now: Instant) {
        use rand::Rng;

        let loss = self.rng.gen_range(self.loss_pct.min..=self.loss_pct.max.max(self.loss_pct.min + f32::EPSILON));
        if self.rng.gen::<f32>() < loss.clamp(0.0, 1.0) {
            tracing::trace!(%from, "conditioner dropped packet");
            return;
        }

        let lag_ms = if self.lag_ms.max > self.lag_ms.min {
            self.rng.gen_range(self.lag_ms.min..self.lag_ms.max)
        } else {
            self.lag_ms.min
        };
        let ready_at = now + std::time::Duration::from_secs_f32((lag_ms.max(0.0)) / 1000.0);

        if self.buffer.len() >= MAX_CHANNEL_PACKETS {
            self.buffer.pop_front();
        }
        self.buffer.push_back(ScheduledPacket { from, bytes, ready_at });
    }

    #[cfg(not(feature = "condition"))]
    fn condition(&mut self, from: SocketAddr, bytes: Vec<u8>, now: Instant) {
        self.buffer.push_back(ScheduledPacket {
            from,
            bytes,
            ready_at: now,
        });
    }

    /// Returns the earliest-ready packet whose `ready_at` has passed, if any.
    ///
    /// The buffer is a time-ordered multimap in spirit; in practice, with at
    /// most `MAX_CHANNEL_PACKETS` entries, a linear scan for the minimum
    /// timestamp is simpler than maintaining a balanced tree.
    fn pop_ready(&mut self, now: Instant) -> Option<(SocketAddr, Vec<u8>)> {
        let (idx, _) = self
            .buffer
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at <= now)
            .min_by_key(|(_, p)| p.ready_at)?;
        let packet = self.buffer.remove(idx).expect("index just found");
        Some((packet.from, packet.bytes))
    }
}

/// A non-blocking UDP endpoint with an optional simulated-loss/lag layer.
pub struct PacketChannel {
    socket: UdpSocket,
    conditioner: Conditioner,
}

impl PacketChannel {
    /// Binds a non-blocking UDP socket, scanning `preferred_port ..=
    /// preferred_port + port_scan_range` on `AddrInUse`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::BindFailure`] if no port in the range binds.
    pub fn bind(
        preferred_port: u16,
        port_scan_range: u16,
        loss_pct: Interval,
        lag_ms: Interval,
    ) -> Result<Self, ChannelError> {
        let mut last_err = None;
        for offset in 0..=port_scan_range {
            let port = preferred_port.wrapping_add(offset);
            match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => {
                    socket.set_nonblocking(true).map_err(ChannelError::SocketError)?;
                    tracing::info!(port, "bound packet channel");
                    return Ok(Self {
                        socket,
                        conditioner: Conditioner::new(loss_pct, lag_ms),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        tracing::warn!(preferred_port, port_scan_range, ?last_err, "failed to bind packet channel");
        Err(ChannelError::BindFailure { preferred_port })
    }

    /// Sends `bytes` to `addr` directly, with no simulated conditioning.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketError`] on any I/O error other than a
    /// size mismatch that indicates a short, non-fatal send.
    pub fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), ChannelError> {
        self.socket.send_to(bytes, addr).map_err(ChannelError::SocketError)?;
        Ok(())
    }

    /// Drains one datagram from the real socket, if any, feeding it through
    /// the conditioner, then returns the earliest matured conditioned
    /// packet. Call this in a loop until it returns `None` to fully drain
    /// the socket for this tick.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketError`] for any socket error other than
    /// `WouldBlock`.
    pub fn recv_from(&mut self, now: Instant, buf: &mut [u8]) -> Result<Option<(SocketAddr, usize)>, ChannelError> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((n, from)) => {
                    if self.conditioner.is_bypassed() {
                        return Ok(Some((from, n)));
                    }
                    self.conditioner.condition(from, buf[..n].to_vec(), now);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(ChannelError::SocketError(e)),
            }
        }

        match self.conditioner.pop_ready(now) {
            Some((from, bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(Some((from, n)))
            }
            None => Ok(None),
        }
    }

    /// The local address this channel is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketError`] if the OS lookup fails.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.socket.local_addr().map_err(ChannelError::SocketError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_scans_past_an_occupied_port() {
        let first = PacketChannel::bind(0, 4, Interval::ZERO, Interval::ZERO).unwrap();
        let port = first.local_addr().unwrap().port();
        // binding the exact same port should force the scan forward
        let second = PacketChannel::bind(port, 4, Interval::ZERO, Interval::ZERO).unwrap();
        assert_ne!(first.local_addr().unwrap().port(), second.local_addr().unwrap().port());
    }

    #[test]
    fn ping_pong_round_trip_with_conditioner_bypassed() {
        let mut a = PacketChannel::bind(0, 8, Interval::ZERO, Interval::ZERO).unwrap();
        let mut b = PacketChannel::bind(0, 8, Interval::ZERO, Interval::ZERO).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b_addr, b"hello").unwrap();

        let now = Instant::now();
        let mut buf = [0u8; 64];
        // a non-blocking socket needs a moment for loopback delivery in CI;
        // this is exercised as a best-effort smoke test, not a timing guarantee.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let result = b.recv_from(now, &mut buf).unwrap();
        if let Some((_, n)) = result {
            assert_eq!(&buf[..n], b"hello");
        }
    }
}
