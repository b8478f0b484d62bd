//! Adaptive timing state for one TYPHOON session
//!
//! Tracks smoothed round-trip time and variance the RFC 6298 way, and
//! generates the jittered "next expected handshake" intervals the server
//! advertises. An RTT sample is taken whenever a client handshake answers a
//! pending server probe: the client deliberately delays its answer by the
//! advertised interval, so the sample is the observed elapsed time minus
//! that interval.

use crate::config::TyphoonConfig;
use rand::Rng;
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct ClockState {
    /// Smoothed RTT, milliseconds; zero until the first sample.
    srtt: u32,
    /// RTT mean deviation, milliseconds.
    rttvar: u32,
    /// Session-relative ms timestamp of the last probe, zero when no probe
    /// is outstanding.
    previous_sent_ts: u64,
    /// The interval advertised with that probe.
    previous_next_in: u32,
}

pub struct TyphoonClock {
    config: TyphoonConfig,
    epoch: Instant,
    state: Mutex<ClockState>,
}

impl TyphoonClock {
    pub fn new(config: TyphoonConfig) -> Self {
        Self { config, epoch: Instant::now(), state: Mutex::new(ClockState::default()) }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one RTT sample into the smoothed estimators.
    pub fn observe_rtt(&self, sample: u32) {
        let mut state = self.lock();
        if state.srtt == 0 || state.rttvar == 0 {
            state.srtt = sample;
            state.rttvar = sample / 2;
            return;
        }
        let (alpha, beta) = (self.config.alpha, self.config.beta);
        let deviation = state.srtt.abs_diff(sample) as f64;
        state.rttvar = ((1.0 - beta) * state.rttvar as f64 + beta * deviation) as u32;
        state.srtt = ((1.0 - alpha) * state.srtt as f64 + alpha * sample as f64) as u32;
    }

    /// Current RTT estimate, clamped; the configured default before any
    /// sample arrives.
    pub fn get_rtt(&self) -> u32 {
        let state = self.lock();
        let estimate = if state.srtt == 0 { self.config.default_rtt } else { state.srtt };
        estimate.clamp(self.config.min_rtt, self.config.max_rtt)
    }

    /// Retransmission timeout `srtt + mult * rttvar`, clamped; the default
    /// before any sample arrives.
    pub fn get_timeout(&self) -> u32 {
        let state = self.lock();
        let estimate = if state.srtt == 0 {
            self.config.default_timeout
        } else {
            (state.srtt as f64 + self.config.rtt_mult * state.rttvar as f64) as u32
        };
        estimate.clamp(self.config.min_timeout, self.config.max_timeout)
    }

    /// Pick the next advertised handshake interval: uniform over
    /// `[max(timeout, min_next_in), max_next_in]`, scaled by `multiplier`.
    /// With `remember_sent` the probe timestamp is stamped so the answering
    /// handshake yields an RTT sample.
    pub fn regenerate_next_in(&self, multiplier: f64, remember_sent: bool) -> u32 {
        let lower = self.get_timeout().max(self.config.min_next_in).min(self.config.max_next_in);
        let drawn = rand::thread_rng().gen_range(lower..=self.config.max_next_in);
        let next_in = (drawn as f64 * multiplier) as u32;

        // Zero means "no probe outstanding", so the stamp stays positive.
        let now = self.now_ms().max(1);
        let mut state = self.lock();
        state.previous_next_in = next_in;
        if remember_sent {
            state.previous_sent_ts = now;
        }
        next_in
    }

    pub fn previous_next_in(&self) -> u32 {
        self.lock().previous_next_in
    }

    /// Register an incoming handshake. If a probe is outstanding, derive the
    /// wraparound-safe RTT sample `(now - sent - next_in) mod 2^32` and feed
    /// it to the estimators; the probe is consumed either way.
    pub fn handshake_received(&self) {
        let now = self.now_ms();
        let sample = {
            let mut state = self.lock();
            if state.previous_sent_ts == 0 {
                return;
            }
            let elapsed = now.wrapping_sub(state.previous_sent_ts).wrapping_sub(state.previous_next_in as u64);
            state.previous_sent_ts = 0;
            elapsed as u32
        };
        self.observe_rtt(sample);
    }
}
