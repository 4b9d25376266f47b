//! # Radio Device Echo — Loopback Driver for Testing
//!
//! The simplest possible [`RadioDriver`]: every transmitted frame is looped
//! straight back into the device's own receive queue, as if a perfect
//! mirror were on the air. No hardware, no timing, no topology — useful for
//! exercising the engine's schedules, validation and recovery paths on a
//! single node.
//!
//! The device additionally counts initializations, recovery resets and
//! sleep requests so tests can observe the engine's side effects.

use log::{log, Level};

use crate::packet::PacketBuffer;
use crate::{DeviceOption, InterruptFlag, RadioDriver, RADIO_FRAME_SIZE};

/// How many looped-back frames the device can hold before dropping.
pub const ECHO_QUEUE_SIZE: usize = 8;

/// Loopback radio device. Construct with [`RadioDevice::new`] and hand it
/// to the engine.
pub struct RadioDevice {
    queue: [Option<PacketBuffer>; ECHO_QUEUE_SIZE],
    head: usize,
    count: usize,

    irq: Option<&'static InterruptFlag>,
    armed: bool,

    /// Full initializations performed (`init` with `reset_only == false`).
    pub init_count: u32,
    /// Recovery re-initializations (`init` with `reset_only == true`).
    pub reset_count: u32,
    /// CPU sleep requests.
    pub sleep_count: u32,
    /// Total frames handed to `send`.
    pub sent_frames: u32,
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            queue: [const { None }; ECHO_QUEUE_SIZE],
            head: 0,
            count: 0,
            irq: None,
            armed: false,
            init_count: 0,
            reset_count: 0,
            sleep_count: 0,
            sent_frames: 0,
        }
    }
}

impl Default for RadioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioDriver for RadioDevice {
    fn init(&mut self, reset_only: bool) -> u8 {
        if reset_only {
            self.reset_count += 1;
        } else {
            self.init_count += 1;
        }
        RADIO_FRAME_SIZE as u8
    }

    fn send(&mut self, frame: &[u8]) -> u8 {
        self.sent_frames += 1;
        if self.count == ECHO_QUEUE_SIZE {
            // the air accepted the frame, our mirror just lost it
            log!(Level::Warn, "echo queue full, dropping looped-back frame");
            return 0;
        }
        let mut pkt = PacketBuffer::new();
        pkt.data[..frame.len()].copy_from_slice(frame);
        pkt.length = frame.len();
        let tail = (self.head + self.count) % ECHO_QUEUE_SIZE;
        self.queue[tail] = Some(pkt);
        self.count += 1;
        if self.armed {
            if let Some(irq) = self.irq {
                irq.raise();
            }
        }
        0
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let Some(pkt) = self.queue[self.head].take() else {
            return 0;
        };
        self.head = (self.head + 1) % ECHO_QUEUE_SIZE;
        self.count -= 1;
        let nb_bytes = pkt.length.min(buf.len());
        buf[..nb_bytes].copy_from_slice(&pkt.data[..nb_bytes]);
        nb_bytes
    }

    fn set_option(&mut self, option: DeviceOption, value: u8) {
        log!(Level::Trace, "echo device option {:?} = {}", option, value);
    }

    fn set_interrupt(&mut self, flag: &'static InterruptFlag) {
        self.irq = Some(flag);
        self.armed = true;
        // frames that arrived while disarmed are still pending
        if self.count > 0 {
            flag.raise();
        }
    }

    fn reset_interrupt(&mut self) {
        self.armed = false;
    }

    fn sleep(&mut self) {
        self.sleep_count += 1;
    }
}
