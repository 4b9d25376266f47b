#![cfg_attr(not(feature = "std"), no_std)]

//! # acklink
//!
//! A link layer for small half-duplex packet radios on resource-constrained
//! microcontrollers. It sits above a raw radio driver that exchanges
//! variable-length frames of a few tens of bytes and gives the application
//! reliable, addressed, duplicate-suppressed delivery:
//!
//! - payloads are framed with a destination-first header, a monotonic
//!   packet id and flag bits,
//! - transmissions are repeated on a fixed time grid until an
//!   acknowledgement arrives or the schedule runs out,
//! - received frames are deduplicated per source and acknowledged when the
//!   sender asked for it,
//! - several concurrent send/receive activities run as cooperatively
//!   scheduled tasks driven by a single periodic event pump,
//! - a transceiver that stops acknowledging is recovered by reinitializing
//!   it, and a device whose only work is passive listening can be put to
//!   sleep.
//!
//! Everything happens inside [`RadioLink::do_events`], which the application
//! calls from its main loop (or indirectly through the blocking send/receive
//! wrappers). The radio hardware is reached through the [`RadioDriver`]
//! trait; loopback and channel-based simulator implementations are bundled
//! behind the `radio-device-echo` and `radio-device-simulator` features for
//! development and tests.

#[cfg(feature = "radio-device-echo")]
pub mod radio_device_echo;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

mod link;
mod packet;
mod pktid_cache;
mod task;
mod task_pool;

use core::sync::atomic::{AtomicBool, Ordering};
use embassy_time::Duration;

pub use link::{RadioLink, Received, SendReport};
pub use packet::{Header, PacketBuffer, FLAG_ACK, FLAG_NONE, FLAG_SIN, HEADER_LEN};
pub use task::{TaskState, SND_ACK_SCHED, SND_EXPACK_SCHED, SND_SCHED};

//Hardware dependent constant: compile-time upper bound for one on-air frame,
//including the header. The driver reports its real maximum at init time and
//the engine uses the smaller of the two.
pub const RADIO_FRAME_SIZE: usize = 64;

//Capacity constants. They only affect how much concurrent activity a node
//can hold, not wire compatibility.
pub const MAX_TASK_COUNT: usize = 15;
pub const PKTID_CACHE_SIZE: usize = 10;

/// 1-byte link-layer address. `0xFF` is reserved for broadcast.
pub type Address = u8;

/// Broadcast destination address. Frames sent to it are never acknowledged,
/// even when the sender sets the SIN flag.
pub const ADDR_BROADCAST: Address = 0xFF;

/// Identifier of one in-flight send or receive activity. Monotonic and
/// never zero.
pub type TaskId = u16;

/// 16-bit packet identifier, incremented per outgoing non-ACK packet and
/// wrapping modulo 2^16.
pub type PacketId = u16;

/// Errors surfaced by the public API.
///
/// Failed transmissions are not in this list on purpose: the driver's status
/// byte is recorded on the task and retransmissions continue per schedule.
/// Only the final outcome of a send is reported, as `NoAckReceived` or
/// `SendIo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// [`RadioLink::init`] has not been run yet.
    NotInitialized,
    /// Payload exceeds the radio's maximum (frame size minus header).
    PayloadTooLong,
    /// Argument contract violated: the payload length cannot be encoded in
    /// the header's 1-byte length field.
    BadArguments,
    /// The driver reported a non-zero status on the last transmission of an
    /// unacknowledged send.
    SendIo(u8),
    /// The retransmission schedule ran out without a matching ACK.
    NoAckReceived,
    /// All task slots are occupied. Callers must yield to the pump instead
    /// of retrying in a tight loop.
    PoolFull,
    /// No task with that id exists (any more).
    UnknownTaskId,
    /// The task has not reached a final state yet.
    TaskUnderway,
    /// No frame arrived within the configured receive timeout.
    Timeout,
    /// The task is in a state that has no result to report.
    Undefined,
}

/// Tunable timing parameters of the engine. All defaults follow the values
/// proven on CC1101-class hardware.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// How long a delivered-but-not-retrieved frame stays available before
    /// the receive task times out and the payload is dropped.
    pub data_avail_delay: Duration,
    /// Grace period a finished receive task keeps its slot, so late status
    /// polls still observe the terminal state.
    pub receive_purge_delay: Duration,
    /// Grace period a finished send task keeps its slot.
    pub send_purge_delay: Duration,
    /// Age after which a duplicate-cache entry is discarded.
    pub cache_discard_delay: Duration,
    /// Minimum delay between two recovery resets of the transceiver.
    pub min_device_reset_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            data_avail_delay: Duration::from_millis(900),
            receive_purge_delay: Duration::from_millis(1000),
            send_purge_delay: Duration::from_millis(1000),
            // 49 hours
            cache_discard_delay: Duration::from_millis(176_400_000),
            min_device_reset_delay: Duration::from_millis(1000),
        }
    }
}

/// Completion hook for a non-blocking receive. Invoked from inside the pump
/// with the sender address and the payload; the frame is acknowledged and
/// the task moves on as if the application had retrieved the data itself.
pub type RxCallback = fn(sender: Address, payload: &[u8]);

/// Per-call receive configuration. Each field is independently optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxConfig {
    /// Accept frames from this source only.
    pub sender: Option<Address>,
    /// Give up and enter `ReceiveTimedout` after this long. Without it a
    /// receive listens forever.
    pub timeout: Option<Duration>,
    /// Deliver through this hook instead of waiting for a retrieve call.
    pub callback: Option<RxCallback>,
}

/// Device options understood by [`RadioDriver::set_option`]. All values are
/// one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOption {
    /// The device's own link-layer address, loaded into the hardware
    /// address filter.
    Address,
    /// Non-zero disables the hardware address filter and the receiver
    /// accepts frames for any destination.
    SnifMode,
    /// Zero selects low emission power, non-zero high.
    EmissionPower,
}

/// Flag shared between the radio's data-ready interrupt handler and the
/// event pump.
///
/// The ISR only ever calls [`raise`](InterruptFlag::raise); the pump is the
/// single reader and clearer. Acquire/release ordering keeps the compiler
/// from hoisting the read out of the pump loop.
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub const fn new() -> Self {
        InterruptFlag(AtomicBool::new(false))
    }

    /// Called from the interrupt handler on the radio's data-ready edge.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract between the engine and a radio transceiver driver.
///
/// All calls are synchronous and are only ever issued from the thread that
/// runs the pump; the engine owns the transceiver exclusively. Initialization
/// parameters (pins, SPI bus, frequency plan) are not part of this trait as
/// they are highly hardware-dependent; construct the driver fully configured
/// and hand it to [`RadioLink::new`].
pub trait RadioDriver {
    /// Initialize the hardware and return the maximum on-air frame size in
    /// bytes. With `reset_only` the device is re-armed without changing its
    /// configuration; the returned value is ignored in that case.
    fn init(&mut self, reset_only: bool) -> u8;

    /// Transmit one frame synchronously. Returns the device status byte,
    /// zero on success.
    fn send(&mut self, frame: &[u8]) -> u8;

    /// Drain one pending frame into `buf` without blocking. Returns the
    /// number of bytes received, zero when nothing is pending.
    fn receive(&mut self, buf: &mut [u8]) -> usize;

    /// Apply a one-byte device option.
    fn set_option(&mut self, option: DeviceOption, value: u8);

    /// Arm the data-ready interrupt: from now on the driver raises `flag`
    /// whenever a frame lands.
    fn set_interrupt(&mut self, flag: &'static InterruptFlag);

    /// Disarm the data-ready interrupt.
    fn reset_interrupt(&mut self);

    /// Park the CPU in its deepest sleep mode until the next radio
    /// interrupt. Platform-specific; the default does nothing.
    fn sleep(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_timings() {
        let config = LinkConfig::default();
        assert_eq!(config.data_avail_delay, Duration::from_millis(900));
        assert_eq!(config.receive_purge_delay, Duration::from_millis(1000));
        assert_eq!(config.send_purge_delay, Duration::from_millis(1000));
        assert_eq!(config.cache_discard_delay, Duration::from_millis(176_400_000));
        assert_eq!(config.min_device_reset_delay, Duration::from_millis(1000));
    }

    #[test]
    fn interrupt_flag_raise_and_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        flag.raise();
        assert!(flag.is_raised());
        // raising twice is idempotent
        flag.raise();
        assert!(flag.is_raised());
        flag.clear();
        assert!(!flag.is_raised());
    }

    #[test]
    fn rx_config_default_is_fully_unset() {
        let config = RxConfig::default();
        assert!(config.sender.is_none());
        assert!(config.timeout.is_none());
        assert!(config.callback.is_none());
    }
}
