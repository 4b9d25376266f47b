//! # Radio Device Simulator — Channel-Backed Driver for Multi-Node Tests
//!
//! Emulates a transceiver with a pair of queues instead of hardware:
//!
//! - **Output queue**: frames this node transmits into the simulated air
//! - **Input queue**: frames the simulated air delivers to this node
//!
//! The air itself is owned by the harness. [`AirPipe`] is the minimal edge:
//! it ferries everything pending on one node's output into another node's
//! input and raises the destination's interrupt flag, exactly as a frame
//! landing in a real radio's FIFO would. Tests wire two engines together
//! with two pipes and pump everything from a single thread, or inject
//! hand-crafted frames directly into an input queue.
//!
//! An optional WyRand-driven loss injector drops outgoing frames with a
//! configurable probability, for exercising the retransmission schedules
//! against an unreliable channel.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TrySendError};
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::packet::PacketBuffer;
use crate::{DeviceOption, InterruptFlag, RadioDriver, RADIO_FRAME_SIZE};

/// How many frames a queue buffers before the air drops them.
pub const SIM_QUEUE_SIZE: usize = 16;

/// Queue carrying frames between a simulated radio and the air.
pub type FrameQueue = Channel<CriticalSectionRawMutex, PacketBuffer, SIM_QUEUE_SIZE>;
/// Sending endpoint of a [`FrameQueue`].
pub type FrameQueueSender = Sender<'static, CriticalSectionRawMutex, PacketBuffer, SIM_QUEUE_SIZE>;
/// Receiving endpoint of a [`FrameQueue`].
pub type FrameQueueReceiver =
    Receiver<'static, CriticalSectionRawMutex, PacketBuffer, SIM_QUEUE_SIZE>;

struct LossInjector {
    rng: WyRand,
    drop_permille: u16,
}

impl LossInjector {
    fn frame_is_lost(&mut self) -> bool {
        (self.rng.next_u32() % 1000) < self.drop_permille as u32
    }
}

/// Simulated radio device. Create the two queues as statics (or leak them
/// in std tests), then construct with [`RadioDevice::with`].
pub struct RadioDevice {
    output_queue_sender: FrameQueueSender,
    input_queue_receiver: FrameQueueReceiver,
    staged: Option<PacketBuffer>,
    loss: Option<LossInjector>,
}

impl RadioDevice {
    pub const fn with(
        output_queue_sender: FrameQueueSender,
        input_queue_receiver: FrameQueueReceiver,
    ) -> Self {
        RadioDevice {
            output_queue_sender,
            input_queue_receiver,
            staged: None,
            loss: None,
        }
    }

    /// Like [`with`](RadioDevice::with), but drops outgoing frames with a
    /// probability of `drop_permille` per thousand.
    pub fn with_loss(
        output_queue_sender: FrameQueueSender,
        input_queue_receiver: FrameQueueReceiver,
        rng_seed: u64,
        drop_permille: u16,
    ) -> Self {
        RadioDevice {
            output_queue_sender,
            input_queue_receiver,
            staged: None,
            loss: Some(LossInjector {
                rng: WyRand::seed_from_u64(rng_seed),
                drop_permille,
            }),
        }
    }

    fn stage_next(&mut self) {
        if self.staged.is_none() {
            if let Ok(frame) = self.input_queue_receiver.try_receive() {
                self.staged = Some(frame);
            }
        }
    }
}

impl RadioDriver for RadioDevice {
    fn init(&mut self, _reset_only: bool) -> u8 {
        RADIO_FRAME_SIZE as u8
    }

    fn send(&mut self, frame: &[u8]) -> u8 {
        if let Some(loss) = &mut self.loss {
            if loss.frame_is_lost() {
                // the transmission "succeeded", the air just ate it
                log!(Level::Trace, "simulated air lost a frame of {} bytes", frame.len());
                return 0;
            }
        }
        let mut pkt = PacketBuffer::new();
        pkt.data[..frame.len()].copy_from_slice(frame);
        pkt.length = frame.len();
        match self.output_queue_sender.try_send(pkt) {
            Ok(()) => 0,
            Err(TrySendError::Full(_)) => {
                log!(Level::Warn, "simulator output queue full, dropping frame");
                1
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        self.stage_next();
        let Some(frame) = self.staged.take() else {
            return 0;
        };
        let nb_bytes = frame.length.min(buf.len());
        buf[..nb_bytes].copy_from_slice(&frame.data[..nb_bytes]);
        nb_bytes
    }

    fn set_option(&mut self, option: DeviceOption, value: u8) {
        log!(Level::Trace, "simulator device option {:?} = {}", option, value);
    }

    fn set_interrupt(&mut self, flag: &'static InterruptFlag) {
        // frames that landed while the interrupt was disarmed must still be
        // signalled, otherwise they would sit in the queue forever
        self.stage_next();
        if self.staged.is_some() {
            flag.raise();
        }
    }

    fn reset_interrupt(&mut self) {}
}

/// One directed edge of the simulated air: everything transmitted by the
/// `from` node is delivered to the `to` node.
pub struct AirPipe {
    from: FrameQueueReceiver,
    to: FrameQueueSender,
    irq: &'static InterruptFlag,
}

impl AirPipe {
    pub const fn new(
        from: FrameQueueReceiver,
        to: FrameQueueSender,
        irq: &'static InterruptFlag,
    ) -> Self {
        AirPipe { from, to, irq }
    }

    /// Moves every pending frame across and raises the destination's
    /// interrupt flag when at least one was delivered. Returns how many
    /// frames moved.
    pub fn transfer(&mut self) -> usize {
        let mut moved = 0;
        while let Ok(frame) = self.from.try_receive() {
            match self.to.try_send(frame) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(_)) => {
                    log!(Level::Warn, "air congestion, dropping frame");
                }
            }
        }
        if moved > 0 {
            self.irq.raise();
        }
        moved
    }
}
