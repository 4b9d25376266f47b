//! One in-flight send or receive activity and its state machine.
//!
//! Tasks progress on two event classes only: a timer firing (the current
//! time reached the task's wake-up deadline) and a valid frame being offered
//! by the engine. Both transition functions live here; the engine decides
//! when to invoke them and in which order (frames before timers, tasks in
//! pool order).

use embassy_time::{Duration, Instant};
use log::{log, Level};

use crate::packet::{pack_flags, unpack_flags, Header, PacketBuffer, FLAG_ACK, FLAG_SIN};
use crate::{Address, LinkConfig, RadioDriver, RxCallback, TaskId, ADDR_BROADCAST};

// NOTE
// The schedules below are NOT cumulative: each entry is the delay in
// milliseconds since the task's reference timestamp.

/// Sending schedule when no ACK is expected. Every entry transmits.
pub const SND_SCHED: &[u64] = &[0, 200, 550, 900];

/// Sending schedule when an ACK is expected.
///
/// A transmission occurs at every entry EXCEPT THE LAST ONE: the final entry
/// is the listen window, kept open so a late ACK can still close the task
/// before it gives up.
pub const SND_EXPACK_SCHED: &[u64] = &[0, 100, 450, 800, 900];

/// ACK sending schedule: one ACK, as soon as the packet was retrieved.
/// Extending the array would shift or repeat ACK transmissions, e.g.
/// `[0, 100, 200]` to send three ACKs 100 milliseconds apart.
pub const SND_ACK_SCHED: &[u64] = &[0];

/// States a task moves through. `Nothing` is what status queries report for
/// task ids that no longer (or never did) exist; a live task is never in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No such task.
    Nothing,
    /// Working through its transmission schedule.
    Send,
    /// Schedule exhausted or ACK received; waiting to be purged.
    SendDone,
    /// Listening for a frame.
    Receive,
    /// A frame arrived and waits for the application to retrieve it.
    ReceiveDataAvailable,
    /// The application took the payload; the header stays for re-ACKs.
    ReceiveDataRetrieved,
    /// No frame arrived in time, or the application never retrieved one.
    ReceiveTimedout,
    /// Terminal; the slot is released at the end of the tick.
    Finished,
}

/// What a frame delivery did to a task.
pub(crate) struct FrameOutcome {
    pub(crate) state: TaskState,
    /// The task took the frame; later tasks in the pool see it as absent.
    pub(crate) consumed: bool,
    /// An acknowledgement the engine should schedule after the pool pass.
    pub(crate) ack: Option<Header>,
}

/// One task slot: state, owned frame buffer, schedule cursor, event
/// subscriptions and bookkeeping flags.
pub(crate) struct LinkTask {
    pub(crate) taskid: TaskId,
    pub(crate) state: TaskState,
    pub(crate) packet: PacketBuffer,

    /// When the task was created or entered its current waiting state.
    pub(crate) mtime_ref: Instant,
    pub(crate) mtime_wakeup: Instant,
    /// Device status byte of the most recent transmission.
    pub(crate) last_retcode: u8,

    pub(crate) schedule: &'static [u64],
    pub(crate) schedule_pos: usize,
    pub(crate) nbsend: u8,

    pub(crate) sub_wakeup: bool,
    pub(crate) sub_pktrcvd: bool,

    pub(crate) is_an_ack: bool,
    pub(crate) need_ack: bool,
    pub(crate) has_received_ack: bool,
    /// Fire and forget: purge immediately once the schedule is done.
    pub(crate) unattended: bool,

    /// Accept frames from this source only.
    pub(crate) rcv_from: Option<Address>,
    pub(crate) callback: Option<RxCallback>,
}

impl LinkTask {
    pub(crate) fn new(taskid: TaskId, state: TaskState, now: Instant) -> Self {
        LinkTask {
            taskid,
            state,
            packet: PacketBuffer::new(),
            mtime_ref: now,
            mtime_wakeup: now,
            last_retcode: 0,
            schedule: SND_SCHED,
            schedule_pos: 0,
            nbsend: 0,
            sub_wakeup: false,
            sub_pktrcvd: false,
            is_an_ack: false,
            need_ack: false,
            has_received_ack: false,
            unattended: false,
            rcv_from: None,
            callback: None,
        }
    }

    /// Installs a transmission schedule and arms the timer for its first
    /// entry.
    pub(crate) fn arm_schedule(&mut self, schedule: &'static [u64]) {
        self.schedule = schedule;
        self.schedule_pos = 0;
        self.sub_wakeup = true;
        self.mtime_wakeup = self.mtime_ref + Duration::from_millis(schedule[0]);
    }

    /// Builds the acknowledgement for the frame this task holds, or `None`
    /// when the sender did not ask for one or addressed the broadcast
    /// address.
    pub(crate) fn ack_header(&self, own_addr: Address) -> Option<Header> {
        let header = self.packet.header();
        let (seq, opts) = unpack_flags(header.flags);
        if opts & FLAG_SIN == 0 {
            return None;
        }
        if header.dst == ADDR_BROADCAST {
            return None;
        }
        Some(Header {
            dst: header.src,
            src: own_addr,
            flags: pack_flags(seq, FLAG_ACK),
            pktid: header.pktid,
            len: 0,
        })
    }

    /// Drops the payload and keeps the slot around for the purge delay, so
    /// late status polls still observe the terminal state.
    pub(crate) fn start_purge(&mut self, now: Instant, config: &LinkConfig) {
        self.packet.shrink_to_header();
        self.sub_wakeup = true;
        self.mtime_wakeup = now + config.receive_purge_delay;
    }

    /// Frame-received transition. Returns the new state, whether the frame
    /// was consumed and an ACK to schedule, without committing anything —
    /// the engine commits or destroys based on the outcome.
    pub(crate) fn on_frame(
        &mut self,
        frame: &PacketBuffer,
        already_seen: bool,
        now: Instant,
        own_addr: Address,
        config: &LinkConfig,
    ) -> FrameOutcome {
        let mut outcome = FrameOutcome {
            state: self.state,
            consumed: false,
            ack: None,
        };

        let (_seq, opts) = unpack_flags(frame.flags());

        if opts & FLAG_ACK != 0 {
            // ACK frames only concern sends still waiting for one, and are
            // matched on packet id alone.
            if matches!(self.state, TaskState::Send | TaskState::SendDone)
                && self.need_ack
                && !self.has_received_ack
                && self.packet.pktid() == frame.pktid()
            {
                self.has_received_ack = true;
                if self.state == TaskState::Send {
                    self.mtime_wakeup = now + config.send_purge_delay;
                    outcome.state = TaskState::SendDone;
                }
                // the ACK arrived: the payload is no longer needed
                self.packet.shrink_to_header();
                outcome.consumed = true;
                log!(
                    Level::Trace,
                    "[0x{:02x}] taskid={} matched ack, pktid={}",
                    own_addr,
                    self.taskid,
                    frame.pktid()
                );
            }
            return outcome;
        }

        match self.state {
            TaskState::Receive => {
                if already_seen {
                    return outcome;
                }
                if let Some(only) = self.rcv_from {
                    if frame.src() != only {
                        return outcome;
                    }
                }
                self.packet.copy_from(frame);
                self.last_retcode = 0;
                outcome.consumed = true;
                self.sub_wakeup = true;
                self.mtime_ref = now;
                self.mtime_wakeup = now + config.data_avail_delay;
                log!(
                    Level::Trace,
                    "[0x{:02x}] taskid={} took frame, s=0x{:02x} pktid={} len={}",
                    own_addr,
                    self.taskid,
                    frame.src(),
                    frame.pktid(),
                    frame.payload_len()
                );
                if let Some(callback) = self.callback {
                    // completion hook: deliver now and behave as if the
                    // application retrieved the data immediately
                    callback(self.packet.src(), self.packet.payload());
                    self.start_purge(now, config);
                    outcome.ack = self.ack_header(own_addr);
                    outcome.state = TaskState::ReceiveDataRetrieved;
                } else {
                    outcome.state = TaskState::ReceiveDataAvailable;
                }
            }
            TaskState::ReceiveDataAvailable | TaskState::ReceiveDataRetrieved => {
                // a retransmit of the frame this task already holds: swallow
                // it and acknowledge again, one ACK per arrival
                if self.packet.pktid() == frame.pktid() && self.packet.src() == frame.src() {
                    outcome.consumed = true;
                    outcome.ack = self.ack_header(own_addr);
                }
            }
            _ => {}
        }

        outcome
    }

    /// Timer transition. May transmit through the device; returns the new
    /// state for the engine to commit.
    pub(crate) fn on_timer<D: RadioDriver>(
        &mut self,
        device: &mut D,
        now: Instant,
        config: &LinkConfig,
    ) -> TaskState {
        match self.state {
            TaskState::Send => {
                // the final entry of an ACK-expecting schedule is the listen
                // window: no transmit occurs at that offset
                let listen_only = self.need_ack && self.schedule_pos == self.schedule.len() - 1;
                if !listen_only {
                    self.nbsend = self.nbsend.wrapping_add(1);
                    let status = device.send(self.packet.frame());
                    self.last_retcode = status;
                    if status == 0 {
                        log!(
                            Level::Trace,
                            "send ok: taskid={} d=0x{:02x} fl=0x{:02x} pktid={} len={}",
                            self.taskid,
                            self.packet.dst(),
                            self.packet.flags(),
                            self.packet.pktid(),
                            self.packet.payload_len()
                        );
                    } else {
                        log!(
                            Level::Warn,
                            "send err: taskid={} d=0x{:02x} pktid={} status={}",
                            self.taskid,
                            self.packet.dst(),
                            self.packet.pktid(),
                            status
                        );
                    }
                    let (mut seq, opts) = unpack_flags(self.packet.flags());
                    if !self.is_an_ack {
                        seq = seq.wrapping_add(1);
                    }
                    self.packet.set_flags(pack_flags(seq, opts));
                }

                self.schedule_pos += 1;
                if self.schedule_pos < self.schedule.len() {
                    self.mtime_wakeup =
                        self.mtime_ref + Duration::from_millis(self.schedule[self.schedule_pos]);
                    self.state
                } else {
                    self.mtime_wakeup = if self.unattended {
                        now
                    } else {
                        now + config.send_purge_delay
                    };
                    TaskState::SendDone
                }
            }
            TaskState::SendDone => TaskState::Finished,
            TaskState::ReceiveDataRetrieved | TaskState::ReceiveTimedout => TaskState::Finished,
            TaskState::ReceiveDataAvailable => {
                // the application never picked the data up
                self.start_purge(now, config);
                TaskState::ReceiveTimedout
            }
            TaskState::Receive => {
                self.sub_wakeup = true;
                self.mtime_wakeup = now;
                TaskState::ReceiveTimedout
            }
            TaskState::Nothing | TaskState::Finished => {
                debug_assert!(false, "timer event on inert task");
                self.state
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::packet::FLAG_NONE;

    struct RecordingDriver {
        frames: Vec<Vec<u8>>,
        status: u8,
    }

    impl RecordingDriver {
        fn new() -> Self {
            RecordingDriver {
                frames: Vec::new(),
                status: 0,
            }
        }
    }

    impl RadioDriver for RecordingDriver {
        fn init(&mut self, _reset_only: bool) -> u8 {
            crate::RADIO_FRAME_SIZE as u8
        }
        fn send(&mut self, frame: &[u8]) -> u8 {
            self.frames.push(frame.to_vec());
            self.status
        }
        fn receive(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
        fn set_option(&mut self, _option: crate::DeviceOption, _value: u8) {}
        fn set_interrupt(&mut self, _flag: &'static crate::InterruptFlag) {}
        fn reset_interrupt(&mut self) {}
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn send_task(want_ack: bool, payload: &[u8]) -> LinkTask {
        let mut task = LinkTask::new(1, TaskState::Send, at(0));
        task.need_ack = want_ack;
        task.sub_pktrcvd = want_ack;
        let header = Header {
            dst: 0x5E,
            src: 0x0B,
            flags: pack_flags(0, if want_ack { FLAG_SIN } else { FLAG_NONE }),
            pktid: 1,
            len: payload.len() as u8,
        };
        task.packet.prepare_for_send(&header, payload);
        task.arm_schedule(if want_ack { SND_EXPACK_SCHED } else { SND_SCHED });
        task
    }

    fn run_schedule(task: &mut LinkTask, device: &mut RecordingDriver, config: &LinkConfig) {
        while task.state == TaskState::Send {
            let now = task.mtime_wakeup;
            task.state = task.on_timer(device, now, config);
        }
    }

    #[test]
    fn plain_schedule_transmits_at_every_entry() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = send_task(false, b"hi\0");
        run_schedule(&mut task, &mut device, &config);
        assert_eq!(device.frames.len(), SND_SCHED.len());
        assert_eq!(task.nbsend as usize, SND_SCHED.len());
        assert_eq!(task.state, TaskState::SendDone);
    }

    #[test]
    fn expack_schedule_reserves_the_listen_window() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = send_task(true, b"hi\0");
        run_schedule(&mut task, &mut device, &config);
        // the last entry only waits for a late ACK
        assert_eq!(device.frames.len(), SND_EXPACK_SCHED.len() - 1);
        assert_eq!(task.nbsend as usize, SND_EXPACK_SCHED.len() - 1);
        assert_eq!(task.state, TaskState::SendDone);
        assert!(!task.has_received_ack);
    }

    #[test]
    fn sequence_nibble_increments_per_transmit() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = send_task(false, b"x");
        run_schedule(&mut task, &mut device, &config);
        let seqs: Vec<u8> = device.frames.iter().map(|frame| frame[2] >> 4).collect();
        assert_eq!(seqs, [0, 1, 2, 3]);
        // the option nibble never changes
        assert!(device.frames.iter().all(|frame| frame[2] & 0x0F == FLAG_NONE));
    }

    #[test]
    fn ack_task_keeps_sequence_and_purges_immediately() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = LinkTask::new(2, TaskState::Send, at(0));
        task.is_an_ack = true;
        task.unattended = true;
        let header = Header {
            dst: 0x0B,
            src: 0x5E,
            flags: pack_flags(2, FLAG_ACK),
            pktid: 9,
            len: 0,
        };
        task.packet.prepare_for_send(&header, &[]);
        task.arm_schedule(SND_ACK_SCHED);

        let now = task.mtime_wakeup;
        task.state = task.on_timer(&mut device, now, &config);
        assert_eq!(device.frames.len(), 1);
        assert_eq!(device.frames[0][2], pack_flags(2, FLAG_ACK));
        assert_eq!(task.state, TaskState::SendDone);
        // unattended: no grace period
        assert_eq!(task.mtime_wakeup, now);
        assert_eq!(task.on_timer(&mut device, now, &config), TaskState::Finished);
    }

    #[test]
    fn failed_transmissions_keep_the_schedule_running() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        device.status = 5;
        let mut task = send_task(false, b"x");
        run_schedule(&mut task, &mut device, &config);
        assert_eq!(device.frames.len(), SND_SCHED.len());
        assert_eq!(task.last_retcode, 5);
        assert_eq!(task.state, TaskState::SendDone);
    }

    fn incoming(src: Address, dst: Address, pktid: u16, opts: u8, payload: &[u8]) -> PacketBuffer {
        let mut frame = PacketBuffer::new();
        let header = Header {
            dst,
            src,
            flags: pack_flags(0, opts),
            pktid,
            len: payload.len() as u8,
        };
        frame.prepare_for_send(&header, payload);
        frame
    }

    #[test]
    fn matching_ack_completes_the_send() {
        let config = LinkConfig::default();
        let mut task = send_task(true, b"hi\0");
        let ack = incoming(0x5E, 0x0B, 1, FLAG_ACK, &[]);
        let outcome = task.on_frame(&ack, false, at(100), 0x0B, &config);
        assert!(outcome.consumed);
        assert_eq!(outcome.state, TaskState::SendDone);
        assert!(task.has_received_ack);
        // payload released, header kept
        assert_eq!(task.packet.length, crate::HEADER_LEN);
    }

    #[test]
    fn foreign_ack_is_ignored() {
        let config = LinkConfig::default();
        let mut task = send_task(true, b"hi\0");
        let ack = incoming(0x5E, 0x0B, 2, FLAG_ACK, &[]);
        let outcome = task.on_frame(&ack, false, at(100), 0x0B, &config);
        assert!(!outcome.consumed);
        assert_eq!(outcome.state, TaskState::Send);
        assert!(!task.has_received_ack);
    }

    #[test]
    fn receive_takes_fresh_frame_and_arms_data_avail_deadline() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, 0x5E, 7, FLAG_SIN, b"ok");
        let outcome = task.on_frame(&frame, false, at(50), 0x5E, &config);
        assert!(outcome.consumed);
        assert_eq!(outcome.state, TaskState::ReceiveDataAvailable);
        assert!(outcome.ack.is_none());
        assert!(task.sub_wakeup);
        assert_eq!(task.mtime_wakeup, at(50) + config.data_avail_delay);
        assert_eq!(task.packet.payload(), b"ok");
    }

    #[test]
    fn receive_skips_duplicates_and_acks() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, 0x5E, 7, FLAG_SIN, b"ok");
        let outcome = task.on_frame(&frame, true, at(50), 0x5E, &config);
        assert!(!outcome.consumed);
        assert_eq!(outcome.state, TaskState::Receive);

        let ack = incoming(0x0B, 0x5E, 7, FLAG_ACK, &[]);
        let outcome = task.on_frame(&ack, false, at(51), 0x5E, &config);
        assert!(!outcome.consumed);
        assert_eq!(outcome.state, TaskState::Receive);
    }

    #[test]
    fn single_sender_filter_leaves_other_frames_alone() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        task.rcv_from = Some(0x0B);
        let other = incoming(0x0C, 0x5E, 7, FLAG_SIN, b"no");
        let outcome = task.on_frame(&other, false, at(50), 0x5E, &config);
        assert!(!outcome.consumed);
        assert_eq!(outcome.state, TaskState::Receive);

        let wanted = incoming(0x0B, 0x5E, 8, FLAG_SIN, b"ok");
        let outcome = task.on_frame(&wanted, false, at(51), 0x5E, &config);
        assert!(outcome.consumed);
        assert_eq!(outcome.state, TaskState::ReceiveDataAvailable);
    }

    #[test]
    fn retransmit_of_held_frame_is_swallowed_and_reacked() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, 0x5E, 7, FLAG_SIN, b"ok");
        task.state = task.on_frame(&frame, false, at(50), 0x5E, &config).state;

        // still unretrieved: the retransmit is consumed and acknowledged
        let outcome = task.on_frame(&frame, true, at(60), 0x5E, &config);
        assert!(outcome.consumed);
        assert_eq!(outcome.state, TaskState::ReceiveDataAvailable);
        let ack = outcome.ack.expect("retransmit must be acked");
        assert_eq!(ack.dst, 0x0B);
        assert_eq!(ack.src, 0x5E);
        assert_eq!(ack.pktid, 7);
        assert_eq!(ack.len, 0);
        assert_eq!(ack.flags & 0x0F, FLAG_ACK);

        // after retrieval the same holds
        task.start_purge(at(70), &config);
        task.state = TaskState::ReceiveDataRetrieved;
        let outcome = task.on_frame(&frame, true, at(80), 0x5E, &config);
        assert!(outcome.consumed);
        assert!(outcome.ack.is_some());
        assert_eq!(outcome.state, TaskState::ReceiveDataRetrieved);

        // a different pktid from the same source is not for this task
        let fresh = incoming(0x0B, 0x5E, 8, FLAG_SIN, b"new");
        let outcome = task.on_frame(&fresh, false, at(90), 0x5E, &config);
        assert!(!outcome.consumed);
    }

    #[test]
    fn frames_without_sin_are_not_acked() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, 0x5E, 7, FLAG_NONE, b"ok");
        task.state = task.on_frame(&frame, false, at(50), 0x5E, &config).state;
        assert!(task.ack_header(0x5E).is_none());
    }

    #[test]
    fn broadcast_frames_are_never_acked() {
        let config = LinkConfig::default();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, ADDR_BROADCAST, 7, FLAG_SIN, b"all");
        task.state = task.on_frame(&frame, false, at(50), 0x5E, &config).state;
        assert_eq!(task.state, TaskState::ReceiveDataAvailable);
        assert!(task.ack_header(0x5E).is_none());
    }

    #[test]
    fn data_avail_expiry_times_out_and_finishes() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        let frame = incoming(0x0B, 0x5E, 7, FLAG_SIN, b"ok");
        task.state = task.on_frame(&frame, false, at(50), 0x5E, &config).state;

        let expiry = task.mtime_wakeup;
        task.state = task.on_timer(&mut device, expiry, &config);
        assert_eq!(task.state, TaskState::ReceiveTimedout);
        assert_eq!(task.mtime_wakeup, expiry + config.receive_purge_delay);
        assert_eq!(
            task.on_timer(&mut device, task.mtime_wakeup, &config),
            TaskState::Finished
        );
    }

    #[test]
    fn listen_timeout_finishes_quickly() {
        let config = LinkConfig::default();
        let mut device = RecordingDriver::new();
        let mut task = LinkTask::new(3, TaskState::Receive, at(0));
        task.sub_pktrcvd = true;
        task.sub_wakeup = true;
        task.mtime_wakeup = at(500);

        task.state = task.on_timer(&mut device, at(500), &config);
        assert_eq!(task.state, TaskState::ReceiveTimedout);
        assert_eq!(
            task.on_timer(&mut device, at(501), &config),
            TaskState::Finished
        );
    }
}
