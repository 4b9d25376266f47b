use embassy_time::Instant;

use crate::task::{LinkTask, TaskState};
use crate::TaskId;

/// Bounded collection of task slots, sized at compile time.
///
/// Slots hold `Option<LinkTask>`; a free slot is `None`. Lookups are linear
/// scans, which is cheap for the handful of slots a microcontroller carries
/// and avoids any allocation failure mode.
pub(crate) struct TaskPool<const SIZE: usize> {
    pub(crate) slots: [Option<LinkTask>; SIZE],
    last_taskid: TaskId,
}

impl<const SIZE: usize> TaskPool<SIZE> {
    pub(crate) fn new() -> Self {
        TaskPool {
            slots: [const { None }; SIZE],
            last_taskid: 0,
        }
    }

    /// Claims a free slot and returns the new task, or `None` when the pool
    /// is exhausted. Task ids are monotonic and skip zero on wraparound.
    pub(crate) fn create(&mut self, state: TaskState, now: Instant) -> Option<&mut LinkTask> {
        let slot_idx = self.slots.iter().position(|slot| slot.is_none())?;
        self.last_taskid = self.last_taskid.wrapping_add(1);
        if self.last_taskid == 0 {
            self.last_taskid = 1;
        }
        self.slots[slot_idx] = Some(LinkTask::new(self.last_taskid, state, now));
        self.slots[slot_idx].as_mut()
    }

    pub(crate) fn get(&self, taskid: TaskId) -> Option<&LinkTask> {
        self.iter().find(|task| task.taskid == taskid)
    }

    pub(crate) fn get_mut(&mut self, taskid: TaskId) -> Option<&mut LinkTask> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut())
            .find(|task| task.taskid == taskid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LinkTask> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn create_assigns_monotonic_nonzero_ids() {
        let mut pool: TaskPool<4> = TaskPool::new();
        let first = pool.create(TaskState::Send, at(0)).map(|task| task.taskid);
        let second = pool.create(TaskState::Receive, at(0)).map(|task| task.taskid);
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn pool_exhaustion_and_slot_reuse() {
        let mut pool: TaskPool<2> = TaskPool::new();
        let first = pool.create(TaskState::Send, at(0)).map(|task| task.taskid);
        assert!(pool.create(TaskState::Send, at(0)).is_some());
        assert!(pool.create(TaskState::Send, at(0)).is_none());

        // releasing a slot makes room, and ids keep growing
        pool.slots[0] = None;
        let third = pool.create(TaskState::Receive, at(1)).map(|task| task.taskid);
        assert_eq!(first, Some(1));
        assert_eq!(third, Some(3));
    }

    #[test]
    fn lookup_by_taskid() {
        let mut pool: TaskPool<4> = TaskPool::new();
        let taskid = match pool.create(TaskState::Receive, at(0)) {
            Some(task) => task.taskid,
            None => unreachable!(),
        };
        assert!(pool.get(taskid).is_some());
        assert!(pool.get(taskid + 1).is_none());
        assert_eq!(pool.get(taskid).map(|task| task.state), Some(TaskState::Receive));
    }

    #[test]
    fn taskid_wraparound_skips_zero() {
        let mut pool: TaskPool<1> = TaskPool::new();
        pool.last_taskid = u16::MAX;
        let taskid = pool.create(TaskState::Send, at(0)).map(|task| task.taskid);
        assert_eq!(taskid, Some(1));
    }
}
