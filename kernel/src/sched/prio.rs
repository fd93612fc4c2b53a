//! RT priority arrays
//!
//! One FIFO list per RT priority plus a presence bitmap. Lists are linked
//! through indices stored in the tasks themselves (`RtEntity::run` for the
//! run list, `RtEntity::push` for the pushable set), so insertion and
//! removal never allocate.

use super::rq::TaskTable;
use super::task::{Task, TaskId, MAX_RT_PRIO};

const BITMAP_WORDS: usize = 2;

/// List membership of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Links {
    pub prev: Option<TaskId>,
    pub next: Option<TaskId>,
    /// Priority bucket the task was linked at
    pub prio: u32,
    pub linked: bool,
}

/// Which link set of the RT entity a [`PrioArray`] threads through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Run,
    Push,
}

fn links(task: &Task, kind: ListKind) -> &Links {
    match kind {
        ListKind::Run => &task.rt.run,
        ListKind::Push => &task.rt.push,
    }
}

fn links_mut(tasks: &mut TaskTable, id: TaskId, kind: ListKind) -> &mut Links {
    match tasks.get_mut(&id) {
        Some(task) => match kind {
            ListKind::Run => &mut task.rt.run,
            ListKind::Push => &mut task.rt.push,
        },
        None => sched_bug!("task {} is linked but not in the home table", id),
    }
}

/// Bit per RT priority plus a delimiter bit at `MAX_RT_PRIO`, so a search
/// for the first set bit always terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrioBitmap {
    words: [u64; BITMAP_WORDS],
}

impl PrioBitmap {
    pub fn new() -> Self {
        let mut bitmap = Self {
            words: [0; BITMAP_WORDS],
        };
        bitmap.set(MAX_RT_PRIO);
        bitmap
    }

    #[inline]
    pub fn set(&mut self, prio: u32) {
        self.words[(prio / 64) as usize] |= 1 << (prio % 64);
    }

    #[inline]
    pub fn clear(&mut self, prio: u32) {
        self.words[(prio / 64) as usize] &= !(1 << (prio % 64));
    }

    #[inline]
    pub fn test(&self, prio: u32) -> bool {
        self.words[(prio / 64) as usize] & (1 << (prio % 64)) != 0
    }

    /// First set bit at or after `from`; returns `MAX_RT_PRIO` when no
    /// priority is populated.
    pub fn next_set(&self, from: u32) -> u32 {
        let mut word = (from / 64) as usize;
        let mut bits = self.words[word] & (u64::MAX << (from % 64));
        loop {
            if bits != 0 {
                return word as u32 * 64 + bits.trailing_zeros();
            }
            word += 1;
            if word >= BITMAP_WORDS {
                return MAX_RT_PRIO;
            }
            bits = self.words[word];
        }
    }

    /// Highest populated priority (numerically lowest).
    #[inline]
    pub fn first(&self) -> u32 {
        self.next_set(0)
    }
}

impl Default for PrioBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ListHead {
    first: Option<TaskId>,
    last: Option<TaskId>,
}

impl ListHead {
    const EMPTY: Self = Self {
        first: None,
        last: None,
    };
}

/// Priority-indexed array of task lists.
pub struct PrioArray {
    kind: ListKind,
    bitmap: PrioBitmap,
    heads: [ListHead; MAX_RT_PRIO as usize],
    nr: u32,
}

impl PrioArray {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            bitmap: PrioBitmap::new(),
            heads: [ListHead::EMPTY; MAX_RT_PRIO as usize],
            nr: 0,
        }
    }

    /// Append `id` to the list of `prio`.
    pub fn push_back(&mut self, tasks: &mut TaskTable, id: TaskId, prio: u32) {
        sched_bug_on!(prio >= MAX_RT_PRIO, "rt list priority {} out of range", prio);
        let kind = self.kind;
        let head = &mut self.heads[prio as usize];
        let old_last = head.last;
        {
            let l = links_mut(tasks, id, kind);
            sched_bug_on!(l.linked, "task {} linked twice ({:?})", id, kind);
            *l = Links {
                prev: old_last,
                next: None,
                prio,
                linked: true,
            };
        }
        match old_last {
            Some(last) => links_mut(tasks, last, kind).next = Some(id),
            None => head.first = Some(id),
        }
        head.last = Some(id);
        self.bitmap.set(prio);
        self.nr += 1;
    }

    /// Prepend `id` to the list of `prio`.
    pub fn push_front(&mut self, tasks: &mut TaskTable, id: TaskId, prio: u32) {
        sched_bug_on!(prio >= MAX_RT_PRIO, "rt list priority {} out of range", prio);
        let kind = self.kind;
        let head = &mut self.heads[prio as usize];
        let old_first = head.first;
        {
            let l = links_mut(tasks, id, kind);
            sched_bug_on!(l.linked, "task {} linked twice ({:?})", id, kind);
            *l = Links {
                prev: None,
                next: old_first,
                prio,
                linked: true,
            };
        }
        match old_first {
            Some(first) => links_mut(tasks, first, kind).prev = Some(id),
            None => head.last = Some(id),
        }
        head.first = Some(id);
        self.bitmap.set(prio);
        self.nr += 1;
    }

    /// Unlink `id`, clearing its priority bit if the list empties.
    pub fn remove(&mut self, tasks: &mut TaskTable, id: TaskId) {
        let kind = self.kind;
        let l = *links_mut(tasks, id, kind);
        sched_bug_on!(!l.linked, "task {} is not on the {:?} list", id, kind);
        let head = &mut self.heads[l.prio as usize];

        match l.prev {
            Some(prev) => links_mut(tasks, prev, kind).next = l.next,
            None => head.first = l.next,
        }
        match l.next {
            Some(next) => links_mut(tasks, next, kind).prev = l.prev,
            None => head.last = l.prev,
        }
        *links_mut(tasks, id, kind) = Links::default();

        if head.first.is_none() {
            self.bitmap.clear(l.prio);
        }
        self.nr -= 1;
    }

    /// Move `id` to the head or tail of its list.
    pub fn requeue(&mut self, tasks: &mut TaskTable, id: TaskId, head: bool) {
        let prio = match tasks.get(&id) {
            Some(task) if links(task, self.kind).linked => links(task, self.kind).prio,
            _ => return,
        };
        self.remove(tasks, id);
        if head {
            self.push_front(tasks, id, prio);
        } else {
            self.push_back(tasks, id, prio);
        }
    }

    /// Highest populated priority.
    pub fn first_prio(&self) -> Option<u32> {
        let prio = self.bitmap.first();
        (prio < MAX_RT_PRIO).then_some(prio)
    }

    /// Head of the highest populated priority.
    pub fn first(&self) -> Option<TaskId> {
        self.first_prio()
            .and_then(|prio| self.heads[prio as usize].first)
    }

    pub fn head(&self, prio: u32) -> Option<TaskId> {
        self.heads.get(prio as usize).and_then(|h| h.first)
    }

    /// Whether the list of `prio` holds more than one task.
    pub fn has_multiple(&self, prio: u32) -> bool {
        self.heads
            .get(prio as usize)
            .is_some_and(|h| h.first.is_some() && h.first != h.last)
    }

    pub fn bitmap(&self) -> &PrioBitmap {
        &self.bitmap
    }

    pub fn len(&self) -> u32 {
        self.nr
    }

    pub fn is_empty(&self) -> bool {
        self.nr == 0
    }

    /// Tasks in priority order, FIFO within a priority.
    pub fn iter<'a>(&'a self, tasks: &'a TaskTable) -> PrioIter<'a> {
        PrioIter {
            array: self,
            tasks,
            prio: 0,
            next: None,
        }
    }

    /// Whether the bitmap agrees with the lists and every link is mutual.
    pub fn verify(&self, tasks: &TaskTable) -> bool {
        let mut count = 0;
        for prio in 0..MAX_RT_PRIO {
            let head = self.heads[prio as usize];
            if self.bitmap.test(prio) != head.first.is_some() {
                return false;
            }
            let mut prev = None;
            let mut cursor = head.first;
            while let Some(id) = cursor {
                let Some(task) = tasks.get(&id) else {
                    return false;
                };
                let l = links(task, self.kind);
                if !l.linked || l.prio != prio || l.prev != prev {
                    return false;
                }
                count += 1;
                prev = Some(id);
                cursor = l.next;
            }
            if head.last != prev {
                return false;
            }
        }
        self.bitmap.test(MAX_RT_PRIO) && count == self.nr
    }
}

/// Iterator over a [`PrioArray`].
pub struct PrioIter<'a> {
    array: &'a PrioArray,
    tasks: &'a TaskTable,
    prio: u32,
    next: Option<TaskId>,
}

impl Iterator for PrioIter<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        loop {
            if let Some(id) = self.next {
                self.next = self
                    .tasks
                    .get(&id)
                    .and_then(|t| links(t, self.array.kind).next);
                return Some(id);
            }
            if self.prio >= MAX_RT_PRIO {
                return None;
            }
            let prio = self.array.bitmap.next_set(self.prio);
            if prio >= MAX_RT_PRIO {
                self.prio = MAX_RT_PRIO;
                return None;
            }
            self.next = self.array.heads[prio as usize].first;
            self.prio = prio + 1;
        }
    }
}
