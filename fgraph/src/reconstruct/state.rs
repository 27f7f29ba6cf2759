//! Open call stacks, one per thread
//!
//! A context is created by its first entry event and removed once its entries
//! and returns balance. Returns and custom events for a context with no open
//! stack belong to calls that began before tracing started and are dropped.

use std::collections::HashMap;

use crate::domain::{ArgPayload, ProbeKind, Tid, TraceEvent};

/// An event and the argument values captured with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub event: TraceEvent,
    pub args: Vec<ArgPayload>,
}

#[derive(Debug, Default, Clone)]
pub struct OpenStack {
    pub records: Vec<Record>,
    /// Entries minus returns
    pub depth: usize,
}

/// What recording an event did to its context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No open stack for a return or custom event
    Discarded,
    /// The same prologue fired again under a different frame; the earlier
    /// record was replaced
    Replaced,
    Open,
    /// Entries and returns balance; the stack is ready to render
    Closed,
}

#[derive(Debug, Default)]
pub struct StackTable {
    stacks: HashMap<Tid, OpenStack>,
}

impl StackTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    #[must_use]
    pub fn get(&self, context: Tid) -> Option<&OpenStack> {
        self.stacks.get(&context)
    }

    pub fn add(&mut self, event: TraceEvent, args: Vec<ArgPayload>) -> Transition {
        let context = event.context;
        let Some(stack) = self.stacks.get_mut(&context) else {
            if event.kind != ProbeKind::Entry {
                return Transition::Discarded;
            }
            self.stacks.insert(context, OpenStack { records: vec![Record { event, args }], depth: 1 });
            return Transition::Open;
        };

        match event.kind {
            ProbeKind::Entry => {
                if let Some(last) = stack.records.last_mut() {
                    if last.event.kind == ProbeKind::Entry
                        && last.event.ip == event.ip
                        && last.event.frame != event.frame
                    {
                        *last = Record { event, args };
                        return Transition::Replaced;
                    }
                }
                stack.records.push(Record { event, args });
                stack.depth += 1;
                Transition::Open
            }
            ProbeKind::Return => {
                stack.records.push(Record { event, args });
                stack.depth = stack.depth.saturating_sub(1);
                if stack.depth == 0 {
                    Transition::Closed
                } else {
                    Transition::Open
                }
            }
            ProbeKind::Custom => {
                stack.records.push(Record { event, args });
                Transition::Open
            }
        }
    }

    /// Remove the stack of `context`
    pub fn take(&mut self, context: Tid) -> Option<OpenStack> {
        self.stacks.remove(&context)
    }

    /// Remove every stack, ordered by context id
    pub fn drain_sorted(&mut self) -> Vec<(Tid, OpenStack)> {
        let mut stacks: Vec<_> = self.stacks.drain().collect();
        stacks.sort_by_key(|(context, _)| *context);
        stacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;

    fn event(tid: u32, kind: ProbeKind, ip: u64, frame: u64) -> TraceEvent {
        TraceEvent {
            context: Tid(tid),
            pid: Pid(1),
            kind,
            ip,
            caller_ip: 0x500,
            frame,
            time_ns: 0,
            errno: 0,
            backtrace: Vec::new(),
            arg_count: 0,
        }
    }

    #[test]
    fn test_duplicate_entry_collapses() {
        let mut table = StackTable::new();
        assert_eq!(table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]), Transition::Open);
        assert_eq!(table.add(event(1, ProbeKind::Entry, 0x100, 0x6000), vec![]), Transition::Replaced);
        assert_eq!(table.get(Tid(1)).unwrap().records.len(), 1);
        assert_eq!(table.get(Tid(1)).unwrap().records[0].event.frame, 0x6000);
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]), Transition::Closed);

        let stack = table.take(Tid(1)).unwrap();
        assert_eq!(stack.records.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_recursive_entry_in_same_frame_nests() {
        let mut table = StackTable::new();
        table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]);
        assert_eq!(table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]), Transition::Open);
        let stack = table.get(Tid(1)).unwrap();
        assert_eq!(stack.records.len(), 2);
        assert_eq!(stack.depth, 2);
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]), Transition::Open);
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]), Transition::Closed);
    }

    #[test]
    fn test_orphans_are_discarded() {
        let mut table = StackTable::new();
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]), Transition::Discarded);
        assert_eq!(table.add(event(1, ProbeKind::Custom, 0x108, 0), vec![]), Transition::Discarded);
        assert!(table.is_empty());
    }

    #[test]
    fn test_nesting_and_customs() {
        let mut table = StackTable::new();
        table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]);
        table.add(event(1, ProbeKind::Custom, 0x108, 0x7000), vec![]);
        table.add(event(1, ProbeKind::Entry, 0x200, 0x6000), vec![]);
        assert_eq!(table.get(Tid(1)).unwrap().depth, 2);
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x210, 0), vec![]), Transition::Open);
        assert_eq!(table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]), Transition::Closed);
        assert_eq!(table.take(Tid(1)).unwrap().records.len(), 5);
    }

    #[test]
    fn test_closed_context_starts_fresh() {
        let mut table = StackTable::new();
        table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]);
        table.add(event(1, ProbeKind::Return, 0x110, 0), vec![]);
        table.take(Tid(1));
        assert_eq!(table.add(event(1, ProbeKind::Entry, 0x100, 0x7000), vec![]), Transition::Open);
        assert_eq!(table.get(Tid(1)).unwrap().records.len(), 1);
    }

    #[test]
    fn test_drain_sorted() {
        let mut table = StackTable::new();
        for tid in [9, 3, 5] {
            table.add(event(tid, ProbeKind::Entry, 0x100, 0x7000), vec![]);
        }
        let order: Vec<_> = table.drain_sorted().into_iter().map(|(tid, _)| tid.0).collect();
        assert_eq!(order, [3, 5, 9]);
        assert!(table.is_empty());
    }
}
