use std::ops::{BitAnd, BitOr};
use std::rc::Rc;

use crate::closectx::DepKind;
use crate::conjunct::{CloseInfo, Elem};
use crate::context::OpContext;
use crate::environment::Env;
use crate::error::{self, Pos};
use crate::vertex::{ArcType, VertexId};

/// A condition is a bit mask of states of a vertex that a task may provide
/// or depend on. Counter conditions are met when every contributing task
/// completes; signal conditions are met on first evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition(pub u16);

pub const NONE: Condition = Condition(0);

/// All conjuncts that ancestors could add to the vertex have been added.
/// Signal condition.
pub const ALL_ANCESTORS_PROCESSED: Condition = Condition(1 << 0);

/// The arc type of the vertex is fully determined. Counter condition.
pub const ARC_TYPE_KNOWN: Condition = Condition(1 << 1);

/// The type of the value is known. Counter condition.
pub const VALUE_KNOWN: Condition = Condition(1 << 2);

/// The vertex has a concrete scalar value, or never will have one.
/// Signal condition.
pub const SCALAR_KNOWN: Condition = Condition(1 << 3);

/// Whether lists unified here are open or closed is known. Signal condition.
pub const LIST_TYPE_KNOWN: Condition = Condition(1 << 4);

/// All conjuncts of all fields are known. Counter condition.
pub const FIELD_CONJUNCTS_KNOWN: Condition = Condition(1 << 5);

/// All fields of this node are known: every task that can add a field has
/// run and all pending arcs are resolved.
pub const FIELD_SET_KNOWN: Condition = Condition(1 << 6);

/// All tasks of the vertex, except validation, have completed.
/// Counter condition.
pub const ALL_TASKS_COMPLETED: Condition = Condition(1 << 7);

/// All tasks of the vertex and of its arcs have completed. Signal condition.
pub const SUB_FIELDS_PROCESSED: Condition = Condition(1 << 8);

/// Marks disjunction processing, to trigger finalization of disjunctions.
pub const DISJUNCTION_TASK: Condition = Condition(1 << 9);

pub const NUM_CONDITIONS: usize = 10;

pub const ALL_KNOWN: Condition = Condition(0x7fff);

/// A condition that is never met; marks a task as impossible to complete.
pub const NEVER_KNOWN: Condition = Condition(0x8000);

/// The conditions tracked by counters; the rest are signals.
pub const COUNTER_MASK: Condition = Condition(
    ARC_TYPE_KNOWN.0 | VALUE_KNOWN.0 | FIELD_CONJUNCTS_KNOWN.0 | ALL_TASKS_COMPLETED.0,
);

/// Conditions unblocked automatically when breaking a deadlock: once a
/// value can no longer become more specific these are effectively known.
pub const AUTO_UNBLOCK: Condition =
    Condition(LIST_TYPE_KNOWN.0 | SCALAR_KNOWN.0 | ARC_TYPE_KNOWN.0);

/// A conjunct whose contribution is not known in advance, e.g. an embedded
/// reference: include all value states.
pub const GENERIC_CONJUNCT: Condition = Condition(
    ALL_TASKS_COMPLETED.0 | SCALAR_KNOWN.0 | VALUE_KNOWN.0 | FIELD_CONJUNCTS_KNOWN.0,
);

/// A conjunct that only adds fields to the struct.
pub const FIELD_CONJUNCT: Condition = Condition(ALL_TASKS_COMPLETED.0 | FIELD_CONJUNCTS_KNOWN.0);

/// A conjunct guaranteed to result in a scalar or list value.
pub const SCALAR_CONJUNCT: Condition =
    Condition(ALL_TASKS_COMPLETED.0 | SCALAR_KNOWN.0 | VALUE_KNOWN.0);

pub const NEED_FIELD_CONJUNCTS_KNOWN: Condition =
    Condition(FIELD_CONJUNCTS_KNOWN.0 | ALL_ANCESTORS_PROCESSED.0);

pub const NEED_FIELD_SET_KNOWN: Condition =
    Condition(FIELD_SET_KNOWN.0 | ALL_ANCESTORS_PROCESSED.0);

pub const NEED_TASKS_DONE: Condition =
    Condition(ALL_ANCESTORS_PROCESSED.0 | ALL_TASKS_COMPLETED.0);

impl Condition {
    pub fn meets(self, x: Condition) -> bool {
        self.0 & x.0 == x.0
    }

    pub fn without(self, x: Condition) -> Condition {
        Condition(self.0 & !x.0)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Condition {
    type Output = Condition;
    fn bitor(self, rhs: Condition) -> Condition {
        Condition(self.0 | rhs.0)
    }
}

impl BitAnd for Condition {
    type Output = Condition;
    fn bitand(self, rhs: Condition) -> Condition {
        Condition(self.0 & rhs.0)
    }
}

/// How to proceed when a required condition cannot be met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Do no processing.
    Ignore,

    /// Continue even if the condition is not met; the result may be partial.
    AttemptOnly,

    /// Suspend the calling task until the condition is met.
    Yield,

    /// Force completion: uncompleted work becomes permanent errors.
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Blocked on a condition of some vertex.
    Waiting,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    Ready,
    Running,
    /// All queued tasks completed; newly inserted tasks run immediately.
    Finalizing,
    Success,
    Failed,
}

/// The type of work a task performs, with the conditions it contributes to
/// and the conditions of its own node it needs before it can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// Evaluate one conjunct expression into the node.
    EvalConjunct,

    /// Evaluate a dynamic field label and insert the field.
    ProcessDynamic,

    /// Evaluate a pattern constraint filter and register the constraint.
    ProcessPattern,

    /// Expand a comprehension and yield its declarations.
    ProcessComprehension,

    /// Unify a list literal into the node.
    ProcessList,
}

impl RunnerKind {
    pub fn completes(self) -> Condition {
        match self {
            RunnerKind::EvalConjunct => GENERIC_CONJUNCT,
            RunnerKind::ProcessDynamic => FIELD_CONJUNCT,
            RunnerKind::ProcessPattern => FIELD_CONJUNCT,
            RunnerKind::ProcessComprehension => Condition(FIELD_CONJUNCT.0 | ARC_TYPE_KNOWN.0),
            RunnerKind::ProcessList => Condition(FIELD_CONJUNCT.0 | VALUE_KNOWN.0),
        }
    }

    pub fn needs(self) -> Condition {
        NONE
    }

    pub fn name(self) -> &'static str {
        match self {
            RunnerKind::EvalConjunct => "eval",
            RunnerKind::ProcessDynamic => "dynamic",
            RunnerKind::ProcessPattern => "pattern",
            RunnerKind::ProcessComprehension => "comprehension",
            RunnerKind::ProcessList => "list",
        }
    }
}

/// Optional payload of a task beyond its main expression.
#[derive(Debug, Clone)]
pub struct TaskExtras {
    pub aux: Option<Rc<crate::expr::Expr>>,
    pub arc_flag: ArcType,
    pub pending_arcs: Vec<VertexId>,
}

impl Default for TaskExtras {
    fn default() -> TaskExtras {
        TaskExtras {
            aux: None,
            arc_flag: ArcType::Member,
            pending_arcs: Vec::new(),
        }
    }
}

/// Index of a task in the session arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u32);

impl TaskId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A task is a computation unit associated with a single vertex. Tasks
/// declare the conditions they provide and block on conditions of other
/// vertices; a blocked task is re-run from the start once the condition is
/// signalled, so runners must be idempotent until they commit their result.
#[derive(Debug, Clone)]
pub struct Task {
    pub state: TaskState,
    pub runner: RunnerKind,

    /// The vertex this task belongs to.
    pub node: VertexId,

    pub env: Env,
    pub x: Elem,
    pub ci: CloseInfo,
    pub pos: Pos,

    /// Second expression for runners that carry two: the value of a dynamic
    /// field or pattern constraint.
    pub aux: Option<Rc<crate::expr::Expr>>,

    /// The arc type a dynamic field creates.
    pub arc_flag: ArcType,

    /// Arcs provisionally registered by a comprehension, released when the
    /// comprehension resolves.
    pub pending_arcs: Vec<VertexId>,

    /// The conditions this task still has to deliver.
    pub completes: Condition,

    /// No longer relevant; set when a clone superseded this task.
    pub defunct: bool,

    /// Unblocked by force during finalization.
    pub unblocked: bool,

    pub blocked_on: Option<VertexId>,
    pub block_condition: Condition,

    pub err: Option<Rc<crate::error::Bottom>>,
}

/// The per-vertex scheduler: a condition bitset plus a task queue.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub state: SchedState,

    /// Completed conditions.
    pub completed: Condition,

    /// Conditions needed by tasks in this scheduler.
    pub needs: Condition,

    /// Conditions provided by tasks added to this scheduler.
    pub provided: Condition,

    /// Conditions that may no longer change; checked before making a node
    /// more specific.
    pub frozen: Condition,

    /// Outstanding task counts per counter condition.
    pub counters: [i32; NUM_CONDITIONS],

    pub tasks: Vec<TaskId>,
    pub task_pos: usize,

    /// Tasks blocked on conditions of this scheduler, possibly from other
    /// nodes.
    pub blocking: Vec<TaskId>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            state: SchedState::Ready,
            completed: NONE,
            needs: NONE,
            provided: NONE,
            frozen: NONE,
            counters: [0; NUM_CONDITIONS],
            tasks: Vec::new(),
            task_pos: 0,
            blocking: Vec::new(),
        }
    }

    pub fn increment_counts(&mut self, x: Condition) {
        let mut bits = (x & COUNTER_MASK).0;
        while bits != 0 {
            let n = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            self.counters[n] += 1;
        }
    }

    /// Decrements the counters; a counter reaching zero means its condition
    /// is met. Returns the newly met conditions.
    pub fn decrement_counts(&mut self, x: Condition) -> Condition {
        let mut bits = (x & COUNTER_MASK).0;
        let mut completed = 0u16;
        while bits != 0 {
            let n = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            self.counters[n] -= 1;
            if self.counters[n] == 0 {
                completed |= 1 << n;
            }
        }
        Condition(completed)
    }

    /// Marks a condition as provided without a task backing it, so that
    /// `meets` will wait for an explicit signal.
    pub fn block_on(&mut self, cond: Condition) {
        self.provided = self.provided | cond;
    }

    pub fn meets(&self, mut needs: Condition) -> bool {
        if self.state != SchedState::Ready {
            // Conditions not provided by any task of this node qualify
            // automatically.
            needs = needs & self.provided;
        }
        self.completed.meets(needs)
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

impl OpContext {
    pub(crate) fn task(&self, t: TaskId) -> &Task {
        &self.tasks[t.index()]
    }

    pub(crate) fn task_mut(&mut self, t: TaskId) -> &mut Task {
        &mut self.tasks[t.index()]
    }

    /// Schedules a task on the owner vertex's scheduler.
    pub(crate) fn insert_task(
        &mut self,
        owner: VertexId,
        runner: RunnerKind,
        env: Env,
        x: Elem,
        ci: CloseInfo,
        extras: TaskExtras,
    ) -> TaskId {
        let completes = runner.completes();
        let needs = runner.needs();
        let pos = match &x {
            Elem::Expr(e) => e.src,
            Elem::Value(_) => Pos::NONE,
        };

        let tid = TaskId(self.tasks.len() as u32);
        self.tasks.push(Task {
            state: TaskState::Ready,
            runner,
            node: owner,
            env,
            x,
            ci: ci.clone(),
            pos,
            aux: extras.aux,
            arc_flag: extras.arc_flag,
            pending_arcs: extras.pending_arcs,
            completes,
            defunct: false,
            unblocked: false,
            blocked_on: None,
            block_condition: NEVER_KNOWN,
            err: None,
        });

        let state = self.state_of(owner).expect("scheduling on vertex without state");
        let finalizing = {
            let mut n = state.borrow_mut();
            n.sched.needs = n.sched.needs | needs;
            n.sched.provided = n.sched.provided | completes;
            if n.sched.state == SchedState::Finalizing {
                true
            } else {
                n.sched.increment_counts(completes);
                n.sched.tasks.push(tid);
                false
            }
        };
        if let Some(cc) = ci.cc {
            self.inc_dependent(cc, DepKind::Task);
        }
        if finalizing {
            self.run_task(tid, RunMode::Finalize);
        }
        tid
    }

    /// Runs a task. A task that parks itself stays Waiting and is re-run
    /// when its condition is signalled; otherwise its completion counters
    /// are decremented exactly once.
    pub(crate) fn run_task(&mut self, tid: TaskId, mode: RunMode) {
        {
            let t = self.task_mut(tid);
            if t.defunct {
                if t.state != TaskState::Cancelled {
                    t.state = TaskState::Cancelled;
                    let cc = t.ci.cc;
                    let completes = t.completes;
                    t.completes = NONE;
                    if let Some(cc) = cc {
                        self.dec_dependent(cc, DepKind::Task);
                    }
                    let owner = self.task(tid).node;
                    self.finish_counts(owner, completes);
                }
                return;
            }
            match t.state {
                TaskState::Success | TaskState::Failed | TaskState::Cancelled => return,
                TaskState::Running => return,
                _ => {}
            }
            t.state = TaskState::Running;
            t.err = None;
        }

        let owner = self.task(tid).node;
        let pos = self.task(tid).pos;
        log::trace!(
            "run task {} {:?} on {}",
            self.task(tid).runner.name(),
            tid,
            self.debug_name(owner)
        );

        self.task_stack.push(tid);
        self.push_arc(owner);
        self.push_pos(pos);
        let saved_errs = self.errs.take();
        self.suspended = false;

        let runner = self.task(tid).runner;
        match runner {
            RunnerKind::EvalConjunct => crate::eval::run_conjunct_task(self, tid, mode),
            RunnerKind::ProcessDynamic => crate::insert::run_dynamic_task(self, tid, mode),
            RunnerKind::ProcessPattern => crate::insert::run_pattern_task(self, tid, mode),
            RunnerKind::ProcessComprehension => {
                crate::comprehension::run_comprehension_task(self, tid, mode)
            }
            RunnerKind::ProcessList => crate::insert::run_list_task(self, tid, mode),
        }

        let parked = self.suspended;
        self.suspended = false;

        if parked && mode != RunMode::Finalize {
            // The task is registered on the scheduler it blocked on.
            let t = self.task_mut(tid);
            if t.state == TaskState::Running {
                t.state = TaskState::Waiting;
            }
        } else {
            let task_err = self.task_mut(tid).err.take();
            let run_err = self.errs.take();
            let err = error::combine(task_err, run_err);
            // A force-unblocked task can no longer be resolved by new
            // information: its incomplete errors are permanent.
            let err = match err {
                Some(e) if self.task(tid).unblocked && e.is_incomplete() => {
                    let mut p = (*e).clone();
                    p.permanent = true;
                    Some(Rc::new(p))
                }
                other => other,
            };
            {
                let t = self.task_mut(tid);
                t.blocked_on = None;
                t.block_condition = NEVER_KNOWN;
                t.state = if err.is_none() {
                    TaskState::Success
                } else {
                    TaskState::Failed
                };
                t.err = err.clone();
            }
            if let Some(e) = err {
                self.node_add_err(owner, e);
            }
            let (cc, completes) = {
                let t = self.task_mut(tid);
                let completes = t.completes;
                t.completes = NONE;
                (t.ci.cc, completes)
            };
            if let Some(cc) = cc {
                self.dec_dependent(cc, DepKind::Task);
            }
            self.finish_counts(owner, completes);
        }

        self.errs = saved_errs;
        self.pop_pos();
        self.pop_arc();
        self.task_stack.pop();
    }

    /// Records an error on the workspace of a vertex.
    pub(crate) fn node_add_err(&mut self, v: VertexId, b: Rc<crate::error::Bottom>) {
        if let Some(state) = self.state_of(v) {
            let mut n = state.borrow_mut();
            n.errs = error::combine(n.errs.take(), Some(b));
        } else {
            let vx = self.vertex_mut(v);
            let combined = error::combine(
                vx.base_value.as_ref().and_then(|x| x.bottom().cloned()),
                Some(b),
            );
            if let Some(e) = combined {
                vx.base_value = Some(crate::value::Value::Bottom(e));
            }
        }
    }

    /// Decrements completion counters and signals any conditions that
    /// became met.
    pub(crate) fn finish_counts(&mut self, v: VertexId, completes: Condition) {
        let Some(state) = self.state_of(v) else { return };
        let newly = state.borrow_mut().sched.decrement_counts(completes);
        if !newly.is_none() {
            self.signal(v, newly);
        }
    }

    pub(crate) fn sched_meets(&self, v: VertexId, needs: Condition) -> bool {
        match self.state_of(v) {
            Some(state) => state.borrow().sched.meets(needs),
            None => true,
        }
    }

    /// Signals completed conditions on a vertex and re-runs any tasks
    /// blocked on them.
    pub(crate) fn signal(&mut self, v: VertexId, completed: Condition) {
        if completed.is_none() {
            return;
        }
        let Some(state) = self.state_of(v) else { return };
        {
            let mut n = state.borrow_mut();
            let was = n.sched.completed;
            n.sched.completed = was | completed;
            if was == n.sched.completed {
                n.sched.frozen = n.sched.frozen | completed;
                return;
            }
        }
        let derived = self.state_completions(v);
        {
            let mut n = state.borrow_mut();
            n.sched.completed = n.sched.completed | derived;
            n.sched.frozen = n.sched.frozen | completed;
        }

        let now = state.borrow().sched.completed;
        let runnable: Vec<TaskId> = {
            let n = state.borrow();
            n.sched
                .blocking
                .iter()
                .copied()
                .filter(|&t| {
                    let task = self.task(t);
                    task.blocked_on.is_some() && now.meets(task.block_condition)
                })
                .collect()
        };
        for t in runnable {
            {
                let task = self.task_mut(t);
                task.block_condition = NEVER_KNOWN;
                task.blocked_on = None;
                task.state = TaskState::Ready;
            }
            self.run_task(t, RunMode::AttemptOnly);
        }
    }

    /// Marks conditions as frozen and completed: no tasks satisfying them
    /// may be added anymore, and the node may not become more specific in
    /// these dimensions.
    pub(crate) fn freeze(&mut self, v: VertexId, cond: Condition) {
        let Some(state) = self.state_of(v) else { return };
        {
            let mut n = state.borrow_mut();
            n.sched.frozen = n.sched.frozen | cond;
            n.sched.completed = n.sched.completed | cond;
        }
        let derived = self.state_completions(v);
        let mut n = state.borrow_mut();
        n.sched.completed = n.sched.completed | derived;
    }

    /// Recomputes conditions that follow from other completed conditions.
    pub(crate) fn state_completions(&mut self, v: VertexId) -> Condition {
        let Some(state) = self.state_of(v) else { return NONE };
        let (mut x, provided, arc_counter_zero) = {
            let n = state.borrow();
            (
                n.sched.completed,
                n.sched.provided,
                n.sched.counters[ARC_TYPE_KNOWN.0.trailing_zeros() as usize] == 0,
            )
        };
        log::trace!("state completions {}: {:?}", self.debug_name(v), x);

        if x.meets(ALL_ANCESTORS_PROCESSED) {
            x = x | COUNTER_MASK.without(provided);
            // A pending arc may still become a member through one of its own
            // sub arcs; only conclude the arc type once subfields are done.
            if arc_counter_zero && x.meets(SUB_FIELDS_PROCESSED) {
                x = x | ARC_TYPE_KNOWN;
            }
        }

        let arc_type = self.vertex(v).arc_type;
        match arc_type {
            ArcType::Member | ArcType::NotPresent => x = x | ARC_TYPE_KNOWN,
            ArcType::Pending if x.meets(ARC_TYPE_KNOWN) => {
                self.vertex_mut(v).arc_type = ArcType::NotPresent;
            }
            _ => {}
        }

        if x.meets(VALUE_KNOWN) {
            if matches!(arc_type, ArcType::Member | ArcType::NotPresent) {
                x = x | SCALAR_KNOWN;
            }
            x = x | LIST_TYPE_KNOWN;
        }

        if x.meets(NEED_FIELD_CONJUNCTS_KNOWN | NEED_TASKS_DONE) {
            if x.meets(SUB_FIELDS_PROCESSED) {
                x = x | FIELD_SET_KNOWN;
            } else {
                let has_pending = self
                    .vertex(v)
                    .arcs
                    .iter()
                    .any(|&a| self.vertex(a).arc_type == ArcType::Pending);
                if !has_pending {
                    x = x | FIELD_SET_KNOWN;
                }
            }
        }
        x
    }

    /// Blocks a task until the needed conditions of vertex `v` are met.
    pub(crate) fn wait_for(&mut self, tid: TaskId, v: VertexId, needs: Condition) {
        if self.sched_meets(v, needs) {
            return;
        }
        if let Some(state) = self.state_of(v) {
            let mut n = state.borrow_mut();
            n.sched.needs = n.sched.needs | needs;
            n.sched.blocking.push(tid);
        }
        let t = self.task_mut(tid);
        t.state = TaskState::Waiting;
        t.block_condition = needs;
        t.blocked_on = Some(v);
        self.blocking.push(tid);
    }

    /// Advances the scheduler of `v` by running queued tasks until the
    /// needed conditions are met, the caller is blocked, or, at finalize,
    /// unmet conditions are forced.
    pub(crate) fn process(&mut self, v: VertexId, needs: Condition, mode: RunMode) -> bool {
        if mode == RunMode::Ignore {
            return false;
        }
        let derived = self.state_completions(v);
        self.signal(v, derived);

        let Some(state) = self.state_of(v) else { return true };
        state.borrow_mut().sched.state = SchedState::Running;

        self.drain_tasks(v, mode);

        match mode {
            RunMode::Ignore | RunMode::AttemptOnly => self.sched_meets(v, needs),
            RunMode::Yield => {
                if self.sched_meets(v, needs) {
                    return true;
                }
                if let Some(cur) = self.current_task() {
                    self.wait_for(cur, v, needs);
                    self.suspended = true;
                }
                false
            }
            RunMode::Finalize => {
                self.unblock_tasks(v);
                true
            }
        }
    }

    fn drain_tasks(&mut self, v: VertexId, mode: RunMode) {
        loop {
            let next = {
                let Some(state) = self.state_of(v) else { return };
                let mut n = state.borrow_mut();
                if n.sched.task_pos < n.sched.tasks.len() {
                    let t = n.sched.tasks[n.sched.task_pos];
                    n.sched.task_pos += 1;
                    Some(t)
                } else {
                    None
                }
            };
            match next {
                Some(t) => {
                    if self.task(t).state == TaskState::Ready {
                        self.run_task(t, mode);
                    }
                }
                None => return,
            }
        }
    }

    /// Forces all outstanding blocked work to a deterministic conclusion,
    /// in two phases: first release the conditions that are safe once a
    /// value can no longer become more specific, then freeze the remaining
    /// conditions before running everything else. Freezing first ensures
    /// the same errors regardless of unblocking order.
    fn unblock_tasks(&mut self, v: VertexId) {
        let mut rounds = 0;
        loop {
            self.drain_tasks(v, RunMode::Finalize);

            let blocked: Vec<TaskId> = self
                .blocking
                .iter()
                .copied()
                .filter(|&t| {
                    let task = self.task(t);
                    task.blocked_on.is_some() && !task.defunct
                })
                .collect();
            if blocked.is_empty() {
                break;
            }

            for &t in &blocked {
                if let Some(b) = self.task(t).blocked_on {
                    self.signal(b, AUTO_UNBLOCK);
                }
            }

            for &t in &blocked {
                if let Some(b) = self.task(t).blocked_on {
                    let cond = self.task(t).block_condition;
                    self.freeze(b, cond);
                    self.task_mut(t).unblocked = true;
                }
            }

            for &t in &blocked {
                let Some(b) = self.task(t).blocked_on else { continue };
                if self.task(t).defunct {
                    continue;
                }
                let cond = self.task(t).block_condition;
                {
                    let task = self.task_mut(t);
                    task.blocked_on = None;
                    task.block_condition = NEVER_KNOWN;
                    task.state = TaskState::Ready;
                }
                self.signal(b, cond);
                self.run_task(t, RunMode::AttemptOnly);
            }

            rounds += 1;
            debug_assert!(rounds < 10_000, "unblocking failed to converge");
            if rounds >= 10_000 {
                break;
            }
        }
        self.blocking.clear();
    }

    /// Signals that no more tasks will be added, unblocking tasks that
    /// depend on states for which there are no providers here. Conditions
    /// derived from others (field set, subfields, ancestors) are excluded;
    /// they complete through `state_completions`.
    pub(crate) fn signal_done_adding(&mut self, v: VertexId) {
        let Some(state) = self.state_of(v) else { return };
        let missing = {
            let n = state.borrow();
            n.sched.needs.without(n.sched.provided).without(
                FIELD_SET_KNOWN | SUB_FIELDS_PROCESSED | ALL_ANCESTORS_PROCESSED,
            )
        };
        self.signal(v, missing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_algebra() {
        let c = SCALAR_KNOWN | VALUE_KNOWN;
        assert!(c.meets(SCALAR_KNOWN));
        assert!(!c.meets(FIELD_SET_KNOWN));
        assert!(c.meets(NONE));
        assert_eq!(c.without(SCALAR_KNOWN), VALUE_KNOWN);
        assert!(GENERIC_CONJUNCT.meets(SCALAR_CONJUNCT.without(ALL_TASKS_COMPLETED)));
    }

    #[test]
    fn counters_complete_at_zero() {
        let mut s = Scheduler::new();
        s.increment_counts(GENERIC_CONJUNCT);
        s.increment_counts(FIELD_CONJUNCT);
        // Signals are not counted.
        assert_eq!(s.counters[SCALAR_KNOWN.0.trailing_zeros() as usize], 0);

        let done = s.decrement_counts(GENERIC_CONJUNCT);
        // fieldConjunctsKnown and allTasksCompleted still have one
        // contributor outstanding.
        assert!(done.meets(VALUE_KNOWN));
        assert!(!done.meets(FIELD_CONJUNCTS_KNOWN));
        assert!(!done.meets(ALL_TASKS_COMPLETED));

        let done = s.decrement_counts(FIELD_CONJUNCT);
        assert!(done.meets(FIELD_CONJUNCTS_KNOWN));
        assert!(done.meets(ALL_TASKS_COMPLETED));
    }

    #[test]
    fn meets_qualifies_unprovided_conditions() {
        let mut s = Scheduler::new();
        s.state = SchedState::Running;
        s.provided = VALUE_KNOWN;
        s.completed = VALUE_KNOWN;
        // scalarKnown has no providers on this node, so it qualifies.
        assert!(s.meets(VALUE_KNOWN | SCALAR_KNOWN));

        s.state = SchedState::Ready;
        assert!(!s.meets(VALUE_KNOWN | SCALAR_KNOWN));
    }
}
