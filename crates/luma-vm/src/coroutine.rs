//! Coroutines: thread creation, resume and yield.
//!
//! Only one thread runs at a time. Its register stack, frames and open
//! upvalues live in the `Vm`; a resume swaps the resumer's state out into its
//! `LuaThread` record and the coroutine's state in, and the reverse happens
//! when the coroutine yields, returns or fails.

use crate::call::{PreCall, MIN_STACK};
use crate::callinfo::MULTRET;
use crate::dispatch;
use crate::error::LuaError;
use crate::heap::{LuaThread, ThreadStatus, TValueExt};
use crate::vm::Vm;
use luma_core::gc::GcIdx;
use luma_core::value::TValue;
use log::{debug, trace};
use std::mem;

impl Vm {
    /// Create a suspended coroutine that will run `f`.
    pub fn new_thread(&mut self, f: TValue) -> Result<TValue, LuaError> {
        let mut stack = vec![TValue::nil(); self.config.initial_stack.max(MIN_STACK)];
        stack[0] = f;
        let th = self
            .gc
            .alloc_thread(LuaThread::new(stack, 1, ThreadStatus::Fresh))?;
        debug!("created thread {}", th.0);
        Ok(TValue::from_thread(th))
    }

    /// Status name of a thread value: "suspended", "running", "normal" or "dead".
    pub fn thread_status(&self, thread: TValue) -> Option<&'static str> {
        let th = thread.as_thread_idx()?;
        self.gc.threads.get(th).map(|t| t.status.name())
    }

    /// The running thread, and whether it is the main thread.
    pub fn running_thread(&self) -> (TValue, bool) {
        (
            TValue::from_thread(self.current_thread),
            self.current_thread == self.main_thread,
        )
    }

    /// True when a yield from the current point would reach a `resume`.
    pub fn can_yield(&self) -> bool {
        self.current_thread != self.main_thread && self.n_ccalls == self.base_ccalls
    }

    /// Yield the top `n` values of the running native's stack window to the
    /// resumer. Natives return this result directly.
    pub fn yield_values(&mut self, n: usize) -> Result<usize, LuaError> {
        if self.current_thread == self.main_thread {
            return Err(self.runtime_error("attempt to yield from outside a coroutine"));
        }
        if self.n_ccalls != self.base_ccalls {
            return Err(self.runtime_error("attempt to yield across a C-call boundary"));
        }
        trace!("thread {} yields {n} values", self.current_thread.0);
        Err(LuaError::Yield(n))
    }

    /// Resume `thread` with `args`. Returns the yielded or returned values,
    /// or the error object; a thread that fails or returns is dead.
    pub fn resume(&mut self, thread: TValue, args: &[TValue]) -> Result<Vec<TValue>, TValue> {
        let Some(th) = thread.as_thread_idx() else {
            return Err(self.intern(b"cannot resume non-thread value"));
        };
        match self.gc.thread(th).status {
            ThreadStatus::Dead => return Err(self.intern(b"cannot resume dead coroutine")),
            ThreadStatus::Running | ThreadStatus::Normal => {
                return Err(self.intern(b"cannot resume non-suspended coroutine"))
            }
            ThreadStatus::Fresh | ThreadStatus::Suspended => {}
        }
        if self.n_ccalls >= self.config.max_ccalls {
            return Err(self.intern(b"C stack overflow"));
        }

        let prev = self.current_thread;
        let entry_ccalls = self.n_ccalls;
        let saved_base_ccalls = self.base_ccalls;
        let saved_api_base = self.api_base;
        self.swap_out(prev, ThreadStatus::Normal);
        let start_status = self.swap_in(th);
        self.n_ccalls += 1;
        self.base_ccalls = self.n_ccalls;
        self.api_base = 0;
        trace!("resume thread {} with {} values", th.0, args.len());

        let outcome = self.run_thread(start_status, args);
        let (status, result) = match outcome {
            Ok(()) => {
                let values = self.stack[..self.stack_top].to_vec();
                self.close_upvalues(0);
                (ThreadStatus::Dead, Ok(values))
            }
            Err(LuaError::Yield(n)) => {
                let top = self.stack_top;
                let n = n.min(top);
                let values = self.stack[top - n..top].to_vec();
                self.stack_top = top - n;
                (ThreadStatus::Suspended, Ok(values))
            }
            Err(e) => {
                self.close_upvalues(0);
                let value = e.into_value(self);
                (ThreadStatus::Dead, Err(value))
            }
        };

        self.n_ccalls = entry_ccalls;
        self.base_ccalls = saved_base_ccalls;
        self.api_base = saved_api_base;
        self.swap_out(th, status);
        if status == ThreadStatus::Dead {
            let record = self.gc.thread_mut(th);
            record.stack = Vec::new();
            record.call_stack = Vec::new();
            record.stack_top = 0;
        }
        self.swap_in(prev);
        trace!("thread {} is {}", th.0, status.name());
        result
    }

    /// Start or continue the swapped-in thread.
    fn run_thread(&mut self, start_status: ThreadStatus, args: &[TValue]) -> Result<(), LuaError> {
        if start_status == ThreadStatus::Fresh {
            for &a in args {
                self.push_value(a);
            }
            return match self.precall(0, MULTRET)? {
                PreCall::Lua => dispatch::execute(self, 0),
                PreCall::Native => Ok(()),
            };
        }

        let native_on_top = matches!(self.call_stack.last(), Some(ci) if !ci.is_lua());
        if native_on_top {
            // The native that yielded returns the resume arguments.
            let first = self.stack_top;
            for &a in args {
                self.push_value(a);
            }
            let wanted = self.poscall(first);
            let Some(ci) = self.call_stack.last() else {
                return Ok(());
            };
            if wanted != MULTRET {
                self.stack_top = ci.top;
            }
        }
        if self.call_stack.is_empty() {
            return Ok(());
        }
        dispatch::execute(self, 0)
    }

    fn swap_out(&mut self, th: GcIdx<LuaThread>, status: ThreadStatus) {
        let record = self.gc.thread_mut(th);
        record.stack = mem::take(&mut self.stack);
        record.call_stack = mem::take(&mut self.call_stack);
        record.open_upvals = mem::take(&mut self.open_upvals);
        record.stack_top = self.stack_top;
        record.status = status;
    }

    /// Make `th` the running thread. Returns its status before the switch.
    fn swap_in(&mut self, th: GcIdx<LuaThread>) -> ThreadStatus {
        let record = self.gc.thread_mut(th);
        self.stack = mem::take(&mut record.stack);
        self.call_stack = mem::take(&mut record.call_stack);
        self.open_upvals = mem::take(&mut record.open_upvals);
        self.stack_top = record.stack_top;
        let previous = record.status;
        record.status = ThreadStatus::Running;
        self.current_thread = th;
        previous
    }
}
