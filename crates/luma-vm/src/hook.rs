//! Instruction-count hook.

use crate::error::LuaError;
use crate::vm::Vm;
use log::{trace, warn};

/// What the interpreter does after a hook callback returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Suspend the running coroutine; it resumes at the same instruction.
    /// Ignored (with a warning) where a yield is not allowed.
    Yield,
    /// Raise a runtime error with this message.
    Abort(String),
}

/// Host callback run every `count` instructions.
pub type HookFn = Box<dyn FnMut(&mut Vm) -> HookAction>;

pub(crate) struct CountHook {
    count: u32,
    remaining: u32,
    /// Taken out while the callback runs, so it never nests.
    callback: Option<HookFn>,
}

impl Vm {
    /// Run `f` every `count` instructions. A count of 0 removes the hook.
    pub fn set_count_hook(&mut self, count: u32, f: HookFn) {
        if count == 0 {
            self.hook = None;
            return;
        }
        self.hook = Some(CountHook {
            count,
            remaining: count,
            callback: Some(f),
        });
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }
}

/// Count one instruction; fire the callback when the count runs out.
pub(crate) fn count_tick(vm: &mut Vm) -> Result<(), LuaError> {
    let Some(hook) = vm.hook.as_mut() else {
        return Ok(());
    };
    hook.remaining -= 1;
    if hook.remaining > 0 {
        return Ok(());
    }
    hook.remaining = hook.count;
    let Some(mut callback) = hook.callback.take() else {
        return Ok(());
    };

    let saved_top = vm.stack_top;
    let saved_api_base = vm.api_base;
    vm.api_base = vm.stack_top;
    let action = callback(vm);
    vm.stack_top = saved_top;
    vm.api_base = saved_api_base;

    // Reinstall unless the callback replaced or removed the hook.
    if let Some(hook) = vm.hook.as_mut() {
        if hook.callback.is_none() {
            hook.callback = Some(callback);
        }
    }

    match action {
        HookAction::Continue => Ok(()),
        HookAction::Abort(msg) => Err(vm.runtime_error(&msg)),
        HookAction::Yield => {
            if vm.can_yield() {
                trace!("count hook yields thread {}", vm.current_thread.0);
                Err(LuaError::Yield(0))
            } else {
                warn!("count hook asked to yield where no yield is possible; continuing");
                Ok(())
            }
        }
    }
}
