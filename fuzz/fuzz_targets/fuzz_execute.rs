#![no_main]

use libfuzzer_sys::fuzz_target;
use luma_vm::{HookAction, Vm, VmConfig};

fuzz_target!(|data: &[u8]| {
    // Any chunk that passes the verifier must run without panicking.
    let config = VmConfig::default()
        .max_call_depth(200)
        .max_heap_objects(Some(10_000));
    let mut vm = Vm::with_config(config);
    if luma_stdlib::open_libs(&mut vm).is_err() {
        return;
    }
    vm.set_output(Box::new(std::io::sink()));
    let mut budget = 100u32;
    vm.set_count_hook(
        1000,
        Box::new(move |_: &mut Vm| {
            budget = budget.saturating_sub(1);
            if budget == 0 {
                HookAction::Abort("instruction budget exhausted".into())
            } else {
                HookAction::Continue
            }
        }),
    );
    if let Ok(f) = vm.load(data, "=fuzz") {
        let _ = vm.call_value(f, &[]);
    }
});
