use std::rc::Rc;

use fl_core::{ArrayRuntime, AsyncFlagSet, Context, DType, SyncedArray};
use fl_lms::{LmsError, SwapInOutScheduler};

fn host() -> Context {
    Context::new("CpuArray", "0")
}

fn device() -> Context {
    Context::new("CudaArray", "0")
}

fn scheduler(runtime: &Rc<ArrayRuntime>, bytes: usize) -> SwapInOutScheduler {
    SwapInOutScheduler::new(Rc::clone(runtime), host(), device(), bytes)
}

fn run_training_iteration(
    scheduler: &SwapInOutScheduler,
    functions: &[&dyn Fn()],
    update: &dyn Fn(),
) -> Result<(), LmsError> {
    scheduler.start_scheduling();
    for body in functions {
        scheduler.pre_function_callback()?;
        body();
    }
    scheduler.pre_update_callback()?;
    update();
    scheduler.end_scheduling()
}

fn write_on_device(array: &SyncedArray, values: &[f64]) {
    array
        .cast(DType::F32, &device(), true, AsyncFlagSet::empty())
        .expect("cast for write");
    array.store(values).expect("store");
}

#[test]
fn minimal_swap_preclears_the_final_use() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 80);
    let x = runtime.new_array(10, DType::F32);

    let f0 = || write_on_device(&x, &[1.0; 10]);
    let f1 = || {
        x.get(DType::F32, &device(), AsyncFlagSet::empty())
            .expect("get x");
        x.clear().expect("clear x");
    };

    s.start_scheduling();
    s.pre_function_callback().expect("pre f0");
    f0();
    s.pre_function_callback().expect("pre f1");
    f1();
    s.end_scheduling().expect("end first iteration");

    let report = s.schedule_report().expect("scheduled");
    assert_eq!(report.max_bytes_swap_in, 80);
    assert_eq!(report.max_bytes_swap_out, 40);
    assert_eq!(report.function_count, 2);
    assert_eq!(report.functions[0].swap_in_count, 1);
    assert_eq!(report.functions[0].prefetch_bytes, 40);
    assert_eq!(report.functions[1].swap_out_count, 0);
    assert_eq!(report.preclear_count, 1);

    s.start_scheduling();
    s.pre_function_callback().expect("pre f0, traced");
    f0();
    s.pre_function_callback().expect("pre f1, traced");
    f1();
    s.end_scheduling().expect("end traced iteration");
    assert_eq!(x.get_num_arrays(), 0);
    assert_eq!(s.iteration_count(), 2);
}

#[test]
fn prefetch_replans_an_array_across_its_eviction() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 80);
    let a = runtime.new_array(10, DType::F32);
    let b = runtime.new_array(10, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    let bodies: [&dyn Fn(); 3] = [
        &|| write_on_device(&a, &[1.0; 10]),
        &|| write_on_device(&b, &[2.0; 10]),
        &|| {
            a.get(DType::F32, &device(), AsyncFlagSet::empty())
                .expect("get a");
        },
    ];
    let update = || write_on_device(&w, &[0.5; 2]);

    s.start_scheduling();
    for body in &bodies {
        s.pre_function_callback().expect("pre");
        body();
        assert!(s.used_bytes_swap_out() <= s.max_bytes_swap_out());
    }
    s.pre_update_callback().expect("pre update");
    update();
    s.end_scheduling().expect("end first iteration");

    let report = s.schedule_report().expect("scheduled");
    assert_eq!(report.function_count, 4);
    let swap_ins: Vec<usize> = report.functions.iter().map(|f| f.swap_in_count).collect();
    let swap_outs: Vec<usize> = report.functions.iter().map(|f| f.swap_out_count).collect();
    let waits: Vec<usize> = report.functions.iter().map(|f| f.wait_count).collect();
    assert_eq!(swap_ins, vec![1, 1, 1, 0]);
    assert_eq!(swap_outs, vec![1, 1, 1, 0]);
    assert_eq!(waits, vec![0, 1, 1, 0]);

    // Traced replay: a comes back to the device before its reuse.
    s.start_scheduling();
    s.pre_function_callback().expect("pre f0");
    bodies[0]();
    s.pre_function_callback().expect("pre f1");
    bodies[1]();
    s.pre_function_callback().expect("pre f2");
    assert!(a.is_materialized_on(&device()), "a must be prefetched");
    bodies[2]();
    s.pre_update_callback().expect("pre update");
    update();
    s.end_scheduling().expect("end traced iteration");
}

#[test]
fn cancelled_eviction_keeps_the_array_resident() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 100);
    let a = runtime.new_array(10, DType::F32);
    let b = runtime.new_array(1, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    let bodies: [&dyn Fn(); 3] = [
        &|| write_on_device(&a, &[1.0; 10]),
        &|| write_on_device(&b, &[2.0]),
        &|| {
            a.get(DType::F32, &device(), AsyncFlagSet::empty())
                .expect("get a");
        },
    ];
    let update = || write_on_device(&w, &[0.5; 2]);

    run_training_iteration(&s, &bodies, &update).expect("first iteration");

    // The eviction of a after f0 is cancelled by its prefetch for f2, so
    // a never leaves the device during the traced replay.
    s.start_scheduling();
    s.pre_function_callback().expect("pre f0");
    bodies[0]();
    s.pre_function_callback().expect("pre f1");
    assert_eq!(a.head_array_class().as_deref(), Some("CudaArray"));
    bodies[1]();
    s.pre_function_callback().expect("pre f2");
    assert_eq!(a.head_array_class().as_deref(), Some("CudaArray"));
    bodies[2]();
    s.pre_update_callback().expect("pre update");
    update();
    s.end_scheduling().expect("end traced iteration");
}

#[test]
fn working_set_beyond_budget_is_out_of_memory() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 80);
    let arrays: Vec<_> = (0..3).map(|_| runtime.new_array(10, DType::F32)).collect();

    let err = run_training_iteration(
        &s,
        &[&|| {
            for a in &arrays {
                write_on_device(a, &[1.0; 10]);
            }
        }],
        &|| {},
    )
    .expect_err("three 40-byte arrays in one function cannot be scheduled");
    assert!(matches!(err, LmsError::OutOfDeviceMemory { .. }));
}

#[test]
fn replaced_handle_is_substituted_across_the_whole_trace() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 1 << 20);
    let a = runtime.new_array(8, DType::F32);
    let a2 = runtime.new_array(8, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    run_training_iteration(
        &s,
        &[&|| write_on_device(&a, &[1.0; 8])],
        &|| write_on_device(&w, &[0.5; 2]),
    )
    .expect("first iteration");

    // Same slot, same dtype and context, different identity.
    s.start_scheduling();
    s.pre_function_callback().expect("pre f0");
    write_on_device(&a2, &[3.0; 8]);
    s.pre_update_callback().expect("pre update");
    write_on_device(&w, &[0.5; 2]);
    s.end_scheduling().expect("end traced iteration");

    let traced = s.traced_instance_ids();
    assert_eq!(traced[0], Some(a2.instance_id()));
    // The executor's eviction followed the substitution.
    assert_eq!(a2.head_array_class().as_deref(), Some("CpuArray"));
}

#[test]
fn clear_only_block_plans_nothing() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 1 << 20);
    let a = runtime.new_array(10, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    let bodies: [&dyn Fn(); 2] = [
        &|| write_on_device(&a, &[1.0; 10]),
        &|| a.clear().expect("clear a"),
    ];
    let update = || write_on_device(&w, &[0.5; 2]);

    s.start_scheduling();
    for body in &bodies {
        s.pre_function_callback().expect("pre");
        body();
    }
    s.pre_update_callback().expect("pre update");
    update();
    s.end_scheduling().expect("end first iteration");

    let report = s.schedule_report().expect("scheduled");
    assert_eq!(report.functions[1].swap_in_count, 0);
    assert_eq!(report.functions[1].swap_out_count, 0);
    assert_eq!(report.functions[1].wait_count, 0);
    assert_eq!(report.preclear_count, 1);

    // The traced clear consumes the executed preclear without diverging.
    s.start_scheduling();
    for body in &bodies {
        s.pre_function_callback().expect("pre, traced");
        body();
    }
    s.pre_update_callback().expect("pre update, traced");
    update();
    s.end_scheduling().expect("end traced iteration");
}

#[test]
fn double_buffered_input_is_repointed_each_iteration() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 1 << 20);
    let x0 = runtime.new_array(4, DType::F32);
    let t0 = runtime.new_array(4, DType::F32);
    let x1 = runtime.new_array(4, DType::F32);
    let t1 = runtime.new_array(4, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    let pairs = [[x0.clone(), t0.clone()], [x1.clone(), t1.clone()]];

    for iteration in 0..3usize {
        let pair = &pairs[iteration % 2];
        s.use_dali(std::slice::from_ref(pair)).expect("use_dali");
        run_training_iteration(
            &s,
            &[&|| {
                pair[0]
                    .cast(DType::F32, &device(), true, AsyncFlagSet::empty())
                    .expect("cast x");
                pair[1]
                    .cast(DType::F32, &device(), true, AsyncFlagSet::empty())
                    .expect("cast t");
            }],
            &|| write_on_device(&w, &[0.5; 2]),
        )
        .expect("iteration");

        if iteration >= 1 {
            let traced = s.traced_instance_ids();
            assert_eq!(traced[0], Some(pair[0].instance_id()), "x slot, iteration {iteration}");
            assert_eq!(traced[1], Some(pair[1].instance_id()), "t slot, iteration {iteration}");
        }
    }
}

#[test]
fn double_buffering_rejects_bad_input() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 1 << 20);
    let x = runtime.new_array(4, DType::F32);
    let t = runtime.new_array(4, DType::F32);

    assert_eq!(s.use_dali(&[]), Err(LmsError::EmptyDoubleBuffer));
    let pair = [x.clone(), t.clone()];
    assert_eq!(
        s.use_dali(&[pair.clone(), pair]),
        Err(LmsError::MultiDeviceDoubleBuffer { batches: 2 })
    );
}

#[test]
fn expired_double_buffer_is_reported() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 1 << 20);
    let w = runtime.new_array(2, DType::F32);
    {
        let x0 = runtime.new_array(4, DType::F32);
        let t0 = runtime.new_array(4, DType::F32);
        s.use_dali(&[[x0.clone(), t0.clone()]]).expect("use_dali");
        run_training_iteration(
            &s,
            &[&|| {
                x0.cast(DType::F32, &device(), true, AsyncFlagSet::empty())
                    .expect("cast x0");
                t0.cast(DType::F32, &device(), true, AsyncFlagSet::empty())
                    .expect("cast t0");
            }],
            &|| write_on_device(&w, &[0.5; 2]),
        )
        .expect("first iteration");
        // x0 and t0 drop here.
    }
    let x1 = runtime.new_array(4, DType::F32);
    let t1 = runtime.new_array(4, DType::F32);
    assert_eq!(
        s.use_dali(&[[x1, t1]]),
        Err(LmsError::ExpiredDoubleBuffer)
    );
}

#[test]
fn traced_iterations_compute_the_same_values_as_unscheduled_ones() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 128);
    let x = runtime.new_array(8, DType::F32);
    let y = runtime.new_array(8, DType::F32);
    let w = runtime.new_array(2, DType::F32);

    for iteration in 0..3usize {
        let input = iteration as f64;
        run_training_iteration(
            &s,
            &[
                &|| write_on_device(&x, &[input; 8]),
                &|| {
                    x.get(DType::F32, &device(), AsyncFlagSet::empty())
                        .expect("get x");
                    let incremented: Vec<f64> = x.values().iter().map(|v| v + 1.0).collect();
                    write_on_device(&y, &incremented);
                },
            ],
            &|| write_on_device(&w, &[0.5; 2]),
        )
        .expect("scheduled iteration");

        // Reference execution without any scheduler.
        let reference = ArrayRuntime::new();
        let rx = reference.new_array(8, DType::F32);
        let ry = reference.new_array(8, DType::F32);
        rx.cast(DType::F32, &device(), true, AsyncFlagSet::empty())
            .expect("cast rx");
        rx.store(&[input; 8]).expect("store rx");
        let incremented: Vec<f64> = rx.values().iter().map(|v| v + 1.0).collect();
        ry.cast(DType::F32, &device(), true, AsyncFlagSet::empty())
            .expect("cast ry");
        ry.store(&incremented).expect("store ry");

        assert_eq!(y.values(), ry.values(), "iteration {iteration}");
    }
    assert_eq!(s.iteration_count(), 3);
}

#[test]
fn pending_evictions_are_drained_by_the_end_of_each_iteration() {
    let runtime = ArrayRuntime::new();
    let s = scheduler(&runtime, 160);
    let arrays: Vec<_> = (0..4).map(|_| runtime.new_array(10, DType::F32)).collect();

    for _ in 0..2 {
        s.start_scheduling();
        for a in &arrays {
            s.pre_function_callback().expect("pre");
            write_on_device(a, &[1.0; 10]);
        }
        s.pre_update_callback().expect("pre update");
        s.end_scheduling().expect("end");
        assert_eq!(runtime.pending_transfers(), 0, "device must be synchronized");
    }
}
