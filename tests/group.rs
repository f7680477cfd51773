use std::cell::RefCell;
use std::rc::Rc;

use strand::{
    create_promise, create_task, Cancelled, Error, LocalLoop, State, Task, TaskGroup,
};

#[test]
fn body_awaits_spawned_children() {
    let lp = LocalLoop::new();
    let out = lp.block_on(async {
        strand::task_group!(|group| {
            let a = group.spawn(async { Ok(2) })?;
            let b = group.spawn(async { Ok(3) })?;
            Ok(a.await? + b.await?)
        })
        .await
    });
    assert_eq!(out.unwrap(), 5);
}

#[test]
fn child_errors_are_aggregated_in_spawn_order() {
    let lp = LocalLoop::new();
    let e1 = Error::other(anyhow::anyhow!("first child failed"));
    let e2 = Error::other(anyhow::anyhow!("second child failed"));

    let out = lp.block_on({
        let e1 = e1.clone();
        let e2 = e2.clone();
        async move {
            strand::task_group!(|group| {
                group.spawn(async move { Err::<(), _>(e1) })?;
                group.spawn(async move { Err::<(), _>(e2) })?;
                Ok(())
            })
            .await
        }
    });

    match out.unwrap_err() {
        Error::Multi(multi) => {
            assert_eq!(multi.message(), "child task errors");
            assert_eq!(multi.errors().len(), 2);
            assert!(multi.errors()[0].ptr_eq(&e1));
            assert!(multi.errors()[1].ptr_eq(&e2));
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

#[test]
fn body_error_cancels_children_and_both_are_reported() {
    let lp = LocalLoop::new();
    let body_err = Error::other(anyhow::anyhow!("body blew up"));
    let promise = create_promise::<()>(&lp.handle());
    let child_slot: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));

    let out = lp.block_on({
        let body_err = body_err.clone();
        let fut = promise.future();
        let slot = Rc::clone(&child_slot);
        async move {
            strand::task_group!(|group| {
                let child = group.spawn(async move { fut.await })?;
                slot.borrow_mut().replace(child);
                Err::<(), _>(body_err)
            })
            .await
        }
    });

    let child = child_slot.borrow().clone().unwrap();
    assert!(child.is_finished());
    assert!(child.is_cancelled());

    match out.unwrap_err() {
        Error::Multi(multi) => {
            assert_eq!(multi.message(), "body exception aborts children task");
            assert_eq!(multi.errors().len(), 2);
            assert!(multi.errors()[0].ptr_eq(&body_err));
            assert!(matches!(multi.errors()[1], Error::Cancelled(_)));
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

#[test]
fn manual_group_cancel_surfaces_child_cancellations() {
    let lp = LocalLoop::new();
    let promise = create_promise::<()>(&lp.handle());
    let child_slot: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));

    let out = lp.block_on({
        let fut = promise.future();
        let slot = Rc::clone(&child_slot);
        async move {
            strand::task_group!(|group| {
                let child = group.spawn(async move { fut.await })?;
                slot.borrow_mut().replace(child);
                group.cancel("shutdown");
                Ok(())
            })
            .await
        }
    });

    let child = child_slot.borrow().clone().unwrap();
    assert!(child.is_cancelled());
    match out.unwrap_err() {
        Error::Multi(multi) => {
            assert_eq!(multi.errors().len(), 1);
            match &multi.errors()[0] {
                Error::Cancelled(cancel) => assert_eq!(cancel.msg(), Some("shutdown")),
                other => panic!("expected a cancellation, got {other:?}"),
            }
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

#[test]
fn spawning_after_join_started_is_refused() {
    let lp = LocalLoop::new();
    let escaped: Rc<RefCell<Option<Rc<TaskGroup>>>> = Rc::new(RefCell::new(None));

    lp.block_on({
        let escaped = Rc::clone(&escaped);
        async move {
            strand::task_group!(|group| {
                escaped.borrow_mut().replace(Rc::clone(&group));
                Ok(())
            })
            .await
        }
    })
    .unwrap();

    let group = escaped.borrow().clone().unwrap();
    let refused = group.spawn(async { Ok(()) });
    assert!(matches!(refused, Err(Error::Runtime(_))));
}

#[test]
fn wait_started_suspends_until_the_child_ran_once() {
    let lp = LocalLoop::new();
    let promise = create_promise::<()>(&lp.handle());

    let out = lp.block_on(async move {
        strand::task_group!(|group| {
            let fut = promise.future();
            let child = group.wait_started(async move { fut.await }).await?;
            let state_seen = child.state();
            promise.set_result(())?;
            Ok(state_seen == State::Running)
        })
        .await
    });

    assert!(out.unwrap());
}

#[test]
fn inbound_cancel_during_join_reaps_children_without_losing_them() {
    let lp = LocalLoop::new();
    let promise = create_promise::<()>(&lp.handle());
    let child_slot: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));

    let root = {
        let fut = promise.future();
        let slot = Rc::clone(&child_slot);
        create_task(
            async move {
                strand::task_group!(|group| {
                    let child = group.spawn(async move { fut.await })?;
                    slot.borrow_mut().replace(child);
                    Ok(())
                })
                .await
            },
            &lp.handle(),
        )
    };
    lp.drain();
    assert!(!root.is_finished());

    let reason = Cancelled::with_msg("stop everything");
    root.cancel(reason.clone()).unwrap();
    lp.drain();

    // The scope swallowed the cancel, converted it into a group cancel, and
    // no child survived it.
    let child = child_slot.borrow().clone().unwrap();
    assert!(child.is_finished());
    assert!(child.is_cancelled());
    assert!(root.is_finished());
    match root.exception().unwrap().unwrap() {
        Error::Multi(multi) => {
            assert_eq!(multi.errors().len(), 1);
            match &multi.errors()[0] {
                Error::Cancelled(stored) => assert!(stored.ptr_eq(&reason)),
                other => panic!("expected the inbound cancellation, got {other:?}"),
            }
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}
