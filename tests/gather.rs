use std::cell::RefCell;
use std::rc::Rc;

use strand::{
    create_promise, create_task, iter_done, Cancelled, Error, FutureId, FutureRef, LocalLoop,
    Promise,
};

#[test]
fn futures_are_yielded_in_completion_order() {
    let lp = LocalLoop::new();
    let promises: Vec<Promise<u32>> = (0..3).map(|_| create_promise(&lp.handle())).collect();
    let ids: Vec<FutureId> = promises.iter().map(|p| p.future().id()).collect();
    let order: Rc<RefCell<Vec<FutureId>>> = Rc::new(RefCell::new(Vec::new()));

    let task = {
        let order = Rc::clone(&order);
        let refs: Vec<FutureRef> = promises.iter().map(|p| p.future().to_ref()).collect();
        create_task(
            async move {
                let mut done = iter_done(refs);
                while let Some(fut) = done.next().await? {
                    order.borrow_mut().push(fut.id());
                }
                Ok(())
            },
            &lp.handle(),
        )
    };
    lp.drain();
    assert!(order.borrow().is_empty());

    promises[2].set_result(1).unwrap();
    lp.drain();
    promises[0].set_result(2).unwrap();
    lp.drain();
    promises[1].set_result(3).unwrap();
    lp.drain();

    task.result().unwrap();
    assert_eq!(*order.borrow(), vec![ids[2], ids[0], ids[1]]);
}

#[test]
fn several_completions_between_wakeups_drain_in_completion_order() {
    let lp = LocalLoop::new();
    let promises: Vec<Promise<u32>> = (0..3).map(|_| create_promise(&lp.handle())).collect();
    let ids: Vec<FutureId> = promises.iter().map(|p| p.future().id()).collect();
    let order: Rc<RefCell<Vec<FutureId>>> = Rc::new(RefCell::new(Vec::new()));

    let task = {
        let order = Rc::clone(&order);
        let refs: Vec<FutureRef> = promises.iter().map(|p| p.future().to_ref()).collect();
        create_task(
            async move {
                let mut done = iter_done(refs);
                while let Some(fut) = done.next().await? {
                    order.borrow_mut().push(fut.id());
                }
                Ok(())
            },
            &lp.handle(),
        )
    };
    lp.drain();

    promises[1].set_result(1).unwrap();
    promises[2].set_result(2).unwrap();
    promises[0].set_result(3).unwrap();
    lp.drain();

    task.result().unwrap();
    assert_eq!(*order.borrow(), vec![ids[1], ids[2], ids[0]]);
}

#[test]
fn already_finished_inputs_are_yielded_without_waiting() {
    let lp = LocalLoop::new();
    let done_promise = create_promise::<u32>(&lp.handle());
    let pending_promise = create_promise::<u32>(&lp.handle());
    let done_id = done_promise.future().id();
    let pending_id = pending_promise.future().id();
    done_promise.set_result(7).unwrap();

    let order: Rc<RefCell<Vec<FutureId>>> = Rc::new(RefCell::new(Vec::new()));
    let task = {
        let order = Rc::clone(&order);
        let refs = vec![
            pending_promise.future().to_ref(),
            done_promise.future().to_ref(),
        ];
        create_task(
            async move {
                let mut done = iter_done(refs);
                while let Some(fut) = done.next().await? {
                    order.borrow_mut().push(fut.id());
                }
                Ok(())
            },
            &lp.handle(),
        )
    };
    lp.drain();
    assert_eq!(*order.borrow(), vec![done_id]);

    pending_promise.set_result(8).unwrap();
    lp.drain();

    task.result().unwrap();
    assert_eq!(*order.borrow(), vec![done_id, pending_id]);
}

#[test]
fn empty_input_yields_nothing() {
    let lp = LocalLoop::new();
    let task = create_task(
        async {
            let mut done = iter_done(Vec::new());
            Ok(done.next().await?.is_none())
        },
        &lp.handle(),
    );
    lp.drain();
    assert!(task.result().unwrap());
}

#[test]
fn failed_inputs_are_yielded_like_successful_ones() {
    let lp = LocalLoop::new();
    let promise = create_promise::<()>(&lp.handle());
    let err = Error::other(anyhow::anyhow!("child failed"));

    let seen: Rc<RefCell<Vec<Option<Error>>>> = Rc::new(RefCell::new(Vec::new()));
    let task = {
        let seen = Rc::clone(&seen);
        let refs = vec![promise.future().to_ref()];
        create_task(
            async move {
                let mut done = iter_done(refs);
                while let Some(fut) = done.next().await? {
                    seen.borrow_mut().push(fut.exception()?);
                }
                Ok(())
            },
            &lp.handle(),
        )
    };
    lp.drain();

    promise.set_exception(err.clone()).unwrap();
    lp.drain();

    task.result().unwrap();
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].as_ref().unwrap().ptr_eq(&err));
}

#[test]
fn cancelling_the_iterating_task_stops_iteration_and_unsubscribes() {
    let lp = LocalLoop::new();
    let promise = create_promise::<()>(&lp.handle());

    let task = {
        let refs = vec![promise.future().to_ref()];
        create_task(
            async move {
                let mut done = iter_done(refs);
                while let Some(_fut) = done.next().await? {}
                Ok(())
            },
            &lp.handle(),
        )
    };
    lp.drain();
    assert!(!task.is_finished());

    let reason = Cancelled::with_msg("abort iteration");
    task.cancel(reason.clone()).unwrap();
    lp.drain();

    assert!(task.is_cancelled());
    match task.exception().unwrap().unwrap() {
        Error::Cancelled(stored) => assert!(stored.ptr_eq(&reason)),
        other => panic!("expected a cancellation, got {other:?}"),
    }

    // The iterator is gone and its subscription with it: completing the
    // input now notifies nobody and breaks nothing.
    promise.set_result(()).unwrap();
    lp.drain();
}
