//! Remote method invocations between controllers.

use std::sync::Arc;

use bytes::Bytes;
use ferroctl::transport::local;
use ferroctl::{
    ControllerConfig, DispatchState, Error, Invocation, ProcessController, ProcessMode,
    RmiDelivery, RmiOutcome,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

type Log = Arc<Mutex<Vec<(i32, Invocation)>>>;

fn attached(transport: Arc<dyn ferroctl::transport::Transport>) -> ProcessController {
    let mut controller = ProcessController::new(transport);
    controller.initialize_attached().unwrap();
    controller
}

fn record(controller: &mut ProcessController, tag: i32, log: &Log) {
    let rank = controller.local_process_id().unwrap();
    let log = Arc::clone(log);
    controller
        .add_rmi_callback(tag, move |inv: &Invocation| log.lock().push((rank, inv.clone())))
        .unwrap();
}

fn ranks_in(log: &Log) -> Vec<i32> {
    let mut ranks: Vec<i32> = log.lock().iter().map(|(rank, _)| *rank).collect();
    ranks.sort_unstable();
    ranks
}

#[test]
fn ping_reaches_only_its_target() {
    let log = Log::default();
    local::launch(4, |transport| {
        let mut controller = attached(transport);
        record(&mut controller, 99, &log);
        if controller.local_process_id().unwrap() == 0 {
            controller.trigger_rmi(2, 99, b"ping", false).unwrap();
            controller.trigger_break_rmis().unwrap();
        } else {
            let outcome = controller.process_rmis(ProcessMode::UntilBreak).unwrap();
            assert_eq!(outcome, RmiOutcome::Break);
        }
    })
    .unwrap();
    let log = log.lock();
    assert_eq!(log.len(), 1);
    let (rank, invocation) = &log[0];
    assert_eq!(*rank, 2);
    assert_eq!(
        invocation,
        &Invocation {
            tag: 99,
            source: 0,
            payload: Bytes::from_static(b"ping"),
            propagate: false,
        }
    );
}

#[test]
fn rmi_traffic_does_not_touch_user_tags() {
    local::launch(2, |transport| {
        let mut controller = attached(transport);
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        controller
            .add_rmi_callback(1, move |_: &Invocation| *counter.lock() += 1)
            .unwrap();
        let world = controller.communicator().unwrap();
        if world.rank() == 0 {
            world.send(&[5i32], 1, ferroctl::RMI_TAG).unwrap();
            controller.trigger_rmi(1, 1, b"", false).unwrap();
        } else {
            let mut buf = [0i32];
            world.recv(&mut buf, 0, ferroctl::RMI_TAG).unwrap();
            assert_eq!(buf, [5]);
            let outcome = controller.process_rmis(ProcessMode::Once).unwrap();
            assert_eq!(outcome, RmiOutcome::Dispatched(1));
            assert_eq!(*hits.lock(), 1);
        }
    })
    .unwrap();
}

#[test]
fn invocations_wait_for_a_late_callback() {
    let log = Log::default();
    local::launch(2, |transport| {
        let mut controller = attached(transport);
        let rank = controller.local_process_id().unwrap();
        if rank == 0 {
            controller.trigger_rmi(1, 5, b"first", false).unwrap();
            controller.trigger_rmi(1, 5, b"second", false).unwrap();
        }
        controller.communicator().unwrap().barrier().unwrap();
        if rank == 1 {
            assert_eq!(controller.poll_rmis().unwrap(), 0);
            assert_eq!(controller.rmi_state().unwrap(), DispatchState::AwaitingDispatch);
            record(&mut controller, 5, &log);
            assert_eq!(controller.poll_rmis().unwrap(), 2);
            assert_eq!(controller.rmi_state().unwrap(), DispatchState::Idle);
        }
    })
    .unwrap();
    let payloads: Vec<Bytes> = log.lock().iter().map(|(_, inv)| inv.payload.clone()).collect();
    assert_eq!(
        payloads,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
}

#[test]
fn propagation_covers_the_whole_tree() {
    let log = Log::default();
    local::launch(7, |transport| {
        let mut controller = attached(transport);
        record(&mut controller, 3, &log);
        if controller.local_process_id().unwrap() == 0 {
            controller.trigger_rmi(0, 3, b"all", true).unwrap();
        }
        let outcome = controller.process_rmis(ProcessMode::Once).unwrap();
        assert_eq!(outcome, RmiOutcome::Dispatched(1));
    })
    .unwrap();
    assert_eq!(ranks_in(&log), vec![0, 1, 2, 3, 4, 5, 6]);
    assert!(log.lock().iter().all(|(_, inv)| inv.source == 0 && inv.propagate));
}

#[test]
fn propagation_from_an_inner_rank_covers_its_subtree() {
    let log = Log::default();
    local::launch(7, |transport| {
        let mut controller = attached(transport);
        record(&mut controller, 3, &log);
        let rank = controller.local_process_id().unwrap();
        if rank == 0 {
            controller.trigger_rmi(2, 3, b"", true).unwrap();
        }
        if [2, 5, 6].contains(&rank) {
            controller.process_rmis(ProcessMode::Once).unwrap();
        }
        controller.communicator().unwrap().barrier().unwrap();
        assert_eq!(controller.poll_rmis().unwrap(), 0);
    })
    .unwrap();
    assert_eq!(ranks_in(&log), vec![2, 5, 6]);
}

#[test]
fn children_fan_out_skips_the_caller() {
    let log = Log::default();
    local::launch(5, |transport| {
        let mut controller = attached(transport);
        record(&mut controller, 11, &log);
        if controller.local_process_id().unwrap() == 0 {
            controller.trigger_rmi_on_all_children(11, b"down").unwrap();
        } else {
            controller.process_rmis(ProcessMode::Once).unwrap();
        }
    })
    .unwrap();
    assert_eq!(ranks_in(&log), vec![1, 2, 3, 4]);
}

#[test]
fn synchronous_delivery_completes_on_receipt() {
    let log = Log::default();
    local::launch(2, |transport| {
        let config = ControllerConfig::new().with_rmi_delivery(RmiDelivery::Synchronous);
        let mut controller = ProcessController::with_config(transport, config);
        controller.initialize_attached().unwrap();
        record(&mut controller, 2, &log);
        if controller.local_process_id().unwrap() == 0 {
            controller.trigger_rmi(1, 2, b"sync", false).unwrap();
            controller.trigger_break_rmis().unwrap();
        } else {
            assert_eq!(
                controller.process_rmis(ProcessMode::UntilBreak).unwrap(),
                RmiOutcome::Break
            );
        }
    })
    .unwrap();
    assert_eq!(ranks_in(&log), vec![1]);
}

#[test]
fn closed_registration_flags_unhandled_tags() {
    local::launch(2, |transport| {
        let mut controller = attached(transport);
        let rank = controller.local_process_id().unwrap();
        if rank == 1 {
            controller.close_rmi_registration().unwrap();
        }
        controller.communicator().unwrap().barrier().unwrap();
        if rank == 0 {
            controller.trigger_rmi(1, 42, b"", false).unwrap();
        } else {
            assert!(matches!(
                controller.process_rmis(ProcessMode::Once),
                Err(Error::UnhandledInvocation {
                    tag: 42,
                    source_rank: 0
                })
            ));
            assert!(matches!(
                controller.add_rmi_callback(42, |_: &Invocation| {}),
                Err(Error::RegistrationClosed)
            ));
        }
    })
    .unwrap();
}

#[test]
fn removing_callbacks_through_the_controller() {
    local::launch(1, |transport| {
        let mut controller = attached(transport);
        let id = controller.add_rmi_callback(6, |_: &Invocation| {}).unwrap();
        controller.add_rmi_callback(6, |_: &Invocation| {}).unwrap();
        controller.add_rmi_callback(6, |_: &Invocation| {}).unwrap();
        assert!(controller.remove_rmi_callback(id).unwrap());
        assert!(controller.remove_first_rmi(6).unwrap());
        assert!(controller.remove_all_rmi_callbacks(6).unwrap());
        assert!(!controller.remove_all_rmi_callbacks(6).unwrap());
        assert!(matches!(
            controller.add_rmi_callback(ferroctl::BREAK_RMI_TAG, |_: &Invocation| {}),
            Err(Error::ReservedTag(_))
        ));
    })
    .unwrap();
}

#[test]
fn single_step_returns_after_running_queued_invocations() {
    let log = Log::default();
    local::launch(1, |transport| {
        let mut controller = attached(transport);
        controller.trigger_rmi(0, 8, b"self", false).unwrap();
        assert_eq!(controller.poll_rmis().unwrap(), 0);
        record(&mut controller, 8, &log);
        assert_eq!(
            controller.process_rmis(ProcessMode::Once).unwrap(),
            RmiOutcome::Dispatched(1)
        );
        assert_eq!(controller.rmi_state().unwrap(), DispatchState::Idle);
    })
    .unwrap();
    assert_eq!(ranks_in(&log), vec![0]);
}
