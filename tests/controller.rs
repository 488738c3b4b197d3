//! Controller lifecycle, execution models and derived controllers.

use std::sync::Arc;

use ferroctl::transport::{local, Transport};
use ferroctl::{
    ControllerConfig, ControllerState, Error, ProcessController, ProcessGroup, RmiDelivery,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn lifecycle_is_idempotent_and_final() {
    init_logging();
    local::launch_unstarted(3, |transport| {
        let mut controller = ProcessController::new(transport);
        assert_eq!(controller.state(), ControllerState::Created);

        controller.initialize(&mut Vec::new(), false).unwrap();
        controller.initialize(&mut Vec::new(), false).unwrap();
        assert_eq!(controller.state(), ControllerState::Initialized);
        assert_eq!(controller.number_of_processes().unwrap(), 3);
        assert!(!controller.processor_name().unwrap().is_empty());

        controller.finalize(false).unwrap();
        controller.finalize(false).unwrap();
        assert_eq!(controller.state(), ControllerState::Finalized);
        assert!(matches!(controller.local_process_id(), Err(Error::Finalized)));
        assert!(matches!(controller.communicator(), Err(Error::Finalized)));
        assert!(matches!(
            controller.trigger_rmi(0, 1, b"", false),
            Err(Error::Finalized)
        ));
        assert!(matches!(
            controller.initialize(&mut Vec::new(), false),
            Err(Error::Finalized)
        ));
    })
    .unwrap();
}

#[test]
fn finalize_shuts_down_only_an_owned_transport() {
    local::launch_unstarted(2, |transport| {
        let mut owner = ProcessController::new(Arc::clone(&transport));
        owner.initialize(&mut Vec::new(), false).unwrap();

        let mut guest = ProcessController::new(Arc::clone(&transport));
        guest.initialize_attached().unwrap();
        guest.finalize(false).unwrap();
        assert!(transport.is_started());

        owner.finalize(false).unwrap();
        assert!(!transport.is_started());
    })
    .unwrap();
}

#[test]
fn externally_owned_finalize_leaves_transport_running() {
    local::launch_unstarted(2, |transport| {
        let mut controller = ProcessController::new(Arc::clone(&transport));
        controller.initialize(&mut Vec::new(), false).unwrap();
        controller.finalize(true).unwrap();
        assert!(transport.is_started());
    })
    .unwrap();
}

#[test]
fn dropping_an_owning_controller_finalizes_it() {
    local::launch_unstarted(2, |transport| {
        {
            let mut controller = ProcessController::new(Arc::clone(&transport));
            controller.initialize(&mut Vec::new(), false).unwrap();
        }
        assert!(!transport.is_started());
    })
    .unwrap();
}

#[test]
fn single_method_runs_once_per_rank() {
    let record = Arc::new(Mutex::new(Vec::new()));
    local::launch(4, |transport| {
        let mut controller = ProcessController::new(transport);
        controller.initialize_attached().unwrap();
        let record = Arc::clone(&record);
        controller.set_single_method(move |c| {
            record.lock().push(c.local_process_id().unwrap());
        })
        .unwrap();
        controller.single_method_execute().unwrap();
    })
    .unwrap();
    let mut ranks = record.lock().clone();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
}

#[test]
fn multiple_method_runs_the_rank_specific_routine() {
    let record = Arc::new(Mutex::new(Vec::new()));
    local::launch(3, |transport| {
        let mut controller = ProcessController::new(transport);
        controller.initialize_attached().unwrap();
        for rank in 0..controller.number_of_processes().unwrap() {
            let record = Arc::clone(&record);
            controller
                .set_multiple_method(rank, move |c| {
                    record.lock().push((c.local_process_id().unwrap(), rank));
                })
                .unwrap();
        }
        controller.multiple_method_execute().unwrap();
    })
    .unwrap();
    let mut calls = record.lock().clone();
    calls.sort_unstable();
    assert_eq!(calls, vec![(0, 0), (1, 1), (2, 2)]);
}

#[test]
fn partition_builds_one_controller_per_colour() {
    let layout = local::launch(4, |transport| {
        let mut controller = ProcessController::new(transport);
        controller.initialize_attached().unwrap();
        let rank = controller.local_process_id().unwrap();
        let color = rank % 2;
        let sub = controller.partition_controller(color, rank).unwrap();
        assert_eq!(sub.state(), ControllerState::Initialized);
        assert_eq!(sub.number_of_processes().unwrap(), 2);
        (color, sub.local_process_id().unwrap())
    })
    .unwrap();
    assert_eq!(layout, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
}

#[test]
fn negative_colour_is_rejected_after_the_split() {
    local::launch(3, |transport| {
        let mut controller = ProcessController::new(transport);
        controller.initialize_attached().unwrap();
        let rank = controller.local_process_id().unwrap();
        let result = controller.partition_controller(if rank == 0 { -1 } else { 0 }, 0);
        if rank == 0 {
            assert!(matches!(result, Err(Error::InvalidColor(-1))));
        } else {
            assert_eq!(result.unwrap().number_of_processes().unwrap(), 2);
        }
    })
    .unwrap();
}

#[test]
fn sub_controller_covers_the_group_only() {
    let sizes = local::launch(4, |transport| {
        let mut controller = ProcessController::new(transport);
        controller.initialize_attached().unwrap();
        let group = ProcessGroup::from_ranks([0, 2]).unwrap();
        let mut sub = controller.create_sub_controller(&group).unwrap()?;
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        sub.set_single_method(move |c| {
            let comm = c.communicator().unwrap();
            *counter.lock() = comm.allreduce_scalar(1i32, ferroctl::ReduceOp::Sum).unwrap();
        })
        .unwrap();
        sub.single_method_execute().unwrap();
        let total = *seen.lock();
        Some((sub.number_of_processes().unwrap(), total))
    })
    .unwrap();
    assert_eq!(sizes, vec![Some((2, 2)), None, Some((2, 2)), None]);
}

#[test]
fn configuration_reaches_the_controller() {
    local::launch(1, |transport| {
        let config = ControllerConfig::new().with_rmi_delivery(RmiDelivery::Synchronous);
        let mut controller = ProcessController::with_config(transport, config.clone());
        controller.initialize_attached().unwrap();
        assert_eq!(controller.config(), &config);
        let _entered = controller.span().entered();
    })
    .unwrap();
}
