//! Partition example - split the controller into even/odd sub-controllers.
//!
//! Each sub-controller runs its own single method, an allreduce over the
//! world ranks it contains, independently of the other.
//!
//! Run with: cargo run --example partition -- 6

use std::sync::Arc;

use ferroctl::transport::local;
use ferroctl::{ProcessController, ReduceOp, Result};
use parking_lot::Mutex;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let size = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let outcomes = local::launch_unstarted(size, |transport| -> Result<()> {
        let mut controller = ProcessController::new(transport);
        controller.initialize(&mut Vec::new(), false)?;

        let rank = controller.local_process_id()?;
        let size = controller.number_of_processes()?;
        let color = rank % 2;
        let mut sub = controller.partition_controller(color, rank)?;
        let group_name = if color == 0 { "even" } else { "odd" };

        let sum = Arc::new(Mutex::new(0.0));
        let result = Arc::clone(&sum);
        sub.set_single_method(move |c| {
            let outcome = c
                .communicator()
                .and_then(|comm| comm.allreduce_scalar(rank as f64, ReduceOp::Sum));
            match outcome {
                Ok(value) => *result.lock() = value,
                Err(e) => eprintln!("Rank {rank}: allreduce failed: {e}"),
            }
        })?;
        sub.single_method_execute()?;

        let expected: f64 = (0..size).filter(|r| r % 2 == color).map(|r| r as f64).sum();
        let sub_sum = *sum.lock();
        println!(
            "World rank {}/{}: {} group, sub-controller rank {}/{}, sum {}",
            rank,
            size,
            group_name,
            sub.local_process_id()?,
            sub.number_of_processes()?,
            sub_sum
        );
        assert_eq!(sub_sum, expected, "Sub-controller sum mismatch!");

        sub.finalize(false)?;
        controller.finalize(false)
    })?;

    outcomes.into_iter().collect()
}
