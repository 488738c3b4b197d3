//! RMI example - rank 0 drives every other rank through remote invocations.
//!
//! Rank 0 pings each satellite, broadcasts a message down the invocation
//! tree, then breaks every satellite out of its RMI loop.
//!
//! Run with: cargo run --example rmi_ping -- 4
//! Set FERROCTL_RMI_SYNC=1 for synchronous delivery.

use ferroctl::transport::local;
use ferroctl::{ControllerConfig, Invocation, ProcessController, ProcessMode, Result};

const PING: i32 = 10;
const ANNOUNCE: i32 = 11;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let size = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let outcomes = local::launch_unstarted(size, |transport| -> Result<()> {
        let mut controller = ProcessController::with_config(transport, ControllerConfig::from_env());
        controller.initialize(&mut Vec::new(), false)?;
        let rank = controller.local_process_id()?;

        controller.add_rmi_callback(PING, move |inv: &Invocation| {
            println!(
                "Rank {rank}: ping from rank {} ({})",
                inv.source,
                String::from_utf8_lossy(&inv.payload)
            );
        })?;
        controller.add_rmi_callback(ANNOUNCE, move |inv: &Invocation| {
            println!("Rank {rank}: announcement {:?}", String::from_utf8_lossy(&inv.payload));
        })?;
        controller.close_rmi_registration()?;

        if rank == 0 {
            for target in 1..controller.number_of_processes()? {
                controller.trigger_rmi(target, PING, format!("hello {target}").as_bytes(), false)?;
            }
            controller.trigger_rmi_on_all_children(ANNOUNCE, b"shutting down soon")?;
            controller.trigger_break_rmis()?;
        } else {
            controller.process_rmis(ProcessMode::UntilBreak)?;
        }

        // Forwarded announcements can trail the break from rank 0.
        controller.communicator()?.barrier()?;
        controller.poll_rmis()?;
        if rank == 0 {
            println!("\nRMI example passed!");
        }
        controller.finalize(false)
    })?;

    outcomes.into_iter().collect()
}
