//! The process controller.
//!
//! A [`ProcessController`] is the entry point of the crate. It brings the
//! transport up, owns the primary [`Communicator`] and a private
//! [`RmiDispatcher`], runs registered routines on every rank, and derives
//! sub-controllers over subsets of its processes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info_span, instrument, warn};

use crate::comm::Communicator;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::group::ProcessGroup;
use crate::rmi::{DispatchState, Invocation, ProcessMode, RmiDispatcher, RmiHandlerId, RmiOutcome};
use crate::transport::Transport;

/// Lifecycle of a [`ProcessController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Built, not initialized yet.
    Created,
    /// Initialized and idle.
    Initialized,
    /// Executing a registered method or dispatching invocations.
    Running,
    /// Finalized; only `finalize` may be called again.
    Finalized,
}

type Method = Box<dyn FnMut(&mut ProcessController)>;

/// Manages a group of cooperating processes.
///
/// Every rank builds its own controller; collective calls
/// ([`initialize`](Self::initialize) excepted) must be made by every rank of
/// the controller's communicator.
///
/// # Example
///
/// ```
/// use ferroctl::{transport::local, ProcessController};
///
/// local::launch_unstarted(3, |transport| {
///     let mut controller = ProcessController::new(transport);
///     controller.initialize(&mut Vec::new(), false).unwrap();
///     controller.set_single_method(|c| {
///         let world = c.communicator().unwrap();
///         let total = world.allreduce_scalar(world.rank(), ferroctl::ReduceOp::Sum).unwrap();
///         assert_eq!(total, 3);
///     })
///     .unwrap();
///     controller.single_method_execute().unwrap();
///     controller.finalize(false).unwrap();
/// })
/// .unwrap();
/// ```
pub struct ProcessController {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    state: ControllerState,
    owns_transport: bool,
    communicator: Option<Communicator>,
    rmi: Option<RmiDispatcher>,
    single_method: Option<Method>,
    multiple_methods: BTreeMap<i32, Method>,
}

impl fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessController")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("owns_transport", &self.owns_transport)
            .field("communicator", &self.communicator)
            .field("rmi", &self.rmi)
            .field("single_method", &self.single_method.is_some())
            .field("multiple_methods", &self.multiple_methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessController {
    /// Create a controller over `transport` with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ControllerConfig::default())
    }

    /// Create a controller over `transport`.
    pub fn with_config(transport: Arc<dyn Transport>, config: ControllerConfig) -> Self {
        ProcessController {
            transport,
            config,
            state: ControllerState::Created,
            owns_transport: false,
            communicator: None,
            rmi: None,
            single_method: None,
            multiple_methods: BTreeMap::new(),
        }
    }

    /// Controller over an already formed communicator.
    fn derived(parent: &ProcessController, communicator: Communicator) -> Result<Self> {
        let rmi_comm = communicator.duplicate()?;
        let mut controller = Self::with_config(Arc::clone(&parent.transport), parent.config.clone());
        controller.rmi = Some(RmiDispatcher::new(rmi_comm, parent.config.rmi_delivery()));
        controller.communicator = Some(communicator);
        controller.state = ControllerState::Initialized;
        Ok(controller)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Join the universe.
    ///
    /// Starts the transport (removing its own arguments from `args`) unless
    /// `externally_owned`, in which case it must already be running. Then
    /// builds the primary communicator and the private RMI communicator.
    /// A second call is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::TransportUnavailable`] if the transport cannot be reached,
    /// [`Error::Finalized`] after [`finalize`](Self::finalize).
    #[instrument(level = "debug", skip_all, fields(externally_owned = externally_owned))]
    pub fn initialize(&mut self, args: &mut Vec<String>, externally_owned: bool) -> Result<()> {
        match self.state {
            ControllerState::Created => {}
            ControllerState::Finalized => return Err(Error::Finalized),
            ControllerState::Initialized | ControllerState::Running => return Ok(()),
        }
        if externally_owned {
            if !self.transport.is_started() {
                return Err(Error::TransportUnavailable(
                    "externally owned transport has not been started".into(),
                ));
            }
        } else {
            self.transport.start(args).map_err(|e| match e {
                Error::TransportUnavailable(_) => e,
                other => Error::TransportUnavailable(other.to_string()),
            })?;
        }
        let world = Communicator::world(Arc::clone(&self.transport))?;
        let rmi_comm = world.duplicate()?;
        debug!(
            rank = world.rank(),
            size = world.size(),
            rmi_context = rmi_comm.context(),
            "controller initialized"
        );
        self.rmi = Some(RmiDispatcher::new(rmi_comm, self.config.rmi_delivery()));
        self.communicator = Some(world);
        self.owns_transport = !externally_owned;
        self.state = ControllerState::Initialized;
        Ok(())
    }

    /// Join a universe whose transport was started by someone else.
    pub fn initialize_attached(&mut self) -> Result<()> {
        self.initialize(&mut Vec::new(), true)
    }

    /// Leave the universe.
    ///
    /// Collective over the controller's communicator. Releases the
    /// communicators and, unless `externally_owned`, shuts the transport
    /// down if this controller started it. A second call is a no-op.
    #[instrument(level = "debug", skip_all, fields(externally_owned = externally_owned))]
    pub fn finalize(&mut self, externally_owned: bool) -> Result<()> {
        match self.state {
            ControllerState::Finalized => return Ok(()),
            ControllerState::Created => {
                self.state = ControllerState::Finalized;
                return Ok(());
            }
            ControllerState::Initialized | ControllerState::Running => {}
        }
        self.state = ControllerState::Finalized;
        self.rmi = None;
        self.single_method = None;
        self.multiple_methods.clear();
        let communicator = self.communicator.take();
        if externally_owned || !self.owns_transport {
            return Ok(());
        }
        // Peers may still be sending to us until everyone got here.
        let synced = communicator.map_or(Ok(()), |world| world.barrier());
        if let Err(e) = &synced {
            warn!(error = %e, "closing barrier failed; shutting down anyway");
        }
        debug!(rank = self.transport.world_rank(), "shutting down transport");
        self.transport.shutdown()?;
        synced
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Configuration this controller was built with.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            ControllerState::Created => Err(Error::NotInitialized),
            ControllerState::Finalized => Err(Error::Finalized),
            ControllerState::Initialized | ControllerState::Running => Ok(()),
        }
    }

    /// The primary communicator.
    pub fn communicator(&self) -> Result<&Communicator> {
        self.check_usable()?;
        self.communicator
            .as_ref()
            .ok_or_else(|| Error::Internal("controller has no communicator".into()))
    }

    fn rmi(&self) -> Result<&RmiDispatcher> {
        self.check_usable()?;
        self.rmi
            .as_ref()
            .ok_or_else(|| Error::Internal("controller has no RMI dispatcher".into()))
    }

    fn rmi_mut(&mut self) -> Result<&mut RmiDispatcher> {
        self.check_usable()?;
        self.rmi
            .as_mut()
            .ok_or_else(|| Error::Internal("controller has no RMI dispatcher".into()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Rank of this process in the controller's communicator.
    pub fn local_process_id(&self) -> Result<i32> {
        Ok(self.communicator()?.rank())
    }

    /// Number of processes in the controller's communicator.
    pub fn number_of_processes(&self) -> Result<i32> {
        Ok(self.communicator()?.size())
    }

    /// Name of the node this process runs on.
    pub fn processor_name(&self) -> Result<String> {
        Ok(self.communicator()?.processor_name())
    }

    /// A span tagging log output with this process's rank.
    pub fn span(&self) -> tracing::Span {
        let rank = self
            .communicator
            .as_ref()
            .map_or_else(|| self.transport.world_rank(), Communicator::rank);
        info_span!("process", rank)
    }

    // ========================================================================
    // Derived controllers
    // ========================================================================

    /// Controller over the members of `group`.
    ///
    /// Called concurrently by every member of `group` with the same group.
    /// Returns `None` on a rank outside the group, without communicating.
    /// The sub-controller never owns the transport.
    pub fn create_sub_controller(&self, group: &ProcessGroup) -> Result<Option<Self>> {
        let parent = self.communicator()?;
        let Some(communicator) = parent.create_group(group)? else {
            return Ok(None);
        };
        debug!(
            parent_rank = parent.rank(),
            rank = communicator.rank(),
            size = communicator.size(),
            "created sub-controller"
        );
        Self::derived(self, communicator).map(Some)
    }

    /// Split into one controller per colour.
    ///
    /// Collective over the controller's communicator. Ranks passing the same
    /// `color` share a new controller ordered by ascending `key`, ties broken
    /// by their rank here.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidColor`] on ranks passing a negative colour; they still
    /// take part in the split.
    pub fn partition_controller(&self, color: i32, key: i32) -> Result<Self> {
        let communicator = self
            .communicator()?
            .split(color, key)?
            .ok_or(Error::InvalidColor(color))?;
        Self::derived(self, communicator)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Register the routine run by [`single_method_execute`](Self::single_method_execute).
    pub fn set_single_method<F>(&mut self, method: F) -> Result<()>
    where
        F: FnMut(&mut ProcessController) + 'static,
    {
        self.check_usable()?;
        self.single_method = Some(Box::new(method));
        Ok(())
    }

    /// Register the routine rank `rank` runs in
    /// [`multiple_method_execute`](Self::multiple_method_execute).
    pub fn set_multiple_method<F>(&mut self, rank: i32, method: F) -> Result<()>
    where
        F: FnMut(&mut ProcessController) + 'static,
    {
        self.check_usable()?;
        self.multiple_methods.insert(rank, Box::new(method));
        Ok(())
    }

    /// Run the single method on this rank, then wait for every other rank.
    pub fn single_method_execute(&mut self) -> Result<()> {
        let rank = self.local_process_id()?;
        let method = self.single_method.take().ok_or(Error::NoMethod(rank))?;
        let method = self.run_method(method);
        if self.single_method.is_none() {
            self.single_method = Some(method);
        }
        self.finish_execute()
    }

    /// Run the method registered for this rank, then wait for every other rank.
    pub fn multiple_method_execute(&mut self) -> Result<()> {
        let rank = self.local_process_id()?;
        let method = self
            .multiple_methods
            .remove(&rank)
            .ok_or(Error::NoMethod(rank))?;
        let method = self.run_method(method);
        if !self.multiple_methods.contains_key(&rank) {
            self.multiple_methods.insert(rank, method);
        }
        self.finish_execute()
    }

    fn run_method(&mut self, mut method: Method) -> Method {
        let span = self.span();
        let _entered = span.enter();
        self.state = ControllerState::Running;
        method(self);
        if self.state == ControllerState::Running {
            self.state = ControllerState::Initialized;
        }
        method
    }

    fn finish_execute(&mut self) -> Result<()> {
        if self.state == ControllerState::Finalized {
            return Ok(());
        }
        self.communicator()?.barrier()
    }

    // ========================================================================
    // Remote method invocation
    // ========================================================================

    /// Register `callback` for RMI `tag`.
    pub fn add_rmi_callback<F>(&mut self, tag: i32, callback: F) -> Result<RmiHandlerId>
    where
        F: FnMut(&Invocation) + 'static,
    {
        self.rmi_mut()?.add_callback(tag, callback)
    }

    /// Remove the callback registered as `id`.
    pub fn remove_rmi_callback(&mut self, id: RmiHandlerId) -> Result<bool> {
        Ok(self.rmi_mut()?.remove_callback(id))
    }

    /// Remove the oldest callback for `tag`.
    pub fn remove_first_rmi(&mut self, tag: i32) -> Result<bool> {
        Ok(self.rmi_mut()?.remove_first_callback(tag))
    }

    /// Remove every callback for `tag`.
    pub fn remove_all_rmi_callbacks(&mut self, tag: i32) -> Result<bool> {
        Ok(self.rmi_mut()?.remove_all_callbacks(tag))
    }

    /// Declare that no more RMI callbacks will be registered on this rank.
    pub fn close_rmi_registration(&mut self) -> Result<()> {
        self.rmi_mut()?.close_registration()
    }

    /// Run the callbacks for `tag` on rank `target`, optionally propagating
    /// down the invocation tree below it.
    pub fn trigger_rmi(&self, target: i32, tag: i32, payload: &[u8], propagate: bool) -> Result<()> {
        self.rmi()?.trigger(target, tag, payload, propagate)
    }

    /// Run the callbacks for `tag` on every rank below this one in the tree.
    pub fn trigger_rmi_on_all_children(&self, tag: i32, payload: &[u8]) -> Result<()> {
        self.rmi()?.trigger_on_all_children(tag, payload)
    }

    /// End the RMI loop of every other rank.
    pub fn trigger_break_rmis(&self) -> Result<()> {
        self.rmi()?.trigger_break()
    }

    /// Receive and run invocations; see [`RmiDispatcher::process`].
    pub fn process_rmis(&mut self, mode: ProcessMode) -> Result<RmiOutcome> {
        self.check_usable()?;
        let span = self.span();
        let _entered = span.enter();
        self.state = ControllerState::Running;
        let outcome = self.rmi_mut().and_then(|rmi| rmi.process(mode));
        self.state = ControllerState::Initialized;
        outcome
    }

    /// Run invocations already received, without blocking.
    pub fn poll_rmis(&mut self) -> Result<usize> {
        self.rmi_mut()?.poll()
    }

    /// State of the RMI dispatcher.
    pub fn rmi_state(&self) -> Result<DispatchState> {
        Ok(self.rmi()?.state())
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        // Peers cannot reach a barrier with a rank that is unwinding.
        if std::thread::panicking() {
            return;
        }
        if self.owns_transport && self.state != ControllerState::Finalized {
            if let Err(e) = self.finalize(false) {
                warn!(error = %e, "finalize on drop failed");
            }
        }
    }
}
