//! Command-pool broker: primary command pools and per-(priority, protection)
//! accumulation state, behind a single mutex.
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    batch::CommandBatch,
    device::{CommandBuffer, CommandPool, DeviceError, Framebuffer, GpuDevice, PipelineStages, Priority, Protection,
             RenderPass, Semaphore},
    error::Result,
};

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Free list that secondary command buffers return to once the GPU is done
/// with them. Contexts fetch from here when they start recording again.
pub struct SecondaryCommandRecycler {
    free: Mutex<Vec<CommandBuffer>>,
}

impl std::fmt::Debug for SecondaryCommandRecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCommandRecycler").field("free", &self.len()).finish()
    }
}

impl Default for SecondaryCommandRecycler {
    fn default() -> SecondaryCommandRecycler {
        SecondaryCommandRecycler::new()
    }
}

impl SecondaryCommandRecycler {
    pub fn new() -> SecondaryCommandRecycler {
        SecondaryCommandRecycler {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn fetch(&self) -> Option<CommandBuffer> {
        self.free.lock().pop()
    }

    pub fn recycle(&self, commands: CommandBuffer) {
        self.free.lock().push(commands);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }
}

/// A recorded secondary command buffer handed over by a rendering context,
/// with the recycler it goes back to after its submission completes.
#[derive(Debug)]
pub struct SecondaryCommands {
    pub(crate) commands: CommandBuffer,
    pub(crate) recycler: Option<Arc<SecondaryCommandRecycler>>,
}

impl SecondaryCommands {
    pub fn new(commands: CommandBuffer) -> SecondaryCommands {
        SecondaryCommands {
            commands,
            recycler: None,
        }
    }

    pub fn with_recycler(commands: CommandBuffer, recycler: Arc<SecondaryCommandRecycler>) -> SecondaryCommands {
        SecondaryCommands {
            commands,
            recycler: Some(recycler),
        }
    }

    pub fn handle(&self) -> CommandBuffer {
        self.commands
    }
}

/// Secondary buffers owned by a batch until its submission completes; on
/// release each buffer goes back to its recycler.
#[derive(Debug, Default)]
pub(crate) struct SecondaryCommandCollector {
    collected: Vec<SecondaryCommands>,
}

impl SecondaryCommandCollector {
    pub(crate) fn push(&mut self, commands: SecondaryCommands) {
        self.collected.push(commands);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }

    pub(crate) fn release(&mut self) {
        for secondary in self.collected.drain(..) {
            if let Some(recycler) = secondary.recycler {
                recycler.recycle(secondary.commands);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Persistent pool of primary command buffers for one protection mode.
/// Collected buffers are reset and handed out again.
struct PersistentCommandPool {
    pool: CommandPool,
    free: Vec<CommandBuffer>,
}

impl PersistentCommandPool {
    fn new(device: &dyn GpuDevice, protection: Protection) -> Result<PersistentCommandPool, DeviceError> {
        Ok(PersistentCommandPool {
            pool: device.create_command_pool(protection)?,
            free: Vec::new(),
        })
    }

    fn allocate(&mut self, device: &dyn GpuDevice) -> Result<CommandBuffer, DeviceError> {
        if let Some(commands) = self.free.pop() {
            return Ok(commands);
        }
        debug!("allocating a new primary command buffer");
        device.allocate_primary_commands(self.pool)
    }

    fn collect(&mut self, device: &dyn GpuDevice, commands: CommandBuffer) -> Result<(), DeviceError> {
        device.reset_commands(commands)?;
        self.free.push(commands);
        Ok(())
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        for commands in self.free.drain(..) {
            device.free_commands(commands);
        }
        device.destroy_command_pool(self.pool);
    }
}

/// In-progress commands for one (priority, protection) pair.
///
/// Invariant: `primary.is_some() || secondary.is_empty()`.
#[derive(Default)]
struct CommandsState {
    primary: Option<CommandBuffer>,
    secondary: SecondaryCommandCollector,
    wait_semaphores: Vec<Semaphore>,
    wait_semaphore_stages: Vec<PipelineStages>,
}

#[derive(Default)]
struct PoolState {
    pools: [Option<PersistentCommandPool>; Protection::COUNT],
    states: [[CommandsState; Protection::COUNT]; Priority::COUNT],
}

impl PoolState {
    fn state(&mut self, priority: Priority, protection: Protection) -> &mut CommandsState {
        &mut self.states[priority.index()][protection.index()]
    }
}

/// Thread-safe broker over the primary command pools. No pool or buffer is
/// touched without holding the broker mutex; batches keep a pointer back here
/// so their primaries can be returned without the releasing thread knowing
/// which pool applied.
pub(crate) struct CommandPoolAccess {
    device: Arc<dyn GpuDevice>,
    inner: Mutex<PoolState>,
}

impl CommandPoolAccess {
    pub(crate) fn new(device: Arc<dyn GpuDevice>) -> CommandPoolAccess {
        CommandPoolAccess {
            device,
            inner: Mutex::new(PoolState::default()),
        }
    }

    /// Creates the primary pool for `protection`. Idempotent.
    pub(crate) fn init_pool(&self, protection: Protection) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.pools[protection.index()];
        if slot.is_none() {
            *slot = Some(PersistentCommandPool::new(&*self.device, protection)?);
        }
        Ok(())
    }

    /// Appends the recorded contents of `commands` to the target primary
    /// buffer; the secondary buffer is kept for recycling at batch release.
    pub(crate) fn flush_outside_commands(
        &self,
        protection: Protection,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let primary = Self::ensure_primary_locked(&*self.device, &mut inner, priority, protection)?;
        self.device.execute_commands(primary, commands.handle());
        inner.state(priority, protection).secondary.push(commands);
        Ok(())
    }

    /// As [`flush_outside_commands`], wrapping the execution in a render-pass
    /// scope.
    ///
    /// [`flush_outside_commands`]: Self::flush_outside_commands
    pub(crate) fn flush_render_pass_commands(
        &self,
        protection: Protection,
        priority: Priority,
        pass: RenderPass,
        framebuffer: Option<Framebuffer>,
        commands: SecondaryCommands,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let primary = Self::ensure_primary_locked(&*self.device, &mut inner, priority, protection)?;
        self.device.begin_render_pass(primary, pass, framebuffer);
        self.device.execute_commands(primary, commands.handle());
        self.device.end_render_pass(primary);
        inner.state(priority, protection).secondary.push(commands);
        Ok(())
    }

    /// Appends wait semaphores to the target state. Inputs are moved in and
    /// consumed by the next submission.
    pub(crate) fn flush_wait_semaphores(
        &self,
        protection: Protection,
        priority: Priority,
        semaphores: Vec<Semaphore>,
        stages: Vec<PipelineStages>,
    ) {
        debug_assert!(!semaphores.is_empty());
        debug_assert_eq!(semaphores.len(), stages.len());
        let mut inner = self.inner.lock();
        let state = inner.state(priority, protection);
        state.wait_semaphores.extend(semaphores);
        state.wait_semaphore_stages.extend(stages);
    }

    /// Ends the current primary buffer and moves it, the secondary
    /// collection and the accumulated wait semaphores out. The state is left
    /// empty for the next submission.
    pub(crate) fn get_commands_and_wait_semaphores(
        self: &Arc<Self>,
        protection: Protection,
        priority: Priority,
        batch: &mut CommandBatch,
        wait_semaphores: &mut Vec<Semaphore>,
        wait_semaphore_stages: &mut Vec<PipelineStages>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state(priority, protection);
        debug_assert!(state.primary.is_some() || state.secondary.is_empty());

        if let Some(primary) = state.primary.take() {
            self.device.end_commands(primary)?;
            batch.set_primary_commands(primary, self.clone());
        }
        batch.set_secondary_commands(std::mem::take(&mut state.secondary));

        *wait_semaphores = std::mem::take(&mut state.wait_semaphores);
        *wait_semaphore_stages = std::mem::take(&mut state.wait_semaphore_stages);
        Ok(())
    }

    /// Returns a completed primary buffer to its pool for reset and reuse.
    pub(crate) fn collect_primary(&self, protection: Protection, commands: CommandBuffer) -> Result<()> {
        let mut inner = self.inner.lock();
        let pool = inner.pools[protection.index()]
            .as_mut()
            .expect("collecting a primary command buffer into an uninitialized pool");
        pool.collect(&*self.device, commands)?;
        Ok(())
    }

    /// Unconditionally destroys a primary buffer (device-lost path).
    pub(crate) fn destroy_primary(&self, commands: CommandBuffer) {
        let _inner = self.inner.lock();
        self.device.free_commands(commands);
    }

    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        for row in &mut inner.states {
            for state in row {
                state.wait_semaphores.clear();
                state.wait_semaphore_stages.clear();
                if let Some(primary) = state.primary.take() {
                    self.device.free_commands(primary);
                }
                state.secondary.release();
            }
        }
        for pool in inner.pools.iter_mut().flatten() {
            pool.destroy(&*self.device);
        }
        inner.pools = Default::default();
    }

    fn ensure_primary_locked(
        device: &dyn GpuDevice,
        inner: &mut PoolState,
        priority: Priority,
        protection: Protection,
    ) -> Result<CommandBuffer, DeviceError> {
        if let Some(primary) = inner.state(priority, protection).primary {
            return Ok(primary);
        }
        let pool = inner.pools[protection.index()]
            .as_mut()
            .expect("flushing commands before the command pool was initialized");
        let primary = pool.allocate(device)?;
        device.begin_commands(primary)?;
        inner.state(priority, protection).primary = Some(primary);
        Ok(primary)
    }
}
