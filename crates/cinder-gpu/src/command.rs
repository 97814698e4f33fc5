//! Command buffer management.
//!
//! Vulkan command pools are externally synchronised, so every registered
//! thread records from its own pool and only that thread touches it. Buffers
//! released from another thread (usually the cleanup thread) are parked on
//! the pool's retired list and freed by the owner on its next allocation.

use crate::error::{GpuError, Result};
use ash::vk;
use cinder_core::{PerThread, ThreadIndex, ThreadRegistry};
use parking_lot::Mutex;
use std::sync::Arc;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        device
            .allocate_command_buffers(&alloc_info)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("Empty command buffer allocation".to_string()))
    }

    /// Return a command buffer to the pool.
    ///
    /// # Safety
    /// The buffer must come from this pool and must not be pending execution.
    pub unsafe fn free(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.free_command_buffers(self.pool, &[cmd]);
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// A pool together with the handles other threads have released into it.
struct PoolSlot<P, H> {
    pool: Mutex<P>,
    retired: Mutex<Vec<H>>,
}

impl<P, H> PoolSlot<P, H> {
    fn new(pool: P) -> Self {
        Self {
            pool: Mutex::new(pool),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Park `handle` without touching the pool.
    fn retire(&self, handle: H) {
        self.retired.lock().push(handle);
    }

    /// Lock the pool, hand every retired handle to `reclaim`, then run `f`.
    ///
    /// Only the owning thread may call this.
    fn with_pool<R>(&self, reclaim: impl FnOnce(&P, &[H]), f: impl FnOnce(&P) -> R) -> R {
        let pool = self.pool.lock();
        let retired = std::mem::take(&mut *self.retired.lock());
        if !retired.is_empty() {
            reclaim(&pool, &retired);
        }
        f(&pool)
    }

    fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

/// One graphics command pool per registered thread.
pub struct ThreadCommandPools {
    device: Arc<ash::Device>,
    registry: Arc<ThreadRegistry>,
    pools: PerThread<PoolSlot<CommandPool, vk::CommandBuffer>>,
}

impl ThreadCommandPools {
    /// Create a pool for every slot of `registry`.
    ///
    /// # Safety
    /// The device must be valid and `queue_family` must exist.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        registry: Arc<ThreadRegistry>,
        queue_family: u32,
    ) -> Result<Self> {
        let pools = PerThread::try_new(&registry, |_| {
            CommandPool::new(
                &device,
                queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
            .map(PoolSlot::new)
        })?;
        tracing::debug!(pools = pools.len(), queue_family, "Created per-thread command pools");

        Ok(Self {
            device,
            registry,
            pools,
        })
    }

    /// Allocate a command buffer from the calling thread's pool.
    ///
    /// Buffers other threads released into this pool are freed first.
    pub fn allocate(&self) -> Result<(ThreadIndex, vk::CommandBuffer)> {
        let index = self.registry.current_thread_index();
        debug_assert!(index.is_valid(), "command buffer requested from an unregistered thread");
        let slot = self.pools.get(index).ok_or(GpuError::UnregisteredThread)?;
        let device = &*self.device;
        let cmd = slot.with_pool(
            |pool, retired| unsafe { device.free_command_buffers(pool.handle(), retired) },
            |pool| unsafe { pool.allocate(device) },
        )?;
        Ok((index, cmd))
    }

    /// Release a command buffer into the pool of the thread that allocated it.
    ///
    /// On the owning thread the buffer is freed at once. From any other
    /// thread it is retired and freed by the owner on its next allocation.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn free(&self, owner: ThreadIndex, cmd: vk::CommandBuffer) {
        let Some(slot) = self.pools.get(owner) else {
            return;
        };
        if self.registry.current_thread_index() == owner {
            let device = &*self.device;
            slot.with_pool(
                |pool, retired| unsafe { device.free_command_buffers(pool.handle(), retired) },
                |pool| unsafe { pool.free(device, cmd) },
            );
        } else {
            slot.retire(cmd);
        }
    }

    /// Buffers waiting for `owner` to free them.
    pub fn retired(&self, owner: ThreadIndex) -> usize {
        self.pools.get(owner).map_or(0, PoolSlot::retired_len)
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }
}

impl Drop for ThreadCommandPools {
    fn drop(&mut self) {
        // Destroying a pool frees its buffers, retired ones included.
        for slot in self.pools.iter() {
            unsafe { slot.pool.lock().destroy(&self.device) };
        }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn foreign_release_never_touches_the_pool() {
        let slot = Arc::new(PoolSlot::<Vec<u32>, u32>::new(vec![1, 2, 3]));

        // The owner is recording: it holds the pool for the whole time.
        let recording = slot.pool.lock();
        let other = Arc::clone(&slot);
        thread::spawn(move || {
            other.retire(2);
            other.retire(3);
        })
        .join()
        .unwrap();
        assert_eq!(*recording, vec![1, 2, 3]);
        drop(recording);

        assert_eq!(slot.retired_len(), 2);
    }

    #[test]
    fn owner_reclaims_retired_handles_before_allocating() {
        let slot = PoolSlot::<Mutex<Vec<u32>>, u32>::new(Mutex::new(vec![1, 2, 3]));
        slot.retire(1);
        slot.retire(3);

        let mut order = Vec::new();
        let live = slot.with_pool(
            |pool, retired| {
                order.push("reclaim");
                pool.lock().retain(|h| !retired.contains(h));
            },
            |pool| pool.lock().clone(),
        );
        order.push("allocate");

        assert_eq!(live, vec![2]);
        assert_eq!(order, ["reclaim", "allocate"]);
        assert_eq!(slot.retired_len(), 0);
    }

    #[test]
    fn nothing_to_reclaim_skips_the_callback() {
        let slot = PoolSlot::<(), u32>::new(());
        let mut reclaimed = false;
        slot.with_pool(|_, _| reclaimed = true, |()| ());
        assert!(!reclaimed);
    }
}
