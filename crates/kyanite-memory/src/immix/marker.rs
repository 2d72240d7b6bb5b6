//! The concurrent marker thread.
//!
//! When concurrent mature collection is enabled, one dedicated thread
//! processes the mark stack overlapped with mutation. The driver seeds the
//! stack from roots at a stop-the-world snapshot and signals the marker;
//! mutator write barriers feed newly stored references through the mark
//! feed. When the marker runs dry it requests the finish safepoint, where
//! the driver completes the closure and sweeps.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::memory::ObjectMemory;

/// Objects scanned per slice before the marker re-checks for shutdown.
const SLICE_BUDGET: usize = 512;

enum MarkerCommand {
    Run,
    Shutdown,
}

pub(crate) struct ImmixMarker {
    commands: Sender<MarkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl ImmixMarker {
    /// Spawn the marker against a weak handle on the memory, so the marker
    /// never keeps the runtime alive by itself.
    pub(crate) fn start(mem: &Arc<ObjectMemory>) -> ImmixMarker {
        let (commands, receiver) = unbounded();
        let weak = Arc::downgrade(mem);
        let handle = std::thread::Builder::new()
            .name("kyanite-immix-marker".into())
            .spawn(move || marker_loop(&weak, &receiver))
            .expect("failed to spawn the immix marker thread");
        ImmixMarker {
            commands,
            handle: Some(handle),
        }
    }

    /// Kick off marking for a cycle whose roots are already on the stack.
    pub(crate) fn request_mark(&self) {
        let _ = self.commands.send(MarkerCommand::Run);
    }

    /// Stop and join the marker. When called from the marker thread
    /// itself (the memory's last owner can be the marker's upgraded
    /// handle), the join is skipped and the thread just unwinds.
    pub(crate) fn shutdown(mut self) {
        let _ = self.commands.send(MarkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Drop the thread handle without joining. Only for the child side of
    /// `fork`, where the marker thread does not exist.
    pub(crate) fn abandon(mut self) {
        self.handle.take();
    }
}

fn marker_loop(mem: &Weak<ObjectMemory>, commands: &Receiver<MarkerCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            MarkerCommand::Shutdown => break,
            MarkerCommand::Run => {
                let Some(mem) = mem.upgrade() else { break };
                run_one_mark(&mem, commands);
            }
        }
    }
}

fn run_one_mark(mem: &Arc<ObjectMemory>, commands: &Receiver<MarkerCommand>) {
    tracing::debug!("concurrent mark running");
    loop {
        // Early shutdown beats finishing the cycle.
        if let Ok(MarkerCommand::Shutdown) = commands.try_recv() {
            return;
        }
        if !crate::immix::collect::concurrent_mark_step(mem, SLICE_BUDGET) {
            break;
        }
    }
    tracing::debug!("concurrent mark drained, requesting finish safepoint");
    mem.concurrent_mark_drained();
}
