// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::info;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::balloon::Balloon;
use crate::balloon::VmId;
use crate::balloon_blocker::BalloonBlocker;
use crate::config::Config;
use crate::metrics::BalloonMetrics;
use crate::priority::ResizeDirection;
use crate::priority::ResizePriority;
use crate::priority::ResizeRequest;
use crate::transport::BalloonTransport;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    VmGone(VmId),
    UnknownVm(VmId),
    DuplicateVm(VmId),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmGone(vm_id) => write!(f, "balloon task of VM {} has exited", vm_id),
            Self::UnknownVm(vm_id) => write!(f, "unknown VM {}", vm_id),
            Self::DuplicateVm(vm_id) => write!(f, "VM {} already has a balloon", vm_id),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

enum Command {
    TryResize {
        request: ResizeRequest,
        reply: oneshot::Sender<i64>,
    },
    TargetSize {
        reply: oneshot::Sender<i64>,
    },
    LowestUnblockedPriority {
        direction: ResizeDirection,
        reply: oneshot::Sender<ResizePriority>,
    },
    Shutdown,
}

fn handle_command(blocker: &mut BalloonBlocker, command: Command) {
    // A dropped reply receiver means the caller gave up waiting.
    match command {
        Command::TryResize { request, reply } => {
            let _ = reply.send(blocker.try_resize(request));
        }
        Command::TargetSize { reply } => {
            let _ = reply.send(blocker.target_size());
        }
        Command::LowestUnblockedPriority { direction, reply } => {
            let _ = reply.send(blocker.lowest_unblocked_priority(direction, Instant::now()));
        }
        Command::Shutdown => {}
    }
}

/// Spawns the task owning the balloon of one VM and its blocker. Producers on
/// other tasks talk to it through the returned handle.
pub fn spawn_vm_balloon(
    vm_id: VmId,
    transport: Box<dyn BalloonTransport>,
    initial_target: i64,
    config: &Config,
    metrics: Arc<dyn BalloonMetrics>,
) -> VmBalloonHandle {
    let (balloon, mut events) =
        Balloon::new(vm_id, transport, initial_target, config.stall.clone());
    let mut blocker = BalloonBlocker::new(balloon, config.blocker.clone(), metrics);
    let (commands, mut command_receiver) = unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = command_receiver.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => handle_command(&mut blocker, command),
                },
                Some(event) = events.recv() => blocker.handle_balloon_event(event),
            }
        }
        info!("Balloon task of VM {} exited", vm_id);
    });

    VmBalloonHandle { vm_id, commands }
}

#[derive(Clone)]
pub struct VmBalloonHandle {
    vm_id: VmId,
    commands: UnboundedSender<Command>,
}

impl VmBalloonHandle {
    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// See [BalloonBlocker::try_resize].
    pub async fn try_resize(&self, request: ResizeRequest) -> Result<i64> {
        let (reply, response) = oneshot::channel();
        self.send(Command::TryResize { request, reply })?;
        response.await.map_err(|_| Error::VmGone(self.vm_id))
    }

    pub async fn target_size(&self) -> Result<i64> {
        let (reply, response) = oneshot::channel();
        self.send(Command::TargetSize { reply })?;
        response.await.map_err(|_| Error::VmGone(self.vm_id))
    }

    pub async fn lowest_unblocked_priority(
        &self,
        direction: ResizeDirection,
    ) -> Result<ResizePriority> {
        let (reply, response) = oneshot::channel();
        self.send(Command::LowestUnblockedPriority { direction, reply })?;
        response.await.map_err(|_| Error::VmGone(self.vm_id))
    }

    /// Stops the task. Commands queued before the shutdown are still handled,
    /// resizes in flight are dropped.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::VmGone(self.vm_id))
    }
}

/// The balloons of all running VMs.
pub struct VmBalloonTable {
    config: Config,
    vms: HashMap<VmId, VmBalloonHandle>,
}

impl VmBalloonTable {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            vms: HashMap::new(),
        }
    }

    pub fn add_vm(
        &mut self,
        vm_id: VmId,
        transport: Box<dyn BalloonTransport>,
        initial_target: i64,
        metrics: Arc<dyn BalloonMetrics>,
    ) -> Result<VmBalloonHandle> {
        if self.vms.contains_key(&vm_id) {
            return Err(Error::DuplicateVm(vm_id));
        }
        let handle = spawn_vm_balloon(vm_id, transport, initial_target, &self.config, metrics);
        self.vms.insert(vm_id, handle.clone());
        info!("Added balloon of VM {}", vm_id);
        Ok(handle)
    }

    pub fn remove_vm(&mut self, vm_id: VmId) -> Result<()> {
        let handle = self.vms.remove(&vm_id).ok_or(Error::UnknownVm(vm_id))?;
        // The task may already be gone, there is nothing left to stop then.
        let _ = handle.shutdown();
        info!("Removed balloon of VM {}", vm_id);
        Ok(())
    }

    pub fn get(&self, vm_id: VmId) -> Option<&VmBalloonHandle> {
        self.vms.get(&vm_id)
    }

    pub async fn try_resize(&self, vm_id: VmId, request: ResizeRequest) -> Result<i64> {
        self.get(vm_id)
            .ok_or(Error::UnknownVm(vm_id))?
            .try_resize(request)
            .await
    }

    pub fn vm_ids(&self) -> Vec<VmId> {
        let mut vm_ids: Vec<VmId> = self.vms.keys().copied().collect();
        vm_ids.sort_unstable();
        vm_ids
    }
}
