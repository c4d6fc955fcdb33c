//! [`Hypervisor`] that runs one daemonized QEMU process per VM.
//!
//! QEMU writes a pidfile under the run directory, so a restarted agent
//! finds VMs it started before. Started processes are tracked in a
//! mutex-guarded map from UUID to pid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::exec::run;
use super::{HostError, Hypervisor, VmDisk, VmLaunch};

/// How long a VM gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct QemuHypervisor {
    qemu_path: String,
    run_dir: PathBuf,
    stop_timeout: Duration,
    processes: Mutex<HashMap<Uuid, u32>>,
}

impl QemuHypervisor {
    pub fn new(qemu_path: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            qemu_path: qemu_path.into(),
            run_dir: run_dir.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn pidfile(&self, uuid: Uuid) -> PathBuf {
        self.run_dir.join(format!("{}.pid", uuid))
    }

    /// Command-line arguments for a launch.
    pub fn args(&self, launch: &VmLaunch) -> Vec<String> {
        let mut args = vec![
            "-name".to_string(),
            launch.name.clone(),
            "-uuid".to_string(),
            launch.uuid.to_string(),
            "-enable-kvm".to_string(),
            "-cpu".to_string(),
            "host".to_string(),
            "-smp".to_string(),
            launch.vcpus.to_string(),
            "-m".to_string(),
            format!("{}M", launch.memory_mib),
            "-display".to_string(),
            "none".to_string(),
            "-daemonize".to_string(),
            "-pidfile".to_string(),
            self.pidfile(launch.uuid).to_string_lossy().into_owned(),
        ];

        for disk in &launch.disks {
            let file = match disk {
                VmDisk::Local(path) => path.clone(),
                VmDisk::Object(image) => format!("rbd:{}", image),
            };
            args.push("-drive".to_string());
            args.push(format!("file={},format=raw,if=virtio,cache=none", file));
        }

        for (i, nic) in launch.nics.iter().enumerate() {
            args.push("-netdev".to_string());
            args.push(format!("bridge,id=net{},br={}", i, nic.bridge));
            args.push("-device".to_string());
            let mut device = format!("virtio-net-pci,netdev=net{}", i);
            if !nic.mac.is_empty() {
                device.push_str(&format!(",mac={}", nic.mac));
            }
            args.push(device);
        }

        args
    }

    /// The pid of a live process for `uuid`, from the map or the pidfile.
    async fn live_pid(&self, uuid: Uuid) -> Result<Option<u32>, HostError> {
        let mut processes = self.processes.lock().await;

        let pid = match processes.get(&uuid) {
            Some(pid) => Some(*pid),
            None => read_pidfile(&self.pidfile(uuid)).await?,
        };

        let Some(pid) = pid else {
            return Ok(None);
        };

        if process_matches(pid, uuid).await {
            processes.insert(uuid, pid);
            Ok(Some(pid))
        } else {
            processes.remove(&uuid);
            Ok(None)
        }
    }
}

async fn read_pidfile(path: &Path) -> Result<Option<u32>, HostError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether `pid` is alive and its command line carries `uuid`, so a
/// recycled pid is not mistaken for the VM.
async fn process_matches(pid: u32, uuid: Uuid) -> bool {
    match tokio::fs::read(format!("/proc/{}/cmdline", pid)).await {
        Ok(cmdline) => String::from_utf8_lossy(&cmdline).contains(&uuid.to_string()),
        Err(_) => false,
    }
}

/// Poll until the process is gone or `timeout` elapses.
async fn wait_for_exit(pid: u32, uuid: Uuid, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process_matches(pid, uuid).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn start(&self, launch: &VmLaunch) -> Result<(), HostError> {
        tokio::fs::create_dir_all(&self.run_dir).await?;

        info!(
            uuid = %launch.uuid,
            name = %launch.name,
            vcpus = launch.vcpus,
            memory_mib = launch.memory_mib,
            disks = launch.disks.len(),
            nics = launch.nics.len(),
            "Starting VM"
        );

        let args = self.args(launch);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        // -daemonize: the parent exits once the guest process is up
        run(&self.qemu_path, &arg_refs).await?;

        match read_pidfile(&self.pidfile(launch.uuid)).await? {
            Some(pid) => {
                debug!(uuid = %launch.uuid, pid, "VM started");
                self.processes.lock().await.insert(launch.uuid, pid);
                Ok(())
            }
            None => Err(HostError::NotFound(format!(
                "pidfile for VM {}",
                launch.uuid
            ))),
        }
    }

    async fn stop(&self, uuid: Uuid) -> Result<(), HostError> {
        let Some(pid) = self.live_pid(uuid).await? else {
            return Ok(());
        };

        info!(uuid = %uuid, pid, "Stopping VM");
        if let Err(e) = run("kill", &["-TERM", &pid.to_string()]).await {
            // Exited between the liveness check and the signal.
            if process_matches(pid, uuid).await {
                return Err(e);
            }
        }

        if !wait_for_exit(pid, uuid, self.stop_timeout).await {
            warn!(uuid = %uuid, pid, timeout = ?self.stop_timeout, "VM ignored SIGTERM, killing");
            if let Err(e) = run("kill", &["-KILL", &pid.to_string()]).await {
                if process_matches(pid, uuid).await {
                    return Err(e);
                }
            }
            if !wait_for_exit(pid, uuid, self.stop_timeout).await {
                return Err(HostError::CommandFailed {
                    command: format!("kill -KILL {}", pid),
                    stderr: "process still running".to_string(),
                });
            }
        }

        self.processes.lock().await.remove(&uuid);
        if let Err(e) = tokio::fs::remove_file(self.pidfile(uuid)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(uuid = %uuid, error = %e, "Failed to remove pidfile");
            }
        }
        debug!(uuid = %uuid, pid, "VM stopped");
        Ok(())
    }

    async fn is_running(&self, uuid: Uuid) -> Result<bool, HostError> {
        Ok(self.live_pid(uuid).await?.is_some())
    }
}
