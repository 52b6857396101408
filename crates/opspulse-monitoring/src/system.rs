//! Host system sampler built on `sysinfo`.
//!
//! Sampling runs on the blocking pool. A section that cannot be read
//! (memory, disk) keeps reporting its last good value so a flaky reading never
//! fails the whole snapshot.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use chrono::Utc;
use opspulse_kernel::metrics::{
    CollectError, DiskInfo, DiskUsage, GpuInfo, HardwareInfo, MemoryUsage, MetricsCategory,
    NetworkIo, SnapshotSource, SystemSnapshot, round2,
};
use parking_lot::Mutex;
use sysinfo::{Disks, Networks, System};
use tracing::{debug, warn};

use crate::error::{MonitoringError, MonitoringResult};

struct SamplerState {
    system: System,
    cpu_primed: bool,
    memory: MemoryUsage,
    disk: DiskUsage,
    net_totals: Option<(u64, u64)>,
    hardware: Option<HardwareInfo>,
}

/// Samples CPU, memory, disk, load and interface throughput.
#[derive(Clone)]
pub struct SystemSampler {
    state: Arc<Mutex<SamplerState>>,
    started: StdInstant,
}

impl SystemSampler {
    /// Fails when the platform is not supported by `sysinfo` or no CPU is
    /// visible to the process.
    pub fn new() -> MonitoringResult<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(MonitoringError::SamplerInit(format!(
                "platform '{}' is not supported",
                std::env::consts::OS
            )));
        }

        let mut system = System::new();
        system.refresh_cpu_all();
        if system.cpus().is_empty() {
            return Err(MonitoringError::SamplerInit("no CPU visible".to_string()));
        }

        debug!(cpus = system.cpus().len(), "System sampler initialized");
        Ok(Self {
            state: Arc::new(Mutex::new(SamplerState {
                system,
                cpu_primed: false,
                memory: MemoryUsage::default(),
                disk: DiskUsage::default(),
                net_totals: None,
                hardware: None,
            })),
            started: StdInstant::now(),
        })
    }

    pub async fn collect(&self) -> Result<SystemSnapshot, CollectError> {
        let state = Arc::clone(&self.state);
        let uptime_seconds = self.started.elapsed().as_secs();

        tokio::task::spawn_blocking(move || sample(&mut state.lock(), uptime_seconds))
            .await
            .map_err(|e| CollectError::unavailable(MetricsCategory::System, e.to_string()))
    }
}

#[async_trait]
impl SnapshotSource for SystemSampler {
    type Snapshot = SystemSnapshot;

    fn category(&self) -> MetricsCategory {
        MetricsCategory::System
    }

    async fn collect(&self) -> Result<SystemSnapshot, CollectError> {
        SystemSampler::collect(self).await
    }
}

fn sample(state: &mut SamplerState, uptime_seconds: u64) -> SystemSnapshot {
    state.system.refresh_cpu_usage();
    let cpu_percent = if state.cpu_primed {
        round2(f64::from(state.system.global_cpu_usage()))
    } else {
        state.cpu_primed = true;
        0.0
    };

    state.system.refresh_memory();
    match memory_usage(state.system.total_memory(), state.system.used_memory()) {
        Some(memory) => state.memory = memory,
        None => warn!("Memory totals unavailable, reporting last good value"),
    }

    let disks = Disks::new_with_refreshed_list();
    let root = root_disk(
        disks
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
    );
    match root {
        Some((total, available)) => state.disk = disk_usage(total, available),
        None => warn!("Root filesystem not found, reporting last disk usage"),
    }

    let networks = Networks::new_with_refreshed_list();
    let totals = networks
        .iter()
        .filter(|(name, _)| !name.starts_with("lo"))
        .fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });
    let network_io = network_delta(state.net_totals, totals);
    state.net_totals = Some(totals);

    if state.hardware.is_none() {
        state.hardware = Some(hardware_info(&state.system, &disks));
    }
    let hardware_info = state.hardware.clone().unwrap_or_default();

    let load = System::load_average();

    SystemSnapshot {
        timestamp: Utc::now(),
        cpu_percent,
        memory: state.memory,
        disk_usage: state.disk,
        uptime_seconds,
        os_uptime_seconds: System::uptime(),
        load_average: [load.one, load.five, load.fifteen],
        platform: std::env::consts::OS.to_string(),
        hostname: System::host_name().unwrap_or_default(),
        network_io,
        hardware_info,
    }
}

fn memory_usage(total: u64, used: u64) -> Option<MemoryUsage> {
    if total == 0 {
        return None;
    }
    let used = used.min(total);
    Some(MemoryUsage {
        total,
        used,
        free: total - used,
        usage_percent: round2(used as f64 / total as f64 * 100.0),
    })
}

fn disk_usage(total: u64, available: u64) -> DiskUsage {
    let free = available.min(total);
    let used = total - free;
    let percent = if total > 0 {
        round2(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    DiskUsage {
        total,
        used,
        free,
        percent,
    }
}

/// The disk mounted at `/`, or the largest one when nothing is mounted there.
fn root_disk<'a>(disks: impl Iterator<Item = (&'a Path, u64, u64)>) -> Option<(u64, u64)> {
    let mut largest: Option<(u64, u64)> = None;
    for (mount, total, available) in disks {
        if mount == Path::new("/") {
            return Some((total, available));
        }
        if largest.is_none_or(|(t, _)| total > t) {
            largest = Some((total, available));
        }
    }
    largest
}

/// Bytes moved since the previous sample. Counters that went backwards
/// (interface reset) count as zero.
fn network_delta(previous: Option<(u64, u64)>, current: (u64, u64)) -> NetworkIo {
    match previous {
        Some((rx, tx)) => NetworkIo {
            bytes_received: current.0.saturating_sub(rx),
            bytes_transmitted: current.1.saturating_sub(tx),
        },
        None => NetworkIo::default(),
    }
}

fn hardware_info(system: &System, disks: &Disks) -> HardwareInfo {
    let cpus = system.cpus();
    let (cpu_model, cpu_speed_mhz) = cpus
        .first()
        .map(|c| (c.brand().trim().to_string(), c.frequency()))
        .unwrap_or_default();

    HardwareInfo {
        cpu_model,
        cpu_cores: system.physical_core_count().unwrap_or(cpus.len()),
        cpu_threads: cpus.len(),
        cpu_speed_mhz,
        gpu: detect_gpus(),
        disks: disks
            .iter()
            .map(|d| DiskInfo {
                name: d.name().to_string_lossy().into_owned(),
                mount_point: d.mount_point().to_string_lossy().into_owned(),
                file_system: d.file_system().to_string_lossy().into_owned(),
                kind: format!("{:?}", d.kind()),
                total_bytes: d.total_space(),
                available_bytes: d.available_space(),
                removable: d.is_removable(),
            })
            .collect(),
    }
}

/// Best-effort GPU listing: `nvidia-smi` first, then DRM cards on Linux.
fn detect_gpus() -> Vec<GpuInfo> {
    let nvidia = std::process::Command::new("nvidia-smi")
        .arg("--query-gpu=name")
        .arg("--format=csv,noheader")
        .output();
    if let Ok(output) = nvidia {
        if output.status.success() {
            let gpus: Vec<GpuInfo> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .enumerate()
                .map(|(i, name)| GpuInfo {
                    card: format!("gpu{i}"),
                    vendor: "NVIDIA".to_string(),
                    device: name.to_string(),
                })
                .collect();
            if !gpus.is_empty() {
                return gpus;
            }
        }
    }

    drm_cards(Path::new("/sys/class/drm"))
}

fn drm_cards(root: &Path) -> Vec<GpuInfo> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut cards: Vec<GpuInfo> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let card = entry.file_name().to_string_lossy().into_owned();
            // card0, card1, ... but not connectors like card0-HDMI-A-1
            if !card.starts_with("card") || card.contains('-') {
                return None;
            }
            let device_dir = entry.path().join("device");
            let read = |name: &str| {
                std::fs::read_to_string(device_dir.join(name))
                    .map(|s| s.trim().to_string())
                    .ok()
            };
            Some(GpuInfo {
                vendor: pci_vendor_name(&read("vendor")?),
                device: read("device").unwrap_or_default(),
                card,
            })
        })
        .collect();
    cards.sort_by(|a, b| a.card.cmp(&b.card));
    cards
}

fn pci_vendor_name(id: &str) -> String {
    match id {
        "0x10de" => "NVIDIA".to_string(),
        "0x1002" => "AMD".to_string(),
        "0x8086" => "Intel".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_rejects_zero_total() {
        assert!(memory_usage(0, 0).is_none());
        let memory = memory_usage(1000, 250).unwrap();
        assert_eq!(memory.free, 750);
        assert_eq!(memory.usage_percent, 25.0);
    }

    #[test]
    fn disk_usage_clamps_available() {
        let disk = disk_usage(100, 150);
        assert_eq!(disk.used, 0);
        assert_eq!(disk.free, 100);

        let disk = disk_usage(400, 100);
        assert_eq!(disk.used, 300);
        assert_eq!(disk.percent, 75.0);
        assert_eq!(disk_usage(0, 0).percent, 0.0);
    }

    #[test]
    fn root_disk_prefers_slash_mount() {
        let disks = [
            (Path::new("/data"), 1000u64, 10u64),
            (Path::new("/"), 100, 50),
        ];
        assert_eq!(root_disk(disks.into_iter()), Some((100, 50)));

        let disks = [(Path::new("/a"), 10u64, 1u64), (Path::new("/b"), 30, 3)];
        assert_eq!(root_disk(disks.into_iter()), Some((30, 3)));

        assert_eq!(root_disk(std::iter::empty()), None);
    }

    #[test]
    fn network_delta_first_sample_is_zero() {
        assert_eq!(network_delta(None, (500, 700)), NetworkIo::default());

        let io = network_delta(Some((500, 700)), (800, 750));
        assert_eq!(io.bytes_received, 300);
        assert_eq!(io.bytes_transmitted, 50);

        // Counter reset
        let io = network_delta(Some((800, 750)), (10, 10));
        assert_eq!(io, NetworkIo::default());
    }

    #[test]
    fn drm_cards_reads_vendor_and_device() {
        let dir = tempfile::tempdir().unwrap();
        let card = dir.path().join("card0").join("device");
        std::fs::create_dir_all(&card).unwrap();
        std::fs::write(card.join("vendor"), "0x1002\n").unwrap();
        std::fs::write(card.join("device"), "0x73bf\n").unwrap();
        std::fs::create_dir_all(dir.path().join("card0-DP-1")).unwrap();
        std::fs::create_dir_all(dir.path().join("renderD128")).unwrap();

        let cards = drm_cards(dir.path());
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].card, "card0");
        assert_eq!(cards[0].vendor, "AMD");
        assert_eq!(cards[0].device, "0x73bf");
    }

    #[tokio::test]
    async fn first_sample_reports_zero_cpu_and_caches_hardware() {
        let Ok(sampler) = SystemSampler::new() else {
            // Host without visible CPUs; init failure is covered by the error type.
            return;
        };

        let first = sampler.collect().await.unwrap();
        assert_eq!(first.cpu_percent, 0.0);
        assert_eq!(first.network_io, NetworkIo::default());
        assert!(first.hardware_info.cpu_threads > 0);

        let second = sampler.collect().await.unwrap();
        assert!(second.cpu_percent >= 0.0 && second.cpu_percent <= 100.0);
        assert_eq!(first.hardware_info, second.hardware_info);
        assert_eq!(second.platform, std::env::consts::OS);
    }
}
